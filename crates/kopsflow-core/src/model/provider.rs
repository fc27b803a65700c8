use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Supported cloud providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Aws,
    Gce,
    Azure,
    Openstack,
    Vsphere,
    Digitalocean,
    Hetzner,
}

const DIGITALOCEAN_REGIONS: &[&str] = &[
    "nyc1", "nyc2", "nyc3", "sfo1", "sfo2", "sfo3", "ams2", "ams3", "sgp1", "lon1", "fra1",
    "tor1", "blr1", "syd1",
];
const HETZNER_LOCATIONS: &[&str] = &["fsn1", "nbg1", "hel1", "ash", "hil", "sin"];

fn aws_zone() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]?)?-[a-z]+-\d+[a-z]$").expect("static regex")
    })
}

fn gce_zone() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+-[a-z]+\d+-[a-z]$").expect("static regex"))
}

fn azure_zone() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+\d?-\d$").expect("static regex"))
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::Aws,
        ProviderId::Gce,
        ProviderId::Azure,
        ProviderId::Openstack,
        ProviderId::Vsphere,
        ProviderId::Digitalocean,
        ProviderId::Hetzner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Aws => "aws",
            ProviderId::Gce => "gce",
            ProviderId::Azure => "azure",
            ProviderId::Openstack => "openstack",
            ProviderId::Vsphere => "vsphere",
            ProviderId::Digitalocean => "digitalocean",
            ProviderId::Hetzner => "hetzner",
        }
    }

    /// Guess the provider from a zone name; `None` when the pattern is not
    /// specific to one provider
    pub fn infer_from_zone(zone: &str) -> Option<ProviderId> {
        if DIGITALOCEAN_REGIONS.contains(&zone) {
            return Some(ProviderId::Digitalocean);
        }
        if HETZNER_LOCATIONS.contains(&zone) {
            return Some(ProviderId::Hetzner);
        }
        if aws_zone().is_match(zone) {
            return Some(ProviderId::Aws);
        }
        if gce_zone().is_match(zone) {
            return Some(ProviderId::Gce);
        }
        if azure_zone().is_match(zone) {
            return Some(ProviderId::Azure);
        }
        None
    }

    /// Region a zone belongs to
    pub fn region_of_zone(&self, zone: &str) -> String {
        match self {
            ProviderId::Aws => zone
                .trim_end_matches(|c: char| c.is_ascii_lowercase())
                .to_string(),
            ProviderId::Gce => zone
                .rsplit_once('-')
                .map(|(r, _)| r.to_string())
                .unwrap_or_else(|| zone.to_string()),
            ProviderId::Azure => zone
                .rsplit_once('-')
                .map(|(r, _)| r.to_string())
                .unwrap_or_else(|| zone.to_string()),
            _ => zone.to_string(),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str() == lower || (lower == "do" && *p == ProviderId::Digitalocean))
            .ok_or_else(|| format!("unknown cloud provider {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_from_zone() {
        assert_eq!(ProviderId::infer_from_zone("us-test-1a"), Some(ProviderId::Aws));
        assert_eq!(ProviderId::infer_from_zone("us-east-1c"), Some(ProviderId::Aws));
        assert_eq!(ProviderId::infer_from_zone("us-gov-west-1a"), Some(ProviderId::Aws));
        assert_eq!(ProviderId::infer_from_zone("us-central1-a"), Some(ProviderId::Gce));
        assert_eq!(ProviderId::infer_from_zone("eastus-1"), Some(ProviderId::Azure));
        assert_eq!(ProviderId::infer_from_zone("nyc1"), Some(ProviderId::Digitalocean));
        assert_eq!(ProviderId::infer_from_zone("fsn1"), Some(ProviderId::Hetzner));
        assert_eq!(ProviderId::infer_from_zone("zone-one"), None);
    }

    #[test]
    fn test_region_of_zone() {
        assert_eq!(ProviderId::Aws.region_of_zone("us-test-1a"), "us-test-1");
        assert_eq!(ProviderId::Gce.region_of_zone("us-central1-a"), "us-central1");
        assert_eq!(ProviderId::Hetzner.region_of_zone("fsn1"), "fsn1");
    }

    #[test]
    fn test_parse() {
        assert_eq!("AWS".parse::<ProviderId>().unwrap(), ProviderId::Aws);
        assert_eq!("do".parse::<ProviderId>().unwrap(), ProviderId::Digitalocean);
        assert!("ibm".parse::<ProviderId>().is_err());
    }
}
