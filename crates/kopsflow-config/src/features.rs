//! `KOPS_FEATURE_FLAGS` parsing

use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;

pub const FEATURE_FLAGS_ENV: &str = "KOPS_FEATURE_FLAGS";

/// Flags this build knows about, with their defaults
const KNOWN_FLAGS: &[(&str, bool)] = &[
    ("Terraform-Parallelism", false),
    ("SpecOverrideFlag", false),
    ("VPCSkipEnableDNSSupport", false),
    ("SkipEtcdVersionCheck", false),
    ("AWSIPv6", false),
    ("Karpenter", false),
];

/// Feature toggles carried through the factory.
///
/// Parsed from a comma list where `Name` and `+Name` enable a flag and
/// `-Name` disables it. Unknown names are kept (and logged) so a newer
/// flag set does not break an older binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    flags: BTreeMap<String, bool>,
}

impl FeatureFlags {
    pub fn from_env() -> Result<Self> {
        match std::env::var(FEATURE_FLAGS_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let mut flags = BTreeMap::new();
        for raw in spec.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (name, enabled) = if let Some(name) = raw.strip_prefix('+') {
                (name, true)
            } else if let Some(name) = raw.strip_prefix('-') {
                (name, false)
            } else {
                (raw, true)
            };
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(ConfigError::InvalidFeatureFlag(raw.to_string()));
            }
            if !KNOWN_FLAGS.iter().any(|(known, _)| *known == name) {
                tracing::warn!("Unknown feature flag {:?}", name);
            }
            flags.insert(name.to_string(), enabled);
        }
        Ok(Self { flags })
    }

    pub fn enabled(&self, name: &str) -> bool {
        if let Some(value) = self.flags.get(name) {
            return *value;
        }
        KNOWN_FLAGS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, default)| *default)
            .unwrap_or(false)
    }

    pub fn set(&mut self, name: impl Into<String>, enabled: bool) {
        self.flags.insert(name.into(), enabled);
    }
}
