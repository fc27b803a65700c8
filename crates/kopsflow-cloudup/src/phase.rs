//! Apply phases

use crate::error::CloudupError;
use std::fmt;
use std::str::FromStr;

/// Stage of the apply pipeline a model builder belongs to.
///
/// Declaration order is apply order: with `--phase=security` the network
/// tasks are kept as references and cluster tasks are left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Network,
    Security,
    Cluster,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Network => "network",
            Phase::Security => "security",
            Phase::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = CloudupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "network" => Ok(Phase::Network),
            "security" => Ok(Phase::Security),
            "cluster" => Ok(Phase::Cluster),
            _ => Err(CloudupError::UnknownPhase(s.to_string())),
        }
    }
}

/// How a builder's tasks enter the task map under a phase filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Run,
    Reference,
    Skip,
}

pub fn inclusion(builder: Phase, filter: Option<Phase>) -> Inclusion {
    match filter {
        None => Inclusion::Run,
        Some(f) if builder == f => Inclusion::Run,
        Some(f) if builder < f => Inclusion::Reference,
        Some(_) => Inclusion::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("Security".parse::<Phase>().unwrap(), Phase::Security);
        assert!("iam".parse::<Phase>().is_err());
    }

    #[test]
    fn test_inclusion() {
        assert_eq!(inclusion(Phase::Cluster, None), Inclusion::Run);
        assert_eq!(inclusion(Phase::Network, Some(Phase::Security)), Inclusion::Reference);
        assert_eq!(inclusion(Phase::Security, Some(Phase::Security)), Inclusion::Run);
        assert_eq!(inclusion(Phase::Cluster, Some(Phase::Network)), Inclusion::Skip);
    }
}
