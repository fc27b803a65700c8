//! Apply targets

pub mod cloudformation;
pub mod terraform;

use crate::error::Result;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use cloudformation::CloudFormationTarget;
pub use terraform::{HclValue, TerraformTarget};

/// Where a task's changes go
pub enum Target {
    /// Cloud API calls
    Direct,
    /// HCL emitted to an output directory
    Terraform(TerraformTarget),
    /// A CloudFormation template emitted to an output directory
    CloudFormation(CloudFormationTarget),
    /// Changes recorded, nothing mutated
    DryRun,
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Direct => TargetKind::Direct,
            Target::Terraform(_) => TargetKind::Terraform,
            Target::CloudFormation(_) => TargetKind::CloudFormation,
            Target::DryRun => TargetKind::DryRun,
        }
    }

    /// Emitting targets treat every cloud resource as absent
    pub fn reads_cloud(&self) -> bool {
        matches!(self, Target::Direct | Target::DryRun)
    }

    /// Write emitted artifacts; returns the files written
    pub async fn finish(&self) -> Result<Vec<PathBuf>> {
        match self {
            Target::Terraform(tf) => tf.finish().await,
            Target::CloudFormation(cf) => cf.finish().await,
            Target::Direct | Target::DryRun => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Direct,
    Terraform,
    CloudFormation,
    DryRun,
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direct" => Ok(TargetKind::Direct),
            "terraform" => Ok(TargetKind::Terraform),
            "cloudformation" => Ok(TargetKind::CloudFormation),
            "dryrun" => Ok(TargetKind::DryRun),
            other => Err(format!(
                "unsupported target {other:?}; expected direct, terraform, cloudformation or dryrun"
            )),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::Direct => "direct",
            TargetKind::Terraform => "terraform",
            TargetKind::CloudFormation => "cloudformation",
            TargetKind::DryRun => "dryrun",
        };
        write!(f, "{s}")
    }
}
