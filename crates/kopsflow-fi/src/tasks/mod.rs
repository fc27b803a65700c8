//! Concrete tasks

pub mod cloud;
pub mod compute;
pub mod files;
pub mod network;
pub mod pki;
pub mod security;

pub use compute::{AutoscalingGroup, LaunchTemplate, MixedInstancesPolicy};
pub use files::ManagedFile;
pub use network::{InternetGateway, RouteTable, Subnet, Vpc};
pub use pki::{GeneratedSecret, Keypair};
pub use security::{SecurityGroup, SecurityGroupRule, SshKey};

/// Task type names, the first half of every task key
pub mod types {
    pub const VPC: &str = "Vpc";
    pub const SUBNET: &str = "Subnet";
    pub const INTERNET_GATEWAY: &str = "InternetGateway";
    pub const ROUTE_TABLE: &str = "RouteTable";
    pub const SECURITY_GROUP: &str = "SecurityGroup";
    pub const SECURITY_GROUP_RULE: &str = "SecurityGroupRule";
    pub const SSH_KEY: &str = "SshKey";
    pub const LAUNCH_TEMPLATE: &str = "LaunchTemplate";
    pub const AUTOSCALING_GROUP: &str = "AutoscalingGroup";
    pub const MANAGED_FILE: &str = "ManagedFile";
    pub const KEYPAIR: &str = "Keypair";
    pub const SECRET: &str = "Secret";
}
