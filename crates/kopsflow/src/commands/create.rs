use crate::GlobalArgs;
use crate::commands::update::{self, UpdateClusterArgs};
use crate::output::{self, OutputFormat, Table};
use crate::utils;
use anyhow::{anyhow, bail};
use clap::Args;
use colored::Colorize;
use kopsflow_cloudup::{NewClusterOptions, new_cluster, validate_new_cluster};
use kopsflow_core::validation::validate_instance_group;
use kopsflow_core::{
    InstanceGroup, InstanceGroupRole, LoadBalancerType, ProviderId, SubnetType, TopologyKind,
    completion,
};
use kopsflow_fi::TargetKind;
use kopsflow_pki::{
    CertType, Certificate, IssueRequest, Keystore, PrivateKey, Secret, SecretStore, Subject,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct CreateClusterArgs {
    /// Cluster name (or --name)
    pub cluster: Option<String>,
    /// Zones to run the cluster in
    #[arg(long, value_delimiter = ',', required = true)]
    pub zones: Vec<String>,
    /// Zones for the control plane (defaults to one in the first zone)
    #[arg(long, alias = "master-zones", value_delimiter = ',')]
    pub control_plane_zones: Vec<String>,
    /// Number of control-plane instances
    #[arg(long, alias = "master-count")]
    pub control_plane_count: Option<usize>,
    /// Number of worker nodes
    #[arg(long)]
    pub node_count: Option<i32>,
    /// Machine type for control-plane instances
    #[arg(long, alias = "master-size")]
    pub control_plane_size: Option<String>,
    /// Machine type for worker nodes
    #[arg(long)]
    pub node_size: Option<String>,
    /// Machine image for every instance group
    #[arg(long)]
    pub image: Option<String>,
    /// Cloud provider (inferred from the zones when omitted)
    #[arg(long)]
    pub cloud: Option<ProviderId>,
    /// Release channel
    #[arg(long)]
    pub channel: Option<String>,
    #[arg(long)]
    pub kubernetes_version: Option<String>,
    /// Pod networking, e.g. cilium, calico, kubenet
    #[arg(long)]
    pub networking: Option<String>,
    #[arg(long)]
    pub network_cidr: Option<String>,
    /// Existing VPC to create the cluster in
    #[arg(long)]
    pub vpc: Option<String>,
    /// Existing subnet ids, one per zone
    #[arg(long, value_delimiter = ',')]
    pub subnets: Vec<String>,
    /// public or private
    #[arg(short = 't', long, default_value = "public")]
    pub topology: String,
    /// Front SSH access with a bastion group (private topology only)
    #[arg(long)]
    pub bastion: bool,
    /// Public or Internal
    #[arg(long)]
    pub api_loadbalancer_type: Option<String>,
    /// CIDRs allowed to reach the API
    #[arg(long, value_delimiter = ',')]
    pub admin_access: Vec<String>,
    /// CIDRs allowed to SSH (defaults to --admin-access)
    #[arg(long, value_delimiter = ',')]
    pub ssh_access: Vec<String>,
    /// key=value labels for every cloud resource
    #[arg(long, value_delimiter = ',')]
    pub cloud_labels: Vec<String>,
    /// SSH public key to install (defaults to ~/.ssh/id_rsa.pub when present)
    #[arg(short = 'i', long)]
    pub ssh_public_key: Option<PathBuf>,
    /// Print the generated objects instead of storing them
    #[arg(long)]
    pub dry_run: bool,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,
    /// Create the cloud resources right away
    #[arg(short, long)]
    pub yes: bool,
    #[arg(long, default_value = "direct")]
    pub target: TargetKind,
    /// Output directory for terraform and cloudformation targets
    #[arg(long)]
    pub out: Option<PathBuf>,
}

fn parse_topology(s: &str) -> anyhow::Result<TopologyKind> {
    match s.to_ascii_lowercase().as_str() {
        "public" => Ok(TopologyKind::Public),
        "private" => Ok(TopologyKind::Private),
        other => bail!("invalid topology {other:?}; expected public or private"),
    }
}

fn parse_lb_type(s: &str) -> anyhow::Result<LoadBalancerType> {
    match s.to_ascii_lowercase().as_str() {
        "public" => Ok(LoadBalancerType::Public),
        "internal" => Ok(LoadBalancerType::Internal),
        other => bail!("invalid API load balancer type {other:?}; expected public or internal"),
    }
}

fn parse_labels(entries: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| anyhow!("expected key=value, got {entry:?}"))
        })
        .collect()
}

pub async fn handle_cluster(
    global: &GlobalArgs,
    args: CreateClusterArgs,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(args.cluster.clone(), global)?;

    let opts = NewClusterOptions {
        name: name.clone(),
        cloud_provider: args.cloud,
        zones: args.zones.clone(),
        control_plane_zones: args.control_plane_zones.clone(),
        control_plane_count: args.control_plane_count,
        node_count: args.node_count,
        control_plane_size: args.control_plane_size.clone(),
        node_size: args.node_size.clone(),
        image: args.image.clone(),
        channel: args.channel.clone(),
        kubernetes_version: args.kubernetes_version.clone(),
        networking: args.networking.clone(),
        network_cidr: args.network_cidr.clone(),
        network_id: args.vpc.clone(),
        subnet_ids: args.subnets.clone(),
        topology: parse_topology(&args.topology)?,
        bastion: args.bastion,
        api_load_balancer: args.api_loadbalancer_type.as_deref().map(parse_lb_type).transpose()?,
        admin_access: args.admin_access.clone(),
        ssh_access: args.ssh_access.clone(),
        cloud_labels: parse_labels(&args.cloud_labels)?,
    };
    let result = new_cluster(&opts)?;

    let ssh_key = utils::read_ssh_public_key(args.ssh_public_key.as_deref())?;
    let fingerprint = ssh_key
        .as_ref()
        .map(|k| k.fingerprint())
        .transpose()?
        .map(|f| f.replace(':', ""));
    validate_new_cluster(&result, fingerprint.as_deref())?;

    if args.dry_run {
        return output::print_objects(std::slice::from_ref(&result.cluster), &result.instance_groups, args.output);
    }

    let session = utils::session(global).await?;
    if session.clientset.get_cluster(&name).await?.is_some() {
        bail!("cluster {name:?} already exists; use kops update cluster to change it");
    }

    println!("{}", format!("Creating cluster {}...", name).blue());
    let cluster = session.clientset.create_cluster(&result.cluster).await?;
    let ig_client = session.clientset.instance_groups_for(&cluster);
    for ig in &result.instance_groups {
        ig_client.create(ig).await?;
    }
    if let Some(key) = &ssh_key {
        let fingerprint = session
            .clientset
            .ssh_credential_store(&cluster)
            .add_ssh_public_key(key)
            .await?;
        tracing::info!(fingerprint = %fingerprint, "Added SSH public key");
    }

    println!("{}", "✓ Cluster configuration has been created.".green().bold());
    println!();
    let mut table = Table::new(&["INSTANCE GROUP", "ROLE", "SUBNETS"]);
    for ig in &result.instance_groups {
        table.row(vec![
            ig.name().to_string(),
            ig.role().to_string(),
            ig.spec.subnets.join(","),
        ]);
    }
    table.print();

    if args.yes {
        println!();
        let update_args = UpdateClusterArgs::apply_now(name, args.target, args.out);
        return update::handle(global, update_args, cancel).await;
    }

    println!();
    println!("Suggestions:");
    println!(" * list clusters with: {}", "kops get cluster".cyan());
    println!(" * edit this cluster with: {}", format!("kops set cluster --name {name} spec.<field>=<value>").cyan());
    if ssh_key.is_none() {
        println!(
            " * add an SSH key with: {}",
            format!("kops create sshpublickey --name {name} -i ~/.ssh/id_rsa.pub").cyan()
        );
    }
    println!();
    println!("Finally configure your cluster with: {}", format!("kops update cluster --name {name} --yes").cyan());
    Ok(())
}

#[derive(Args, Debug, Clone)]
pub struct CreateInstanceGroupArgs {
    /// Instance group name
    pub group: String,
    /// ControlPlane, APIServer, Node or Bastion
    #[arg(long, default_value = "Node")]
    pub role: String,
    /// Cluster subnets to place instances in (defaults to every zone subnet)
    #[arg(long = "subnet", value_delimiter = ',')]
    pub subnets: Vec<String>,
    #[arg(long)]
    pub min_size: Option<i32>,
    #[arg(long)]
    pub max_size: Option<i32>,
    #[arg(long)]
    pub machine_type: Option<String>,
    #[arg(long)]
    pub image: Option<String>,
    /// Print the group instead of storing it
    #[arg(long)]
    pub dry_run: bool,
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
    pub output: OutputFormat,
}

pub async fn handle_instance_group(global: &GlobalArgs, args: CreateInstanceGroupArgs) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;

    let role = InstanceGroupRole::parse(&args.role).ok_or_else(|| anyhow!("unknown role {:?}", args.role))?;
    let mut ig = InstanceGroup::new(&args.group, role);
    ig.spec.subnets = if args.subnets.is_empty() {
        // Bastions live in the utility subnets, everything else outside them
        let wants_utility = role == InstanceGroupRole::Bastion;
        cluster
            .spec
            .subnets
            .iter()
            .filter(|s| (s.subnet_type == SubnetType::Utility) == wants_utility)
            .map(|s| s.name.clone())
            .collect()
    } else {
        args.subnets.clone()
    };
    ig.spec.min_size = args.min_size;
    ig.spec.max_size = args.max_size;
    ig.spec.machine_type = args.machine_type.clone();
    ig.spec.image = args.image.clone();

    let errors = validate_instance_group(&ig, Some(&cluster), false);
    if !errors.is_empty() {
        bail!("{}", kopsflow_core::CoreError::from(errors));
    }
    // Completion must succeed for update cluster to accept the group later
    completion::complete_instance_group(&cluster, &ig)?;

    if args.dry_run {
        return output::print_objects(&[], std::slice::from_ref(&ig), args.output);
    }
    session.clientset.instance_groups_for(&cluster).create(&ig).await?;
    println!(
        "{} {}",
        "✓ Created instance group".green().bold(),
        ig.name().cyan()
    );
    println!();
    println!("To apply it: {}", format!("kops update cluster --name {name} --yes").cyan());
    Ok(())
}

pub async fn handle_keypair(
    global: &GlobalArgs,
    keyset: &str,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    primary: bool,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let keystore = session.clientset.key_store(&cluster);

    let item = match (cert, key) {
        (Some(cert), key) => {
            let certificate = Certificate::from_pem(utils::read_file(&cert)?)?;
            let private_key = key
                .map(|k| utils::read_file(&k).and_then(|pem| Ok(PrivateKey::from_pem(pem)?)))
                .transpose()?;
            keystore.import_item(keyset, certificate, private_key, primary).await?
        }
        (None, Some(_)) => bail!("--key requires --cert"),
        (None, None) => {
            keystore
                .issue(&IssueRequest {
                    keyset: keyset.to_string(),
                    signer: None,
                    cert_type: CertType::Ca,
                    subject: Subject::cn(keyset),
                    alternate_names: vec![],
                    validity_days: None,
                    primary,
                })
                .await?
        }
    };

    let state = if primary { "primary" } else { "staged" };
    println!(
        "{} {} {} ({})",
        "✓ Added item".green().bold(),
        item.id.cyan(),
        format!("to keyset {keyset}").green(),
        state
    );
    Ok(())
}

pub async fn handle_secret(
    global: &GlobalArgs,
    secret_name: &str,
    value: Option<String>,
    from_file: Option<PathBuf>,
    force: bool,
) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;
    let store = session.clientset.secret_store(&cluster);

    let secret = match (value, from_file) {
        (Some(value), _) => Secret::new(value),
        (None, Some(path)) => Secret::new(std::fs::read(&path)?),
        (None, None) => Secret::generate(),
    };

    if force {
        store.replace_secret(secret_name, &secret).await?;
    } else {
        let (_, created) = store.get_or_create_secret(secret_name, secret).await?;
        if !created {
            bail!("secret {secret_name:?} already exists; use --force to replace it");
        }
    }
    println!("{} {}", "✓ Stored secret".green().bold(), secret_name.cyan());
    Ok(())
}

pub async fn handle_ssh_public_key(global: &GlobalArgs, path: Option<PathBuf>) -> anyhow::Result<()> {
    let name = utils::cluster_name(None, global)?;
    let session = utils::session(global).await?;
    let cluster = session.clientset.require_cluster(&name).await?;

    let key = utils::read_ssh_public_key(path.as_deref())?
        .ok_or_else(|| anyhow!("no SSH public key given and ~/.ssh/id_rsa.pub does not exist"))?;
    let fingerprint = session
        .clientset
        .ssh_credential_store(&cluster)
        .add_ssh_public_key(&key)
        .await?;
    println!("{} {}", "✓ Added SSH public key".green().bold(), fingerprint.cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels(&["team=infra".into(), "env = prod".into()]).unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert!(parse_labels(&["novalue".into()]).is_err());
    }

    #[test]
    fn test_parse_topology() {
        assert_eq!(parse_topology("Private").unwrap(), TopologyKind::Private);
        assert!(parse_topology("hybrid").is_err());
        assert_eq!(parse_lb_type("internal").unwrap(), LoadBalancerType::Internal);
    }
}
