use crate::GlobalArgs;
use anyhow::{Context, anyhow};
use colored::Colorize;
use kopsflow_cloud::NodeInfo;
use kopsflow_cloudup::{HashResolver, RemoteHashResolver};
use kopsflow_config::FeatureFlags;
use kopsflow_core::{Cluster, Factory, InstanceGroup, VfsClientset};
use kopsflow_pki::SshPublicKey;
use kopsflow_rollout::{Confirm, KubeClient, KubeRsClient, Node};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// State store access for one command
pub struct Session {
    pub factory: Factory,
    pub clientset: VfsClientset,
}

pub async fn session(global: &GlobalArgs) -> anyhow::Result<Session> {
    let state = kopsflow_config::resolve_state_store(global.state.as_deref())?;
    tracing::debug!(state = %state, "Using state store");
    let factory = Factory::new(state, FeatureFlags::from_env()?);
    let clientset = factory.clientset().await?;
    Ok(Session { factory, clientset })
}

impl Session {
    /// The stored cluster and its instance groups, uncompleted
    pub async fn load(&self, name: &str) -> anyhow::Result<(Cluster, Vec<InstanceGroup>)> {
        let cluster = self.clientset.require_cluster(name).await?;
        let instance_groups = self.clientset.instance_groups_for(&cluster).list().await?;
        Ok((cluster, instance_groups))
    }

    pub fn hash_resolver(&self) -> anyhow::Result<Arc<dyn HashResolver>> {
        Ok(Arc::new(RemoteHashResolver::new(self.factory.vfs().clone())?))
    }
}

/// Cluster name from the positional argument or `--name`
pub fn cluster_name(positional: Option<String>, global: &GlobalArgs) -> anyhow::Result<String> {
    match (positional, &global.name) {
        (Some(arg), Some(flag)) if &arg != flag => Err(anyhow!(
            "cluster name given twice: {arg} and --name={flag}"
        )),
        (Some(arg), _) => Ok(arg),
        (None, Some(flag)) => Ok(flag.clone()),
        (None, None) => Err(anyhow!(
            "cluster name is required; pass it as an argument, with --name or KOPS_CLUSTER_NAME"
        )),
    }
}

/// Kubernetes client for the current kubeconfig context.
///
/// `KUBECONFIG` wins; otherwise the `kubeconfig` entry of the user config
/// file, then the client library default.
pub async fn kube_client() -> anyhow::Result<Arc<dyn KubeClient>> {
    let client = match configured_kubeconfig()? {
        Some(path) => KubeRsClient::from_kubeconfig_file(Path::new(&path), None).await?,
        None => KubeRsClient::from_kubeconfig(None).await?,
    };
    Ok(Arc::new(client))
}

/// The user config's kubeconfig, unless `KUBECONFIG` is set
fn configured_kubeconfig() -> anyhow::Result<Option<String>> {
    if std::env::var("KUBECONFIG").is_ok_and(|v| !v.is_empty()) {
        return Ok(None);
    }
    Ok(kopsflow_config::load_user_config()?.kubeconfig)
}

pub async fn node_infos(kube: &dyn KubeClient) -> anyhow::Result<Vec<NodeInfo>> {
    Ok(kube.list_nodes().await?.iter().map(Node::info).collect())
}

/// clap value parser for `10m`, `1h30m` and the like
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn default_ssh_public_key() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa.pub"))
        .filter(|p| p.exists())
}

/// Read an SSH public key; with no path, `~/.ssh/id_rsa.pub` when present
pub fn read_ssh_public_key(path: Option<&Path>) -> anyhow::Result<Option<SshPublicKey>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_ssh_public_key() {
            Some(p) => p,
            None => return Ok(None),
        },
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read SSH public key {}", path.display()))?;
    Ok(Some(SshPublicKey::parse(&text)?))
}

pub fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

pub fn print_yes_hint(command: &str) {
    println!();
    println!("{}", format!("Must specify --yes to {command}.").yellow());
}

/// Asks on the terminal before each instance is replaced
pub struct PromptConfirm;

impl Confirm for PromptConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} [y/N]: ", prompt);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}
