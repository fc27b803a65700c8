mod commands;
mod fieldpath;
mod output;
mod utils;

use clap::{ArgAction, Args, Parser, Subcommand};
use commands::create::{CreateClusterArgs, CreateInstanceGroupArgs};
use commands::rolling_update::RollingUpdateArgs;
use commands::update::UpdateClusterArgs;
use output::OutputFormat;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kops")]
#[command(about = "Create, upgrade and roll self-managed Kubernetes clusters", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Location of state storage (s3://bucket, file:///path, memfs://name)
    #[arg(long, global = true, env = "KOPS_STATE_STORE")]
    pub state: Option<String>,
    /// Name of the cluster
    #[arg(long, global = true, env = "KOPS_CLUSTER_NAME")]
    pub name: Option<String>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a resource
    #[command(subcommand)]
    Create(CreateCommands),
    /// Display one or many resources
    #[command(subcommand)]
    Get(GetCommands),
    /// Set fields on a cluster or instance group
    #[command(subcommand)]
    Set(SetCommands),
    /// Unset fields on a cluster or instance group
    #[command(subcommand)]
    Unset(UnsetCommands),
    /// Apply the stored configuration to the cloud
    #[command(subcommand)]
    Update(UpdateCommands),
    /// Replace instances whose configuration is out of date
    #[command(subcommand)]
    RollingUpdate(RollingUpdateCommands),
    /// Update and roll the control plane, then the nodes
    #[command(subcommand)]
    Reconcile(ReconcileCommands),
    /// Check that the cluster is healthy
    #[command(subcommand)]
    Validate(ValidateCommands),
    /// Delete a resource
    #[command(subcommand)]
    Delete(DeleteCommands),
    /// Rotate keypairs and secrets
    #[command(subcommand)]
    Rotate(RotateCommands),
    /// Make a staged keypair item primary
    #[command(subcommand)]
    Promote(PromoteCommands),
    /// Mark keypair items as no longer trusted
    #[command(subcommand)]
    Distrust(DistrustCommands),
    /// Trust previously distrusted keypair items again
    #[command(subcommand)]
    Trust(TrustCommands),
    /// Replace clusters and instance groups from a manifest
    Replace {
        /// Manifest with Cluster and InstanceGroup documents
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
        /// Create objects that do not exist yet
        #[arg(long)]
        force: bool,
    },
    /// Print the client version
    Version,
}

#[derive(Subcommand)]
enum CreateCommands {
    /// Create a cluster and its default instance groups
    Cluster(CreateClusterArgs),
    /// Create an instance group
    #[command(alias = "ig")]
    Instancegroup(CreateInstanceGroupArgs),
    /// Add a CA certificate to a keyset
    Keypair {
        /// Keyset name, e.g. kubernetes-ca
        keyset: String,
        /// PEM certificate to import
        #[arg(long)]
        cert: Option<PathBuf>,
        /// PEM private key matching --cert
        #[arg(long)]
        key: Option<PathBuf>,
        /// Make the new item primary
        #[arg(long)]
        primary: bool,
    },
    /// Store a secret
    Secret {
        /// Secret name
        secret: String,
        /// Secret value (generated when neither --value nor --from-file is given)
        #[arg(long, conflicts_with = "from_file")]
        value: Option<String>,
        /// Read the secret value from a file
        #[arg(long)]
        from_file: Option<PathBuf>,
        /// Overwrite an existing secret
        #[arg(long)]
        force: bool,
    },
    /// Register an SSH public key with the cluster
    Sshpublickey {
        /// Public key file (defaults to ~/.ssh/id_rsa.pub)
        #[arg(short = 'i', long = "ssh-public-key")]
        ssh_public_key: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum GetCommands {
    /// Cluster, instance groups and keypairs of one cluster
    All {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Clusters in the state store
    #[command(alias = "cluster")]
    Clusters {
        /// Only these clusters
        clusters: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Instance groups of a cluster
    #[command(aliases = ["instancegroup", "ig"])]
    Instancegroups {
        /// Only these instance groups
        groups: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Keypairs of a cluster
    #[command(alias = "keypair")]
    Keypairs {
        /// Only these keysets
        keysets: Vec<String>,
        /// Include distrusted items
        #[arg(long)]
        distrusted: bool,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Secrets of a cluster
    #[command(alias = "secret")]
    Secrets {
        /// Only these secrets
        secrets: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// SSH public keys registered with a cluster
    #[command(alias = "sshpublickey")]
    Sshpublickeys {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Files and images the cluster downloads
    Assets {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Cloud instances of a cluster
    #[command(alias = "instance")]
    Instances {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Addon manifests stored for a cluster
    #[command(alias = "addon")]
    Addons {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Subcommand)]
enum SetCommands {
    /// Set cluster fields, e.g. spec.kubernetesVersion=1.31.4
    Cluster {
        /// path=value assignments
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Set instance group fields, e.g. spec.maxSize=5
    #[command(alias = "ig")]
    Instancegroup {
        group: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[derive(Subcommand)]
enum UnsetCommands {
    /// Unset cluster fields
    Cluster {
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Unset instance group fields
    #[command(alias = "ig")]
    Instancegroup {
        group: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[derive(Subcommand)]
enum UpdateCommands {
    /// Create or update cloud resources to match the cluster spec
    Cluster(UpdateClusterArgs),
}

#[derive(Subcommand)]
enum RollingUpdateCommands {
    /// Replace out-of-date instances of a cluster
    Cluster(RollingUpdateArgs),
}

#[derive(Subcommand)]
enum ReconcileCommands {
    /// Update and roll a cluster in control-plane-first order
    Cluster {
        cluster: Option<String>,
        /// Apply changes; without it only a preview is printed
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ValidateCommands {
    /// Validate a running cluster
    Cluster {
        cluster: Option<String>,
        /// Keep validating until the cluster passes or this much time has passed
        #[arg(long, value_parser = utils::parse_duration)]
        wait: Option<std::time::Duration>,
        /// Consecutive passes required with --wait
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(Subcommand)]
enum DeleteCommands {
    /// Delete a cluster's cloud resources and registry entry
    Cluster {
        cluster: Option<String>,
        #[arg(short, long)]
        yes: bool,
        /// Only remove the cluster from the state store
        #[arg(long)]
        unregister: bool,
    },
    /// Delete a single cloud instance
    Instance {
        /// Instance id or node name
        instance: String,
        #[arg(short, long)]
        yes: bool,
        /// Leave the instance running, detached from its group
        #[arg(long)]
        surge: bool,
        /// Skip draining the node
        #[arg(long)]
        cloudonly: bool,
    },
    /// Delete an instance group and its cloud group
    #[command(alias = "ig")]
    Instancegroup {
        group: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete one item of a keyset
    Keypair {
        keyset: String,
        id: String,
    },
    /// Remove the cluster's SSH public keys
    Sshpublickey {
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete a secret
    Secret {
        secret: String,
    },
}

#[derive(Subcommand)]
enum RotateCommands {
    /// Rotate CA keysets: stage, roll, promote, roll and distrust
    Keypair {
        /// `ca` (all CA keysets) or a keyset name; repeatable
        #[arg(required = true)]
        keysets: Vec<String>,
        #[arg(short, long)]
        yes: bool,
    },
    /// Rotate a secret
    Secret {
        /// Only service-account is supported
        secret: String,
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum PromoteCommands {
    /// Make a keyset item primary
    Keypair {
        keyset: String,
        /// Item id (the newest staged item by default)
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum DistrustCommands {
    /// Distrust keyset items
    Keypair {
        keyset: String,
        /// Item ids (every non-primary item by default)
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TrustCommands {
    /// Trust distrusted keyset items again
    Keypair {
        keyset: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; stopping after the current step");
                cancel.cancel();
            }
        });
    }

    let global = cli.global;
    match cli.command {
        Commands::Create(cmd) => match cmd {
            CreateCommands::Cluster(args) => commands::create::handle_cluster(&global, args, cancel).await?,
            CreateCommands::Instancegroup(args) => {
                commands::create::handle_instance_group(&global, args).await?
            }
            CreateCommands::Keypair {
                keyset,
                cert,
                key,
                primary,
            } => commands::create::handle_keypair(&global, &keyset, cert, key, primary).await?,
            CreateCommands::Secret {
                secret,
                value,
                from_file,
                force,
            } => commands::create::handle_secret(&global, &secret, value, from_file, force).await?,
            CreateCommands::Sshpublickey { ssh_public_key } => {
                commands::create::handle_ssh_public_key(&global, ssh_public_key).await?
            }
        },
        Commands::Get(cmd) => match cmd {
            GetCommands::All { output } => commands::get::handle_all(&global, output).await?,
            GetCommands::Clusters { clusters, output } => {
                commands::get::handle_clusters(&global, &clusters, output).await?
            }
            GetCommands::Instancegroups { groups, output } => {
                commands::get::handle_instance_groups(&global, &groups, output).await?
            }
            GetCommands::Keypairs {
                keysets,
                distrusted,
                output,
            } => commands::get::handle_keypairs(&global, &keysets, distrusted, output).await?,
            GetCommands::Secrets { secrets, output } => {
                commands::get::handle_secrets(&global, &secrets, output).await?
            }
            GetCommands::Sshpublickeys { output } => {
                commands::get::handle_ssh_public_keys(&global, output).await?
            }
            GetCommands::Assets { output } => commands::get::handle_assets(&global, output).await?,
            GetCommands::Instances { output } => commands::get::handle_instances(&global, output).await?,
            GetCommands::Addons { output } => commands::get::handle_addons(&global, output).await?,
        },
        Commands::Set(cmd) => match cmd {
            SetCommands::Cluster { fields } => commands::set::handle_cluster(&global, &fields, false).await?,
            SetCommands::Instancegroup { group, fields } => {
                commands::set::handle_instance_group(&global, &group, &fields, false).await?
            }
        },
        Commands::Unset(cmd) => match cmd {
            UnsetCommands::Cluster { fields } => commands::set::handle_cluster(&global, &fields, true).await?,
            UnsetCommands::Instancegroup { group, fields } => {
                commands::set::handle_instance_group(&global, &group, &fields, true).await?
            }
        },
        Commands::Update(UpdateCommands::Cluster(args)) => {
            commands::update::handle(&global, args, cancel).await?
        }
        Commands::RollingUpdate(RollingUpdateCommands::Cluster(args)) => {
            commands::rolling_update::handle(&global, args, cancel).await?
        }
        Commands::Reconcile(ReconcileCommands::Cluster { cluster, yes }) => {
            commands::reconcile::handle(&global, cluster, yes, cancel).await?
        }
        Commands::Validate(ValidateCommands::Cluster {
            cluster,
            wait,
            count,
            output,
        }) => {
            let passed = commands::validate::handle(&global, cluster, wait, count, output, cancel).await?;
            if !passed {
                std::process::exit(2);
            }
        }
        Commands::Delete(cmd) => match cmd {
            DeleteCommands::Cluster {
                cluster,
                yes,
                unregister,
            } => commands::delete::handle_cluster(&global, cluster, yes, unregister, cancel).await?,
            DeleteCommands::Instance {
                instance,
                yes,
                surge,
                cloudonly,
            } => commands::delete::handle_instance(&global, &instance, yes, surge, cloudonly, cancel).await?,
            DeleteCommands::Instancegroup { group, yes } => {
                commands::delete::handle_instance_group(&global, &group, yes).await?
            }
            DeleteCommands::Keypair { keyset, id } => {
                commands::delete::handle_keypair(&global, &keyset, &id).await?
            }
            DeleteCommands::Sshpublickey { yes } => {
                commands::delete::handle_ssh_public_key(&global, yes).await?
            }
            DeleteCommands::Secret { secret } => commands::delete::handle_secret(&global, &secret).await?,
        },
        Commands::Rotate(cmd) => match cmd {
            RotateCommands::Keypair { keysets, yes } => {
                commands::rotate::handle_keypair(&global, &keysets, yes, cancel).await?
            }
            RotateCommands::Secret { secret, yes } => {
                commands::rotate::handle_secret(&global, &secret, yes, cancel).await?
            }
        },
        Commands::Promote(PromoteCommands::Keypair { keyset, id }) => {
            commands::keypair::handle_promote(&global, &keyset, id).await?
        }
        Commands::Distrust(DistrustCommands::Keypair { keyset, ids }) => {
            commands::keypair::handle_distrust(&global, &keyset, &ids).await?
        }
        Commands::Trust(TrustCommands::Keypair { keyset, ids }) => {
            commands::keypair::handle_trust(&global, &keyset, &ids).await?
        }
        Commands::Replace { filename, force } => commands::replace::handle(&global, &filename, force).await?,
        Commands::Version => println!("kops {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}
