mod commands;
mod remover;
mod state;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use capstan_remote::{AuthMethod, SshClient};
use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "capstan")]
#[command(about = "Provision and manage k3s nodes over SSH", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Override the state file location
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage a cluster-forming server node
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Manage a cluster-joining agent node
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
}

#[derive(Args, Debug)]
pub(crate) struct Connection {
    /// Hostname or address of the target node
    #[arg(long)]
    pub host: String,

    /// SSH port
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// SSH user; must have passwordless sudo on the node
    #[arg(long)]
    pub user: String,

    #[command(flatten)]
    auth: Auth,

    /// Passphrase for an encrypted private key
    #[arg(long, env = "CAPSTAN_KEY_PASSPHRASE", hide_env_values = true)]
    key_passphrase: Option<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Auth {
    /// Path to a PEM-encoded private key
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// SSH password; prefer the environment variable over the flag
    #[arg(long, env = "CAPSTAN_SSH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl Connection {
    pub(crate) fn client(&self) -> Result<SshClient> {
        let auth = if let Some(path) = &self.auth.key_file {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read key file {:?}", path))?;
            AuthMethod::Key {
                pem,
                passphrase: self.key_passphrase.clone(),
            }
        } else if let Some(password) = &self.auth.password {
            AuthMethod::Password(password.clone())
        } else {
            bail!("either --key-file or --password is required");
        };

        Ok(SshClient::new(
            self.host.clone(),
            self.port,
            self.user.clone(),
            auth,
        )?)
    }
}

#[derive(Args, Debug)]
pub(crate) struct ConfigInputs {
    /// k3s config YAML file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Embedded registry YAML file
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Directory for the k3s binary and install scripts
    #[arg(long, default_value = "/usr/local/bin")]
    pub bin_dir: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ServerCommand {
    /// Run prerequisites and install k3s, harvesting token and kubeconfig
    Install {
        #[command(flatten)]
        conn: Connection,
        #[command(flatten)]
        inputs: ConfigInputs,
        /// Pin the k3s version
        #[arg(long)]
        version: Option<String>,
        /// Join an existing cluster with this token (HA join mode)
        #[arg(long, env = "CAPSTAN_JOIN_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Extra file to write on the node, `target-path=local-source` (repeatable)
        #[arg(long = "file", value_name = "TARGET=SOURCE")]
        files: Vec<String>,
        /// Also write the harvested kubeconfig to this path
        #[arg(long)]
        kubeconfig_out: Option<PathBuf>,
    },
    /// Push updated config and registry, then restart the service
    Update {
        #[command(flatten)]
        conn: Connection,
        #[command(flatten)]
        inputs: ConfigInputs,
    },
    /// Rebuild stored state from an existing node (import)
    Resync {
        #[command(flatten)]
        conn: Connection,
        /// Directory for the k3s binary and install scripts
        #[arg(long, default_value = "/usr/local/bin")]
        bin_dir: String,
    },
    /// Remove the node from the cluster, then run the uninstall script
    Uninstall {
        #[command(flatten)]
        conn: Connection,
        /// Directory for the k3s binary and install scripts
        #[arg(long, default_value = "/usr/local/bin")]
        bin_dir: String,
        /// Kubeconfig for membership removal (defaults to stored state)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Report whether the k3s unit is active
    Status {
        #[command(flatten)]
        conn: Connection,
    },
    /// Print the k3s unit journal
    Journal {
        #[command(flatten)]
        conn: Connection,
    },
    /// Print the stored join token for a host
    Token {
        /// Host whose token to print
        #[arg(long)]
        host: String,
        /// Print the token in cleartext
        #[arg(long)]
        reveal: bool,
    },
    /// Print or write the stored kubeconfig for a host
    Kubeconfig {
        /// Host whose kubeconfig to print
        #[arg(long)]
        host: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fetch the cluster's OIDC JWKS document
    Jwks {
        #[command(flatten)]
        conn: Connection,
    },
    /// Render the single-node systemd unit for a config path
    RenderUnit {
        /// Config path baked into ExecStart
        #[arg(long, default_value = "/etc/rancher/k3s/config.yaml")]
        config_path: String,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum AgentCommand {
    /// Run prerequisites and install k3s in agent mode
    Install {
        #[command(flatten)]
        conn: Connection,
        /// k3s agent config YAML file
        #[arg(long)]
        config: Option<PathBuf>,
        /// URL of the cluster server, e.g. https://node1:6443
        #[arg(long)]
        server: String,
        /// Cluster join token
        #[arg(long, env = "CAPSTAN_JOIN_TOKEN", hide_env_values = true)]
        token: String,
        /// Pin the k3s version
        #[arg(long)]
        version: Option<String>,
        /// Directory for the k3s binary and install scripts
        #[arg(long, default_value = "/usr/local/bin")]
        bin_dir: String,
        /// Extra file to write on the node, `target-path=local-source` (repeatable)
        #[arg(long = "file", value_name = "TARGET=SOURCE")]
        files: Vec<String>,
    },
    /// Remove the node from the cluster, then run the agent uninstall script
    Uninstall {
        #[command(flatten)]
        conn: Connection,
        /// Directory for the k3s binary and install scripts
        #[arg(long, default_value = "/usr/local/bin")]
        bin_dir: String,
        /// Kubeconfig for membership removal
        #[arg(long)]
        kubeconfig: PathBuf,
    },
    /// Report whether the k3s-agent unit is active
    Status {
        #[command(flatten)]
        conn: Connection,
    },
    /// Print the k3s-agent unit journal
    Journal {
        #[command(flatten)]
        conn: Connection,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let state_path = cli
        .state_path
        .clone()
        .unwrap_or_else(state::default_state_path);

    match cli.command {
        Command::Server { command } => commands::server(command, &state_path).await,
        Command::Agent { command } => commands::agent(command, &state_path).await,
    }
}
