//! Agent node orchestration: a cluster-joining worker. Agents always consume
//! an existing join token and produce no outputs of their own.

use std::collections::BTreeMap;

use capstan_remote::RemoteRunner;
use tracing::{debug, info};

use crate::config::{self, ConfigMap};
use crate::remover::NodeRemover;
use crate::secret::SecretString;
use crate::{assets, provision, NodeError, CONFIG_DIR};

const SERVICE: &str = "k3s-agent";

/// One k3s agent node.
pub struct Agent {
    config: ConfigMap,
    token: SecretString,
    server_url: String,
    version: Option<String>,
    bin_dir: String,
    extra_files: BTreeMap<String, String>,
}

impl Agent {
    /// An agent joining the cluster at `server_url` with `token`.
    pub fn new(
        config: ConfigMap,
        token: SecretString,
        server_url: impl Into<String>,
        version: Option<String>,
        bin_dir: impl Into<String>,
    ) -> Self {
        Self {
            config,
            token,
            server_url: server_url.into(),
            version,
            bin_dir: bin_dir.into(),
            extra_files: BTreeMap::new(),
        }
    }

    /// A bare component for uninstall and diagnostic flows, which need only
    /// connection and path parameters.
    pub fn resync_target(bin_dir: impl Into<String>) -> Self {
        Self::new(ConfigMap::new(), SecretString::new(""), "", None, bin_dir)
    }

    /// Queues an extra file to be written verbatim during prerequisites.
    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.extra_files.insert(path.into(), content.into());
    }

    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    fn data_dir(&self) -> &str {
        config::data_dir(&self.config)
    }

    /// Stages the installer, creates directories and writes the config and
    /// extra files. Blocks until the host accepts connections.
    pub async fn run_prereqs<R: RemoteRunner>(&self, client: &R) -> Result<(), NodeError> {
        client.wait_for_ready(&|msg| info!("{msg}")).await?;

        let config_yaml = config::render(&self.config)?;

        let mut commands = provision::write_file_b64(
            &format!("{}/k3s-install.sh", self.bin_dir),
            &assets::install_script_b64(),
        );
        commands.push(provision::ensure_dir(self.data_dir()));
        commands.push(provision::ensure_dir(CONFIG_DIR));
        commands.extend(provision::write_file(&provision::config_file(), &config_yaml));
        for (path, content) in &self.extra_files {
            commands.extend(provision::write_extra_file(path, content));
        }

        debug!(host = client.host(), commands = commands.len(), "running agent prerequisites");
        provision::stream(client, &commands, &[]).await
    }

    /// Runs the installer in agent mode and starts the service.
    pub async fn run_install<R: RemoteRunner>(&self, client: &R) -> Result<(), NodeError> {
        let mut flags = vec![
            "INSTALL_K3S_SKIP_START=true".to_string(),
            format!("BIN_DIR={}", self.bin_dir),
            format!("INSTALL_K3S_EXEC='agent --config {}'", provision::config_file()),
            format!("K3S_URL={}", self.server_url),
            format!("K3S_TOKEN={}", self.token.expose_secret()),
        ];
        if let Some(version) = &self.version {
            flags.push(format!("INSTALL_K3S_VERSION=\"{version}\""));
        }

        let commands = vec![
            format!("sudo {} bash {}/k3s-install.sh", flags.join(" "), self.bin_dir),
            "sudo systemctl daemon-reload".to_string(),
            format!("sudo systemctl start {SERVICE}"),
        ];

        info!(host = client.host(), "installing k3s agent");
        provision::stream(client, &commands, &[self.token.expose_secret()]).await
    }

    /// Removes this node from cluster membership, then runs the agent
    /// uninstall script. Removal failure aborts before the script runs.
    pub async fn run_uninstall<R: RemoteRunner>(
        &self,
        client: &R,
        remover: &dyn NodeRemover,
        kubeconfig: &str,
    ) -> Result<(), NodeError> {
        remover
            .remove(kubeconfig, client.host())
            .await
            .map_err(|source| NodeError::Removal {
                node: client.host().to_string(),
                source,
            })?;

        info!(node = client.host(), "removed from cluster, running uninstall script");
        provision::stream(
            client,
            &[format!("sudo bash {}/k3s-agent-uninstall.sh", self.bin_dir)],
            &[],
        )
        .await
    }

    /// Whether the k3s-agent unit is active.
    pub async fn status<R: RemoteRunner>(&self, client: &R) -> Result<bool, NodeError> {
        provision::systemd_status(client, SERVICE).await
    }

    /// Raw unit journal, for diagnostics.
    pub async fn journal<R: RemoteRunner>(&self, client: &R) -> Result<String, NodeError> {
        provision::journal(client, SERVICE).await
    }

    /// Raw `systemctl status` output, for diagnostics.
    pub async fn status_log<R: RemoteRunner>(&self, client: &R) -> Result<String, NodeError> {
        provision::status_log(client, SERVICE).await
    }
}
