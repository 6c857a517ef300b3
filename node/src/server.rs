//! Server node orchestration: prerequisites, install, update, resync,
//! uninstall and diagnostics for a cluster-forming (or HA-joining) node.

use std::collections::BTreeMap;

use capstan_remote::RemoteRunner;
use tracing::{debug, info};

use crate::config::{self, ConfigMap};
use crate::remover::NodeRemover;
use crate::secret::SecretString;
use crate::{assets, env_file, kubeconfig, provision, NodeError, CONFIG_DIR};

const SERVICE: &str = "k3s";
const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";
const SERVICE_ENV_PATH: &str = "/etc/systemd/system/k3s.service.env";

/// One k3s server node.
///
/// Constructed fresh per orchestration call. A node created with [`Server::new`]
/// originates the cluster and its join token; one created with
/// [`Server::joining`] consumes an existing token and never generates its own.
pub struct Server {
    config: ConfigMap,
    registry: ConfigMap,
    token: Option<SecretString>,
    kube_config: Option<String>,
    version: Option<String>,
    bin_dir: String,
    extra_files: BTreeMap<String, String>,
}

impl Server {
    /// A server that originates a new cluster and its join token.
    pub fn new(
        config: ConfigMap,
        registry: ConfigMap,
        version: Option<String>,
        bin_dir: impl Into<String>,
    ) -> Self {
        Self {
            config,
            registry,
            token: None,
            kube_config: None,
            version,
            bin_dir: bin_dir.into(),
            extra_files: BTreeMap::new(),
        }
    }

    /// A server joining an already-initialized cluster with `token`.
    pub fn joining(
        config: ConfigMap,
        registry: ConfigMap,
        version: Option<String>,
        token: SecretString,
        bin_dir: impl Into<String>,
    ) -> Self {
        let mut server = Self::new(config, registry, version, bin_dir);
        if !token.is_empty() {
            server.token = Some(token);
        }
        server
    }

    /// A bare component for update, resync and uninstall flows; config and
    /// registry are rehydrated from the node itself when needed.
    pub fn resync_target(bin_dir: impl Into<String>) -> Self {
        Self::new(ConfigMap::new(), ConfigMap::new(), None, bin_dir)
    }

    /// Queues an extra file to be written verbatim during prerequisites.
    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.extra_files.insert(path.into(), content.into());
    }

    /// The cluster join token, once installed or resynced.
    pub fn token(&self) -> Option<&SecretString> {
        self.token.as_ref()
    }

    /// The rewritten kubeconfig, once installed or resynced.
    pub fn kube_config(&self) -> Option<&str> {
        self.kube_config.as_deref()
    }

    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub fn registry(&self) -> &ConfigMap {
        &self.registry
    }

    fn data_dir(&self) -> &str {
        config::data_dir(&self.config)
    }

    fn token_path(&self) -> String {
        format!("{}/server/token", self.data_dir())
    }

    /// Stages the installer, creates directories and writes the config,
    /// registry and extra files. Blocks until the host accepts connections.
    pub async fn run_prereqs<R: RemoteRunner>(&self, client: &R) -> Result<(), NodeError> {
        client.wait_for_ready(&|msg| info!("{msg}")).await?;

        let config_yaml = config::render(&self.config)?;
        let registry_yaml = if self.registry.is_empty() {
            None
        } else {
            Some(config::render(&self.registry)?)
        };

        let mut commands = provision::write_file_b64(
            &format!("{}/k3s-install.sh", self.bin_dir),
            &assets::install_script_b64(),
        );
        commands.push(provision::ensure_dir(self.data_dir()));
        commands.push(provision::ensure_dir(CONFIG_DIR));
        commands.extend(provision::write_file(&provision::config_file(), &config_yaml));
        if let Some(registry_yaml) = &registry_yaml {
            commands.extend(provision::write_file(
                &provision::registry_file(),
                registry_yaml,
            ));
        }
        for (path, content) in &self.extra_files {
            commands.extend(provision::write_extra_file(path, content));
        }

        debug!(host = client.host(), commands = commands.len(), "running server prerequisites");
        provision::stream(client, &commands, &[]).await
    }

    /// Runs the installer and starts the service. On an originating node the
    /// generated join token is harvested afterwards; on a joining node the
    /// supplied token is preserved untouched. The kubeconfig is always
    /// fetched and rewritten to this host.
    pub async fn run_install<R: RemoteRunner>(&mut self, client: &R) -> Result<(), NodeError> {
        let mut flags = vec![
            "INSTALL_K3S_SKIP_START=true".to_string(),
            format!("BIN_DIR={}", self.bin_dir),
            format!("INSTALL_K3S_EXEC='--config {}'", provision::config_file()),
        ];
        if let Some(token) = &self.token {
            flags.push(format!("K3S_TOKEN={}", token.expose_secret()));
        }
        if let Some(version) = &self.version {
            flags.push(format!("INSTALL_K3S_VERSION=\"{version}\""));
        }

        let commands = vec![
            format!("sudo {} bash {}/k3s-install.sh", flags.join(" "), self.bin_dir),
            "sudo systemctl daemon-reload".to_string(),
            format!("sudo systemctl start {SERVICE}"),
        ];

        info!(host = client.host(), "installing k3s server");
        let masks = [self.token.as_ref().map_or("", |t| t.expose_secret())];
        provision::stream(client, &commands, &masks).await?;

        if self.token.is_none() {
            self.token = Some(self.fetch_token(client).await?);
            info!("retrieved generated cluster join token");
        }
        self.kube_config = Some(self.fetch_kube_config(client).await?);
        Ok(())
    }

    /// Re-renders and pushes config and registry, then restarts the service.
    pub async fn update<R: RemoteRunner>(&self, client: &R) -> Result<(), NodeError> {
        client.wait_for_ready(&|msg| info!("{msg}")).await?;

        let mut commands =
            provision::write_file(&provision::config_file(), &config::render(&self.config)?);
        if !self.registry.is_empty() {
            commands.extend(provision::write_file(
                &provision::registry_file(),
                &config::render(&self.registry)?,
            ));
        }
        commands.push(format!("sudo systemctl restart {SERVICE}"));

        info!(host = client.host(), "updating k3s server config");
        provision::stream(client, &commands, &[]).await
    }

    /// Rebuilds in-memory state from the node: token (unless already known),
    /// kubeconfig, and the remote config and registry documents. This is how
    /// an externally provisioned node is imported.
    pub async fn resync<R: RemoteRunner>(&mut self, client: &R) -> Result<(), NodeError> {
        if self.token.is_none() {
            self.token = Some(self.fetch_token(client).await?);
        }
        self.kube_config = Some(self.fetch_kube_config(client).await?);

        let registry_raw =
            provision::read_remote_file(client, &provision::registry_file(), true).await?;
        self.registry = config::parse(&registry_raw)?;

        let config_raw =
            provision::read_remote_file(client, &provision::config_file(), true).await?;
        self.config = config::parse(&config_raw)?;
        Ok(())
    }

    /// Removes this node from cluster membership, then runs the uninstall
    /// script. If removal fails the script never runs, so the cluster is not
    /// left with a ghost member.
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
            &[format!("sudo bash {}/k3s-uninstall.sh", self.bin_dir)],
            &[],
        )
        .await
    }

    /// Whether the k3s unit is active.
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

    /// The cluster's OIDC JWKS document, fetched via the local cluster CLI.
    pub async fn jwks<R: RemoteRunner>(&self, client: &R) -> Result<String, NodeError> {
        // sudo in case the on-node kubeconfig has narrow permissions
        provision::single(client, "sudo k3s kubectl get --raw /openid/v1/jwks").await
    }

    async fn fetch_token<R: RemoteRunner>(&self, client: &R) -> Result<SecretString, NodeError> {
        let mut token = provision::read_remote_file(client, &self.token_path(), true)
            .await?
            .trim()
            .to_string();

        // Nodes joined with a caller-supplied token have no server/token
        // file; the value lives in the service environment file instead.
        if token.is_empty() {
            let env = provision::read_remote_file(client, SERVICE_ENV_PATH, true).await?;
            token = env_file::parse(&env)
                .get("K3S_TOKEN")
                .map(|value| value.trim().to_string())
                .unwrap_or_default();
        }

        if token.is_empty() {
            return Err(NodeError::MissingToken);
        }
        Ok(SecretString::new(token))
    }

    async fn fetch_kube_config<R: RemoteRunner>(&self, client: &R) -> Result<String, NodeError> {
        let raw = provision::read_remote_file(client, KUBECONFIG_PATH, false).await?;
        kubeconfig::rewrite_server_endpoint(&raw, client.host())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use capstan_remote::{BatchError, ExecError, OutputSinks};

    /// Fails every batch on its first command.
    struct FailingRunner;

    fn first_command_error(commands: &[String]) -> BatchError {
        BatchError {
            completed: Vec::new(),
            command: commands[0].clone(),
            source: ExecError::Command {
                command: commands[0].clone(),
                status: 1,
            },
        }
    }

    #[async_trait]
    impl RemoteRunner for FailingRunner {
        async fn run(&self, commands: &[String]) -> Result<Vec<String>, BatchError> {
            Err(first_command_error(commands))
        }

        async fn run_stream(
            &self,
            commands: &[String],
            _sinks: OutputSinks<'_>,
        ) -> Result<(), BatchError> {
            Err(first_command_error(commands))
        }

        async fn wait_for_ready(
            &self,
            _logger: &(dyn Fn(String) + Send + Sync),
        ) -> Result<(), ExecError> {
            Ok(())
        }

        fn host(&self) -> &str {
            "node1"
        }
    }

    #[tokio::test]
    async fn install_failure_scrubs_the_token_from_the_error() {
        let mut server = Server::joining(
            ConfigMap::new(),
            ConfigMap::new(),
            None,
            SecretString::new("K10sensitive::server:tok"),
            "/usr/local/bin",
        );
        let err = server.run_install(&FailingRunner).await.unwrap_err();
        let rendered = format!("{err}");
        assert!(!rendered.contains("K10sensitive"), "token leaked: {rendered}");
        assert!(rendered.contains("[REDACTED]"));
    }
}
