use std::io::Write;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use capstan_node::NodeRemover;
use tokio::process::Command;
use tracing::info;

/// Removes cluster members with the operator's local `kubectl`.
///
/// `--ignore-not-found` makes removal of an already-gone node a no-op, which
/// uninstall relies on.
pub struct KubectlRemover;

#[async_trait]
impl NodeRemover for KubectlRemover {
    async fn remove(&self, kubeconfig: &str, node: &str) -> Result<()> {
        let mut file =
            tempfile::NamedTempFile::new().context("Failed to create temporary kubeconfig")?;
        file.write_all(kubeconfig.as_bytes())
            .context("Failed to write temporary kubeconfig")?;

        info!(node, "deleting node from cluster membership");
        let output = Command::new("kubectl")
            .arg("--kubeconfig")
            .arg(file.path())
            .args(["delete", "node", node, "--ignore-not-found=true"])
            .output()
            .await
            .context("Failed to run kubectl")?;

        if !output.status.success() {
            bail!(
                "kubectl delete node {node} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
