use async_trait::async_trait;

/// Removes a node from cluster membership.
///
/// Uninstall invokes this before the local uninstall script runs and aborts
/// if it fails, so cluster membership is cleaned up before the agent is torn
/// down and no ghost members are left behind. Implementations must treat an
/// already-removed node as success.
#[async_trait]
pub trait NodeRemover: Send + Sync {
    async fn remove(&self, kubeconfig: &str, node: &str) -> anyhow::Result<()>;
}
