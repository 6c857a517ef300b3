//! Rewrites a harvested kubeconfig so its API endpoint is reachable from
//! outside the node. k3s writes `https://127.0.0.1:6443`; callers need the
//! node's external address instead.

use serde_yaml::Value;

use crate::NodeError;

/// Kubernetes API port exposed by a k3s server.
const API_PORT: u16 = 6443;

/// Rewrites the `default` cluster's server endpoint to `host`.
///
/// `host` may carry an SSH `:port` suffix (the port the file was fetched
/// over, not the API port); it is stripped. Applying the rewrite twice with
/// the same host is a no-op.
pub fn rewrite_server_endpoint(kubeconfig: &str, host: &str) -> Result<String, NodeError> {
    let mut doc: Value =
        serde_yaml::from_str(kubeconfig).map_err(|source| NodeError::KubeconfigParse { source })?;

    let server = doc
        .get_mut("clusters")
        .and_then(Value::as_sequence_mut)
        .and_then(|clusters| {
            clusters
                .iter_mut()
                .find(|entry| entry.get("name").and_then(Value::as_str) == Some("default"))
        })
        .and_then(|entry| entry.get_mut("cluster"))
        .and_then(|cluster| cluster.get_mut("server"))
        .ok_or(NodeError::MissingDefaultCluster)?;

    *server = Value::String(format!("https://{}:{API_PORT}", strip_ssh_port(host)));

    serde_yaml::to_string(&doc).map_err(|source| NodeError::KubeconfigParse { source })
}

/// Drops a trailing `:port` from `host`. Bare IPv6 addresses contain more
/// than one colon and pass through untouched.
fn strip_ssh_port(host: &str) -> &str {
    if host.matches(':').count() == 1 {
        if let Some((name, port)) = host.rsplit_once(':') {
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                return name;
            }
        }
    }
    host
}
