use capstan_remote::{BatchError, ExecError};

/// Failure of a node lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Remote(#[from] ExecError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("could not parse kubeconfig: {source}")]
    KubeconfigParse {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("kubeconfig has no `default` cluster entry")]
    MissingDefaultCluster,

    #[error("could not render config as yaml: {source}")]
    ConfigRender {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("could not parse remote config document: {source}")]
    ConfigParse {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("could not render service unit: {source}")]
    Template {
        #[from]
        source: tera::Error,
    },

    #[error("expected one result from '{command}', got {got}")]
    UnexpectedResultCount { command: String, got: usize },

    #[error("install completed but no join token was found on the node")]
    MissingToken,

    #[error("removing node '{node}' from the cluster failed: {source}")]
    Removal {
        node: String,
        #[source]
        source: anyhow::Error,
    },
}
