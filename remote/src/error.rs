use crate::auth::AuthError;

/// Failure of a single remote operation.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("could not resolve credentials: {0}")]
    Credentials(#[from] AuthError),

    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        source: russh::Error,
    },

    #[error("authentication failed for user '{user}' at {address}")]
    Auth { user: String, address: String },

    #[error("could not open session on {address}: {source}")]
    Session {
        address: String,
        source: russh::Error,
    },

    #[error("command '{command}' failed with exit status {status}")]
    Command { command: String, status: u32 },

    #[error("command '{command}' closed without reporting an exit status")]
    NoExitStatus { command: String },

    #[error("host {address} not ready after {attempts} attempts: {source}")]
    NotReady {
        address: String,
        attempts: u32,
        #[source]
        source: Box<ExecError>,
    },
}

/// Failure partway through a command batch. Outputs gathered before the
/// failing command ride along so callers can inspect partial progress.
#[derive(Debug, thiserror::Error)]
#[error("command '{command}' failed after {prior} completed commands: {source}", prior = .completed.len())]
pub struct BatchError {
    /// Outputs of the commands that completed before the failure, in order.
    pub completed: Vec<String>,
    /// The command that failed.
    pub command: String,
    #[source]
    pub source: ExecError,
}
