//! Shell command builders and single-shot remote reads shared by the server
//! and agent orchestrators. Every file payload crosses the wire base64
//! encoded so it survives shell quoting, then is decoded in place.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use capstan_remote::{OutputSinks, RemoteRunner};
use tracing::debug;

use crate::{NodeError, CONFIG_DIR};

pub(crate) fn config_file() -> String {
    format!("{CONFIG_DIR}/config.yaml")
}

pub(crate) fn registry_file() -> String {
    format!("{CONFIG_DIR}/registries.yaml")
}

pub(crate) fn ensure_dir(path: &str) -> String {
    format!("sudo mkdir -p {path}")
}

/// Write an already-encoded payload to `path` via a temp file.
pub(crate) fn write_file_b64(path: &str, b64: &str) -> Vec<String> {
    vec![
        format!("echo \"{b64}\" | sudo tee {path}.tmp > /dev/null"),
        format!("sudo base64 -d {path}.tmp | sudo tee {path} > /dev/null"),
        format!("sudo rm {path}.tmp"),
    ]
}

/// Write `content` to `path` through a base64 round-trip.
pub(crate) fn write_file(path: &str, content: &str) -> Vec<String> {
    write_file_b64(path, &BASE64.encode(content))
}

/// Write an extra file, creating its parent directory first.
pub(crate) fn write_extra_file(path: &str, content: &str) -> Vec<String> {
    let mut commands = vec![format!("sudo mkdir -p $(sudo realpath $(dirname {path}))")];
    commands.extend(write_file(path, content));
    commands
}

/// Streams a command batch, echoing every output line into the debug log.
/// Any `masks` values are scrubbed from the failing command before the error
/// propagates, so secrets embedded in command text stay out of logs and
/// error chains.
pub(crate) async fn stream<R: RemoteRunner>(
    client: &R,
    commands: &[String],
    masks: &[&str],
) -> Result<(), NodeError> {
    let mut log = |line: &str| debug!(target: "capstan::remote", "{line}");
    match client
        .run_stream(commands, OutputSinks::Combined(&mut log))
        .await
    {
        Ok(()) => Ok(()),
        Err(mut err) => {
            for mask in masks {
                if mask.is_empty() {
                    continue;
                }
                err.command = err.command.replace(mask, "[REDACTED]");
                match &mut err.source {
                    capstan_remote::ExecError::Command { command, .. }
                    | capstan_remote::ExecError::NoExitStatus { command } => {
                        *command = command.replace(mask, "[REDACTED]");
                    }
                    _ => {}
                }
            }
            Err(err.into())
        }
    }
}

/// Runs a single command and returns its one output; any other result count
/// is an invariant violation, not an empty default.
pub(crate) async fn single<R: RemoteRunner>(client: &R, command: &str) -> Result<String, NodeError> {
    let mut results = client.run(&[command.to_string()]).await?;
    if results.len() != 1 {
        return Err(NodeError::UnexpectedResultCount {
            command: command.to_string(),
            got: results.len(),
        });
    }
    Ok(results.remove(0))
}

/// Reads a remote file as root. With `missing_ok`, an absent file yields an
/// empty string instead of an error.
pub(crate) async fn read_remote_file<R: RemoteRunner>(
    client: &R,
    path: &str,
    missing_ok: bool,
) -> Result<String, NodeError> {
    let command = if missing_ok {
        format!("sudo cat {path} 2> /dev/null || true")
    } else {
        format!("sudo cat {path}")
    };
    single(client, &command).await
}

/// Whether the systemd unit is currently active.
pub(crate) async fn systemd_status<R: RemoteRunner>(
    client: &R,
    service: &str,
) -> Result<bool, NodeError> {
    let out = single(client, &format!("sudo systemctl is-active {service} || true")).await?;
    Ok(out.trim() == "active")
}

pub(crate) async fn journal<R: RemoteRunner>(client: &R, service: &str) -> Result<String, NodeError> {
    single(client, &format!("sudo journalctl -xeu {service}")).await
}

/// `systemctl status` exits non-zero for inactive units; this read is wanted
/// precisely then, so the status code is discarded.
pub(crate) async fn status_log<R: RemoteRunner>(
    client: &R,
    service: &str,
) -> Result<String, NodeError> {
    single(client, &format!("sudo systemctl status {service} || true")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_stages_decodes_and_cleans_up() {
        let commands = write_file("/etc/rancher/k3s/config.yaml", "node-name: edge-1\n");
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("tee /etc/rancher/k3s/config.yaml.tmp"));
        assert!(commands[1].contains("base64 -d /etc/rancher/k3s/config.yaml.tmp"));
        assert!(commands[2].contains("rm /etc/rancher/k3s/config.yaml.tmp"));
        // Payload is encoded, never raw.
        assert!(!commands[0].contains("node-name"));
    }

    #[test]
    fn extra_files_create_parent_directories_first() {
        let commands = write_extra_file("/etc/rancher/k3s/tls/sa-signer.key", "key material");
        assert!(commands[0].contains("dirname /etc/rancher/k3s/tls/sa-signer.key"));
        assert_eq!(commands.len(), 4);
    }
}
