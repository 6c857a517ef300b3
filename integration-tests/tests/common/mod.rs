use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use capstan_remote::{BatchError, ExecError, OutputSinks, RemoteRunner};

/// In-memory stand-in for a remote host: records every command, serves
/// canned outputs for collected runs, and can be told to fail on commands
/// matching a substring.
pub struct ScriptedRunner {
    host: String,
    responses: Mutex<BTreeMap<String, String>>,
    fail_on: Mutex<Option<String>>,
    stream_lines: Mutex<Vec<(String, bool)>>,
    commands: Mutex<Vec<String>>,
    ready_checks: Mutex<u32>,
}

impl ScriptedRunner {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            responses: Mutex::new(BTreeMap::new()),
            fail_on: Mutex::new(None),
            stream_lines: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            ready_checks: Mutex::new(0),
        }
    }

    /// Canned output for an exact command in collected (`run`) mode.
    pub fn respond(&self, command: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    /// Makes any command containing `needle` fail with exit status 1.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    /// Lines delivered to the sinks for every streamed command; `stderr`
    /// marks the line as extended data.
    pub fn push_stream_line(&self, line: &str, stderr: bool) {
        self.stream_lines
            .lock()
            .unwrap()
            .push((line.to_string(), stderr));
    }

    /// Every command seen so far, in execution order.
    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ready_checks(&self) -> u32 {
        *self.ready_checks.lock().unwrap()
    }

    /// Index of the first recorded command containing `needle`.
    pub fn position_of(&self, needle: &str) -> Option<usize> {
        self.recorded()
            .iter()
            .position(|command| command.contains(needle))
    }

    fn fails(&self, command: &str) -> bool {
        self.fail_on
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| command.contains(needle))
    }
}

#[async_trait]
impl RemoteRunner for ScriptedRunner {
    async fn run(&self, commands: &[String]) -> Result<Vec<String>, BatchError> {
        let mut completed = Vec::new();
        for command in commands {
            self.commands.lock().unwrap().push(command.clone());
            if self.fails(command) {
                return Err(BatchError {
                    completed,
                    command: command.clone(),
                    source: ExecError::Command {
                        command: command.clone(),
                        status: 1,
                    },
                });
            }
            let output = self
                .responses
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .unwrap_or_default();
            completed.push(output);
        }
        Ok(completed)
    }

    async fn run_stream(
        &self,
        commands: &[String],
        mut sinks: OutputSinks<'_>,
    ) -> Result<(), BatchError> {
        for command in commands {
            self.commands.lock().unwrap().push(command.clone());
            if self.fails(command) {
                return Err(BatchError {
                    completed: Vec::new(),
                    command: command.clone(),
                    source: ExecError::Command {
                        command: command.clone(),
                        status: 1,
                    },
                });
            }
            let lines = self.stream_lines.lock().unwrap().clone();
            for (line, stderr) in &lines {
                if *stderr {
                    sinks.stderr_line(line);
                } else {
                    sinks.stdout_line(line);
                }
            }
        }
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        _logger: &(dyn Fn(String) + Send + Sync),
    ) -> Result<(), ExecError> {
        *self.ready_checks.lock().unwrap() += 1;
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// A k3s-shaped kubeconfig as written to /etc/rancher/k3s/k3s.yaml.
pub const KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
users:
- name: default
  user:
    client-certificate-data: LS0tLS1CRUdJTg==
";
