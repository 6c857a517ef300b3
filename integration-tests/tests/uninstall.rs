use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use capstan_node::{Agent, NodeError, NodeRemover, Server};

use crate::common::{ScriptedRunner, KUBECONFIG};

/// Records removal calls and optionally fails them.
struct RecordingRemover {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingRemover {
    fn new(fail: bool) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail,
        }
    }

    fn removed(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeRemover for RecordingRemover {
    async fn remove(&self, _kubeconfig: &str, node: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(node.to_string());
        if self.fail {
            bail!("connection to the cluster api refused");
        }
        Ok(())
    }
}

#[tokio::test]
async fn uninstall_removes_membership_before_running_the_script() {
    let runner = ScriptedRunner::new("node1");
    let remover = RecordingRemover::new(false);

    let server = Server::resync_target("/usr/local/bin");
    server
        .run_uninstall(&runner, &remover, KUBECONFIG)
        .await
        .expect("uninstall");

    assert_eq!(remover.removed(), vec!["node1"]);
    // The uninstall script only ran after removal succeeded, and nothing ran
    // before it.
    assert_eq!(
        runner.recorded(),
        vec!["sudo bash /usr/local/bin/k3s-uninstall.sh".to_string()]
    );
}

#[tokio::test]
async fn failed_removal_aborts_before_the_uninstall_script() {
    let runner = ScriptedRunner::new("node1");
    let remover = RecordingRemover::new(true);

    let server = Server::resync_target("/usr/local/bin");
    let err = server
        .run_uninstall(&runner, &remover, KUBECONFIG)
        .await
        .unwrap_err();

    assert!(matches!(err, NodeError::Removal { .. }), "got {err:?}");
    assert_eq!(remover.removed(), vec!["node1"]);
    assert!(
        runner.recorded().is_empty(),
        "uninstall script must not run after a failed removal"
    );
}

#[tokio::test]
async fn agent_uninstall_uses_the_agent_script() {
    let runner = ScriptedRunner::new("worker1");
    let remover = RecordingRemover::new(false);

    let agent = Agent::resync_target("/usr/local/bin");
    agent
        .run_uninstall(&runner, &remover, KUBECONFIG)
        .await
        .expect("uninstall");

    assert_eq!(remover.removed(), vec!["worker1"]);
    assert_eq!(
        runner.recorded(),
        vec!["sudo bash /usr/local/bin/k3s-agent-uninstall.sh".to_string()]
    );
}
