use capstan_node::config::{ConfigMap, ConfigValue};
use capstan_node::{Agent, SecretString};

use crate::common::ScriptedRunner;

fn sample_agent() -> Agent {
    let config = ConfigMap::from([(
        "node-label".to_string(),
        ConfigValue::List(vec!["tier=worker".to_string()]),
    )]);
    Agent::new(
        config,
        SecretString::new("K10abc::server:secret"),
        "https://node1:6443",
        None,
        "/usr/local/bin",
    )
}

#[tokio::test]
async fn agent_install_joins_the_cluster() {
    let runner = ScriptedRunner::new("worker1");
    let agent = sample_agent();
    agent.run_prereqs(&runner).await.expect("prereqs");
    agent.run_install(&runner).await.expect("install");

    assert_eq!(runner.ready_checks(), 1);

    let install_cmd = runner
        .recorded()
        .into_iter()
        .find(|command| command.contains("bash") && command.contains("k3s-install.sh"))
        .expect("install command");
    assert!(install_cmd.contains("INSTALL_K3S_EXEC='agent --config /etc/rancher/k3s/config.yaml'"));
    assert!(install_cmd.contains("K3S_URL=https://node1:6443"));
    assert!(install_cmd.contains("K3S_TOKEN=K10abc::server:secret"));

    // The agent service, not the server one, is started.
    let recorded = runner.recorded();
    assert!(recorded.contains(&"sudo systemctl start k3s-agent".to_string()));
    assert!(!recorded.contains(&"sudo systemctl start k3s".to_string()));
}

#[tokio::test]
async fn agent_prereqs_write_config_but_no_registry() {
    let runner = ScriptedRunner::new("worker1");
    let agent = sample_agent();
    agent.run_prereqs(&runner).await.expect("prereqs");

    assert!(runner.position_of("tee /etc/rancher/k3s/config.yaml.tmp").is_some());
    assert!(runner.position_of("registries.yaml").is_none());
}

#[tokio::test]
async fn agent_status_targets_the_agent_unit() {
    let runner = ScriptedRunner::new("worker1");
    runner.respond("sudo systemctl is-active k3s-agent || true", "active\n");

    let agent = Agent::resync_target("/usr/local/bin");
    assert!(agent.status(&runner).await.expect("status"));
}
