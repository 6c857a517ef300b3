use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use capstan_node::config::{self, ConfigMap};
use capstan_node::{assets, Agent, SecretString, Server};
use tracing::{debug, error, info};

use crate::remover::KubectlRemover;
use crate::state::{NodeState, StateStore};
use crate::{AgentCommand, ServerCommand};

pub(crate) async fn server(command: ServerCommand, state_path: &Path) -> Result<()> {
    match command {
        ServerCommand::Install {
            conn,
            inputs,
            version,
            token,
            files,
            kubeconfig_out,
        } => {
            let client = conn.client()?;
            let config = load_config_map(&inputs.config)?;
            let registry = load_config_map(&inputs.registry)?;

            let mut server = match token {
                Some(token) if !token.is_empty() => Server::joining(
                    config,
                    registry,
                    version,
                    SecretString::new(token),
                    inputs.bin_dir.as_str(),
                ),
                _ => Server::new(config, registry, version, inputs.bin_dir.as_str()),
            };
            for (target, content) in load_extra_files(&files)? {
                server.add_file(target, content);
            }

            server.run_prereqs(&client).await?;
            server.run_install(&client).await?;

            let active = server.status(&client).await?;
            if !active {
                let status = server.status_log(&client).await?;
                error!("k3s is not active after install:\n{status}");
                let journal = server.journal(&client).await?;
                debug!("{journal}");
                bail!("k3s service did not come up on {}", conn.host);
            }

            let mut store = StateStore::load(state_path)?;
            store.nodes.insert(
                conn.host.clone(),
                NodeState {
                    role: "server".to_string(),
                    bin_dir: Some(inputs.bin_dir.clone()),
                    token: server.token().map(|t| t.expose_secret().to_string()),
                    kubeconfig: server.kube_config().map(str::to_string),
                },
            );
            store.save(state_path)?;

            if let Some(path) = kubeconfig_out {
                if let Some(kubeconfig) = server.kube_config() {
                    fs::write(&path, kubeconfig)
                        .with_context(|| format!("Failed to write kubeconfig to {:?}", path))?;
                    info!(path = %path.display(), "kubeconfig written");
                }
            }

            info!(host = %conn.host, "k3s server installed; outputs stored");
            Ok(())
        }

        ServerCommand::Update { conn, inputs } => {
            let client = conn.client()?;
            let server = Server::new(
                load_config_map(&inputs.config)?,
                load_config_map(&inputs.registry)?,
                None,
                inputs.bin_dir.as_str(),
            );
            server.update(&client).await?;

            let active = server.status(&client).await?;
            info!(host = %conn.host, active, "k3s server updated");
            Ok(())
        }

        ServerCommand::Resync { conn, bin_dir } => {
            let client = conn.client()?;
            let mut server = Server::resync_target(bin_dir.as_str());
            server.resync(&client).await?;
            let active = server.status(&client).await?;

            let mut store = StateStore::load(state_path)?;
            store.nodes.insert(
                conn.host.clone(),
                NodeState {
                    role: "server".to_string(),
                    bin_dir: Some(bin_dir),
                    token: server.token().map(|t| t.expose_secret().to_string()),
                    kubeconfig: server.kube_config().map(str::to_string),
                },
            );
            store.save(state_path)?;

            if !server.config().is_empty() {
                println!("{}", config::render(server.config())?);
            }
            info!(host = %conn.host, active, "state resynced from node");
            Ok(())
        }

        ServerCommand::Uninstall {
            conn,
            bin_dir,
            kubeconfig,
        } => {
            let client = conn.client()?;
            let mut store = StateStore::load(state_path)?;
            let kubeconfig = match kubeconfig {
                Some(path) => fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read kubeconfig {:?}", path))?,
                None => store
                    .nodes
                    .get(&conn.host)
                    .and_then(|node| node.kubeconfig.clone())
                    .context("no stored kubeconfig for this host; pass --kubeconfig")?,
            };

            let server = Server::resync_target(bin_dir.as_str());
            server
                .run_uninstall(&client, &KubectlRemover, &kubeconfig)
                .await?;

            store.nodes.remove(&conn.host);
            store.save(state_path)?;
            info!(host = %conn.host, "k3s server uninstalled");
            Ok(())
        }

        ServerCommand::Status { conn } => {
            let client = conn.client()?;
            let server = Server::resync_target("/usr/local/bin");
            let active = server.status(&client).await?;
            println!("{}", if active { "active" } else { "inactive" });
            Ok(())
        }

        ServerCommand::Journal { conn } => {
            let client = conn.client()?;
            let server = Server::resync_target("/usr/local/bin");
            println!("{}", server.journal(&client).await?);
            Ok(())
        }

        ServerCommand::Token { host, reveal } => {
            let store = StateStore::load(state_path)?;
            let token = store
                .nodes
                .get(&host)
                .and_then(|node| node.token.clone())
                .with_context(|| format!("no stored token for host '{host}'"))?;
            if reveal {
                println!("{token}");
            } else {
                println!("[REDACTED {} bytes]; pass --reveal to print", token.len());
            }
            Ok(())
        }

        ServerCommand::Kubeconfig { host, out } => {
            let store = StateStore::load(state_path)?;
            let kubeconfig = store
                .nodes
                .get(&host)
                .and_then(|node| node.kubeconfig.clone())
                .with_context(|| format!("no stored kubeconfig for host '{host}'"))?;
            match out {
                Some(path) => {
                    fs::write(&path, kubeconfig)
                        .with_context(|| format!("Failed to write kubeconfig to {:?}", path))?;
                    info!(path = %path.display(), "kubeconfig written");
                }
                None => println!("{kubeconfig}"),
            }
            Ok(())
        }

        ServerCommand::Jwks { conn } => {
            let client = conn.client()?;
            let server = Server::resync_target("/usr/local/bin");
            println!("{}", server.jwks(&client).await?);
            Ok(())
        }

        ServerCommand::RenderUnit { config_path } => {
            let unit_b64 = assets::render_single_service_unit(&config_path)?;
            let unit = String::from_utf8(BASE64.decode(unit_b64)?)?;
            println!("{unit}");
            Ok(())
        }
    }
}

pub(crate) async fn agent(command: AgentCommand, _state_path: &Path) -> Result<()> {
    match command {
        AgentCommand::Install {
            conn,
            config,
            server,
            token,
            version,
            bin_dir,
            files,
        } => {
            let client = conn.client()?;
            let mut agent = Agent::new(
                load_config_map(&config)?,
                SecretString::new(token),
                server,
                version,
                bin_dir.as_str(),
            );
            for (target, content) in load_extra_files(&files)? {
                agent.add_file(target, content);
            }

            agent.run_prereqs(&client).await?;
            agent.run_install(&client).await?;

            let active = agent.status(&client).await?;
            if !active {
                let status = agent.status_log(&client).await?;
                error!("k3s-agent is not active after install:\n{status}");
                bail!("k3s-agent service did not come up on {}", conn.host);
            }
            info!(host = %conn.host, "k3s agent installed");
            Ok(())
        }

        AgentCommand::Uninstall {
            conn,
            bin_dir,
            kubeconfig,
        } => {
            let client = conn.client()?;
            let kubeconfig = fs::read_to_string(&kubeconfig)
                .with_context(|| format!("Failed to read kubeconfig {:?}", kubeconfig))?;

            let agent = Agent::resync_target(bin_dir.as_str());
            agent
                .run_uninstall(&client, &KubectlRemover, &kubeconfig)
                .await?;
            info!(host = %conn.host, "k3s agent uninstalled");
            Ok(())
        }

        AgentCommand::Status { conn } => {
            let client = conn.client()?;
            let agent = Agent::resync_target("/usr/local/bin");
            let active = agent.status(&client).await?;
            println!("{}", if active { "active" } else { "inactive" });
            Ok(())
        }

        AgentCommand::Journal { conn } => {
            let client = conn.client()?;
            let agent = Agent::resync_target("/usr/local/bin");
            println!("{}", agent.journal(&client).await?);
            Ok(())
        }
    }
}

fn load_config_map(path: &Option<PathBuf>) -> Result<ConfigMap> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            Ok(config::parse(&text)?)
        }
        None => Ok(ConfigMap::new()),
    }
}

fn load_extra_files(specs: &[String]) -> Result<Vec<(String, String)>> {
    specs
        .iter()
        .map(|spec| {
            let (target, source) = spec
                .split_once('=')
                .with_context(|| format!("--file expects TARGET=SOURCE, got '{spec}'"))?;
            let content = fs::read_to_string(source)
                .with_context(|| format!("Failed to read extra file source '{source}'"))?;
            Ok((target.to_string(), content))
        })
        .collect()
}
