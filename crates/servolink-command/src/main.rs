mod adapters;
mod config;
mod core;
mod groot;
mod providers;
mod sink;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use servolink_dispatch::{run_socket_dispatcher, run_stdin_dispatcher};
use servolink_driver::make_teleoperator;
use servolink_helpers::{logging, shutdown};
use servolink_manager::ManagerClient;
use servolink_proto::{ClientOptions, RpcClient, RpcServer};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::{ActionAdapter, ObservationAdapter};
use crate::config::{AiConfig, Config, TeleopEndpointConfig, TeleopMode};
use crate::core::mode_manager::ModeManager;
use crate::core::service::CommandService;
use crate::groot::Gr00tObservationMapper;
use crate::providers::{
    AiCommandProvider, CommandProvider, DataCollectionProvider,
    IdleCommandProvider, LocalTeleopProvider, RemoteTeleopProvider,
};
use crate::providers::data::{DataCollectionSettings, TeleopSource};
use crate::providers::teleop::ManagedService;

const EXIT_CONFIG: u8 = 1;
const EXIT_SIGINT: u8 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherKind {
    Cli,
    Socket,
}

#[derive(Debug)]
struct Args {
    config_path: Option<PathBuf>,
    dispatcher: DispatcherKind,
    dispatch_socket: PathBuf,
}

impl Args {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut config_path = None;
        let mut dispatcher = DispatcherKind::Cli;
        let mut dispatch_socket = PathBuf::from("/tmp/servolink-mode.sock");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config_path = args.next().map(PathBuf::from);
                    if config_path.is_none() {
                        bail!("missing value for --config");
                    }
                }
                "--mode-dispatcher" => {
                    let value = args
                        .next()
                        .context("missing value for --mode-dispatcher")?;
                    dispatcher = match value.as_str() {
                        "cli" => DispatcherKind::Cli,
                        "socket" => DispatcherKind::Socket,
                        other => {
                            bail!("unknown dispatcher '{other}' (expected cli or socket)")
                        }
                    };
                }
                "--dispatch-socket" => {
                    dispatch_socket = args
                        .next()
                        .map(PathBuf::from)
                        .context("missing value for --dispatch-socket")?;
                }
                "-h" | "--help" => {
                    bail!(
                        "usage: servolink-command [--config path] [--mode-dispatcher cli|socket] [--dispatch-socket path]"
                    );
                }
                other => bail!("unknown argument: {other}"),
            }
        }

        Ok(Self { config_path, dispatcher, dispatch_socket })
    }
}

struct Registry {
    providers: HashMap<String, Box<dyn CommandProvider>>,
    aliases: HashMap<String, String>,
    ai_key: Option<String>,
    idle_key: String,
    data_key: Option<String>,
    default_key: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    logging::init_logging(
        "servolink-command",
        "servolink_command=info,servolink_proto=info,servolink_dispatch=info",
    );

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("servolink-command: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(args).await {
        Ok(signalled) => {
            if signalled {
                ExitCode::from(EXIT_SIGINT)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("servolink-command: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = Config::load(args.config_path)
        .context("failed to load configuration")?;

    let registry = build_registry(&config)?;

    let mut server = RpcServer::bind(
        &config.network.host,
        config.network.port,
        config.network.api_token.clone(),
    )
    .await
    .context("failed to bind rpc server")?;
    let run_token = server.run_token();

    let service = Arc::new(CommandService::new(
        registry.providers,
        &registry.default_key,
        build_exchange_hook(&config),
        run_token.clone(),
    )?);
    service.register_endpoints(&mut server);

    info!(
        "providers registered: keys={}",
        service.available_providers().await.join(", ")
    );
    if let Err(err) = service.set_active(&registry.default_key).await {
        warn!(
            "default provider activation failed: key={}, error={}",
            registry.default_key, err
        );
    }

    let signalled = Arc::new(AtomicBool::new(false));
    {
        let token = run_token.clone();
        let signalled = signalled.clone();
        tokio::spawn(async move {
            shutdown::listen_shutdown(token).await;
            signalled.store(true, Ordering::SeqCst);
        });
    }

    let (events_tx, events_rx) = mpsc::channel(64);
    match args.dispatcher {
        DispatcherKind::Cli => {
            tokio::spawn(run_stdin_dispatcher(events_tx, run_token.clone()));
        }
        DispatcherKind::Socket => {
            tokio::spawn(run_socket_dispatcher(
                args.dispatch_socket.clone(),
                events_tx,
                run_token.clone(),
            ));
        }
    }

    let manager = ModeManager::new(
        service.clone(),
        registry.aliases,
        registry.ai_key,
        Some(registry.idle_key),
        registry.data_key,
    );
    tokio::spawn(manager.run(events_rx, run_token.clone()));

    info!(
        "command orchestrator starting: listen={}:{}, default={}",
        config.network.host, config.network.port, registry.default_key
    );

    let result = server.run().await;
    service.shutdown_active().await;
    result.context("rpc server failed")?;

    Ok(signalled.load(Ordering::SeqCst))
}

/// When a dashboard is configured, every exchange is traced so an external
/// visualization process can be pointed at the log stream; the hook is also
/// the seam where a richer feed would attach.
fn build_exchange_hook(
    config: &Config,
) -> Option<crate::core::service::ExchangeHook> {
    let webviz = config.webviz.as_ref()?;
    info!(
        "dashboard feed enabled: webviz={}:{}, camera_stream={}",
        webviz.host,
        webviz.port,
        config
            .camera_stream
            .as_ref()
            .map(|stream| format!("{}:{}", stream.host, stream.port))
            .unwrap_or_else(|| "-".to_string())
    );
    Some(Box::new(|_observation, action, mode| {
        tracing::trace!(
            "exchange: mode={}, action_channels={:?}",
            mode,
            action
                .as_map()
                .and_then(|map| map.get("actions"))
                .and_then(|actions| actions.as_map())
                .map(|actions| actions.len())
        );
        Ok(())
    }))
}

fn build_registry(config: &Config) -> Result<Registry> {
    let mut providers: HashMap<String, Box<dyn CommandProvider>> =
        HashMap::new();
    let mut aliases = HashMap::new();

    for (name, endpoint) in &config.teleops {
        let key = format!("teleop:{name}");
        providers.insert(key.clone(), build_teleop_provider(name, endpoint)?);
        // Both the bare name and the prefixed key select the same provider.
        aliases.insert(name.clone(), key.clone());
        aliases.insert(key.clone(), key.clone());
    }

    let ai_key = match &config.ai {
        Some(ai_config) => {
            let key = "infer".to_string();
            providers.insert(key.clone(), build_ai_provider(ai_config)?);
            Some(key)
        }
        None => None,
    };

    let idle_key = "idle".to_string();
    providers
        .insert(idle_key.clone(), Box::new(IdleCommandProvider::default()));

    let data_key = match &config.data {
        Some(data_config) => {
            let key = "data".to_string();
            providers.insert(key.clone(), build_data_provider(data_config)?);
            aliases.insert(key.clone(), key.clone());
            Some(key)
        }
        None => None,
    };

    let default_key = config
        .default_mode
        .as_ref()
        .map(|mode| {
            aliases.get(mode).cloned().unwrap_or_else(|| mode.clone())
        })
        .filter(|key| providers.contains_key(key))
        .or_else(|| ai_key.clone())
        .unwrap_or_else(|| idle_key.clone());

    Ok(Registry { providers, aliases, ai_key, idle_key, data_key, default_key })
}

fn build_teleop_provider(
    name: &str,
    endpoint: &TeleopEndpointConfig,
) -> Result<Box<dyn CommandProvider>> {
    match endpoint.mode {
        TeleopMode::Local => {
            let spec = endpoint.config.as_ref().with_context(|| {
                format!("teleop '{name}' is local but has no 'config' block")
            })?;
            Ok(Box::new(LocalTeleopProvider::new(
                make_teleoperator(spec),
                None,
                None,
            )))
        }
        TeleopMode::Remote => {
            let (host, port, manager) = remote_endpoint(name, endpoint)?;
            Ok(Box::new(RemoteTeleopProvider::new(
                host,
                port,
                endpoint.timeout_ms,
                endpoint.api_token.clone(),
                manager,
            )))
        }
    }
}

fn remote_endpoint(
    name: &str,
    endpoint: &TeleopEndpointConfig,
) -> Result<(String, u16, Option<ManagedService>)> {
    let host = endpoint.host.clone().with_context(|| {
        format!("teleop '{name}' is remote but lacks a host")
    })?;
    let port = endpoint.port.with_context(|| {
        format!("teleop '{name}' is remote but lacks a port")
    })?;

    let manager = endpoint.manager.as_ref().map(|manager_config| {
        let manager_host =
            manager_config.host.clone().unwrap_or_else(|| host.clone());
        let timeout_ms = endpoint
            .timeout_ms
            .max(((manager_config.start_timeout_s + 5.0) * 1000.0) as u64);
        ManagedService::new(
            ManagerClient::new(
                &manager_host,
                manager_config.port,
                ClientOptions { timeout_ms, ..Default::default() },
            ),
            manager_config.service.clone(),
            manager_config.start_timeout_s,
            manager_config.stop_timeout_s,
        )
    });

    Ok((host, port, manager))
}

fn build_ai_provider(ai_config: &AiConfig) -> Result<Box<dyn CommandProvider>> {
    let client = RpcClient::new(
        &ai_config.host,
        ai_config.port,
        ClientOptions {
            timeout_ms: ai_config.timeout_ms,
            api_token: ai_config.api_token.clone(),
            ..Default::default()
        },
    );

    let observation_adapter = match &ai_config.modality_config_path {
        Some(path) => {
            let state_keys = ai_config.state_keys.clone().context(
                "ai.modality_config_path requires ai.state_keys",
            )?;
            ObservationAdapter::Groot(Gr00tObservationMapper::from_file(
                path,
                state_keys,
                ai_config.camera_keys.clone(),
            )?)
        }
        None => ObservationAdapter::Passthrough,
    };

    let action_adapter = match &ai_config.adapter {
        Some(groot) => ActionAdapter::Groot(groot.clone()),
        None => ActionAdapter::NumericOnly,
    };

    let preprocessed = ai_config.modality_config_path.is_some();
    Ok(Box::new(AiCommandProvider::new(
        client,
        ai_config.instruction_key.clone(),
        observation_adapter,
        action_adapter,
        ai_config.action_horizon,
        ai_config.startup_timeout_ms,
        preprocessed,
    )))
}

fn build_data_provider(
    data_config: &config::DataConfig,
) -> Result<Box<dyn CommandProvider>> {
    let teleop_endpoint = data_config
        .teleop
        .as_ref()
        .context("data mode requires a teleop configuration")?;

    if let Some(robot) = &data_config.robot {
        let channels =
            servolink_driver::make_robot(robot).action_features();
        info!(
            "data mode actuator channels: count={}, channels={}",
            channels.len(),
            channels.join(", ")
        );
    }

    let teleop = match teleop_endpoint.mode {
        TeleopMode::Local => {
            let spec = teleop_endpoint
                .config
                .as_ref()
                .context("data teleop is local but has no 'config' block")?;
            TeleopSource::Local(make_teleoperator(spec))
        }
        TeleopMode::Remote => {
            let (host, port, manager) =
                remote_endpoint("data", teleop_endpoint)?;
            TeleopSource::Remote(RemoteTeleopProvider::new(
                host,
                port,
                teleop_endpoint.timeout_ms,
                teleop_endpoint.api_token.clone(),
                manager,
            ))
        }
    };

    let dataset = &data_config.dataset;
    let settings = DataCollectionSettings {
        root: dataset.root.clone(),
        resume: data_config.resume,
        episode_time: Duration::from_secs_f64(dataset.episode_time_s),
        reset_time: Duration::from_secs_f64(dataset.reset_time_s),
        num_episodes: dataset.num_episodes,
        task: dataset.single_task.clone(),
        display_data: data_config.display_data,
        announce: data_config.play_sounds,
    };

    Ok(Box::new(DataCollectionProvider::new(
        settings, teleop, None, None, None,
    )))
}
