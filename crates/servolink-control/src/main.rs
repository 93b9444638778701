mod config;
mod core;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use servolink_helpers::{logging, shutdown};
use servolink_proto::{ClientOptions, RpcClient, Value, ValueMap};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::camera::{CameraSource, CameraStreamSettings, CameraStreamer};
use crate::core::client::CommandChannelClient;
use crate::core::command_loop::CommandLoop;
use crate::core::filter::MedianActionFilter;
use crate::core::service::{
    parse_interpolation, ObservationAdapterKind, PreprocessSettings,
    RobotControlService,
};

const EXIT_CONFIG: u8 = 1;
const EXIT_SIGINT: u8 = 130;

#[derive(Debug)]
struct Args {
    config_path: Option<PathBuf>,
    no_calibrate: bool,
}

impl Args {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut config_path = None;
        let mut no_calibrate = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config_path = args.next().map(PathBuf::from);
                    if config_path.is_none() {
                        bail!("missing value for --config");
                    }
                }
                "--no-calibrate" => no_calibrate = true,
                "-h" | "--help" => {
                    bail!("usage: servolink-control [--config path] [--no-calibrate]");
                }
                other => bail!("unknown argument: {other}"),
            }
        }

        Ok(Self { config_path, no_calibrate })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    logging::init_logging(
        "servolink-control",
        "servolink_control=info,servolink_proto=info",
    );

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("servolink-control: {err}");
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
            eprintln!("servolink-control: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = Config::load(args.config_path)
        .context("failed to load configuration")?;

    let robot = servolink_driver::make_robot(&config.robot);
    let adapter = match config.observation_adapter.as_str() {
        "identity" => ObservationAdapterKind::Identity,
        _ => ObservationAdapterKind::NumericOnly,
    };
    let preprocess =
        config.observation_preprocess.as_ref().map(|settings| {
            PreprocessSettings {
                target_height: settings.target_height,
                target_width: settings.target_width,
                filter: parse_interpolation(&settings.interpolation),
            }
        });
    let mut service = RobotControlService::new(robot, adapter, preprocess);

    let client = CommandChannelClient::new(RpcClient::new(
        &config.network.host,
        config.network.port,
        ClientOptions {
            timeout_ms: config.network.timeout_ms,
            api_token: config.network.api_token.clone(),
            ..Default::default()
        },
    ));

    let shutdown_token = CancellationToken::new();
    let signalled = Arc::new(AtomicBool::new(false));
    {
        let token = shutdown_token.clone();
        let signalled = signalled.clone();
        tokio::spawn(async move {
            shutdown::listen_shutdown(token).await;
            signalled.store(true, Ordering::SeqCst);
        });
    }

    let camera = match &config.camera_stream {
        Some(stream) => {
            let sources = stream
                .sources
                .iter()
                .map(|source| CameraSource {
                    name: source.name.clone(),
                    path: source.path.clone(),
                    min_interval: source
                        .fps
                        .filter(|fps| *fps > 0.0)
                        .map(|fps| Duration::from_secs_f64(1.0 / fps)),
                    quality: source.quality.unwrap_or(stream.quality),
                })
                .collect();
            Some(
                CameraStreamer::start(
                    CameraStreamSettings {
                        host: stream.host.clone(),
                        port: stream.port,
                        sources,
                    },
                    shutdown_token.clone(),
                )
                .await?,
            )
        }
        None => None,
    };

    let calibrate = config.calibrate_on_start && !args.no_calibrate;
    service.connect(calibrate).await?;

    let filter = config
        .action_filter
        .as_ref()
        .map(|settings| {
            MedianActionFilter::new(settings.window_size, settings.blend_alpha)
        });

    let mut command_loop = CommandLoop::new(
        service,
        client,
        config.loop_hz,
        config.max_missed_actions,
        config.fallback_action.clone(),
        filter,
        camera,
    );

    let action_keys = command_loop.service_mut().action_features();
    announce_config(command_loop.client_mut(), &config, action_keys).await;

    info!(
        "edge controller starting: orchestrator={}:{}, rate_hz={}",
        config.network.host, config.network.port, config.loop_hz
    );

    let loop_result = command_loop.run(shutdown_token.clone()).await;
    if let Err(err) = command_loop.service_mut().disconnect().await {
        warn!("robot disconnect failed: error={err}");
    }
    loop_result?;

    Ok(signalled.load(Ordering::SeqCst))
}

/// Best-effort `sync_config` so the orchestrator knows this edge's
/// actuator channels; a missing orchestrator is not fatal at startup.
async fn announce_config(
    client: &mut CommandChannelClient,
    config: &Config,
    action_keys: Vec<String>,
) {
    let mut body = ValueMap::new();
    body.insert(
        "action_keys".to_string(),
        Value::List(action_keys.into_iter().map(Value::Str).collect()),
    );
    if let Some(metadata) = &config.metadata {
        body.insert("metadata".to_string(), yaml_to_value(metadata));
    }

    if let Err(err) = client.sync_config(Value::Map(body)).await {
        warn!("sync_config failed (continuing): error={err}");
    }
}

/// Shallow conversion of config metadata into wire values.
fn yaml_to_value(raw: &serde_yaml::Value) -> Value {
    match raw {
        serde_yaml::Value::Null => Value::Nil,
        serde_yaml::Value::Bool(flag) => Value::Bool(*flag),
        serde_yaml::Value::Number(number) => {
            if let Some(signed) = number.as_i64() {
                Value::Int(signed)
            } else {
                Value::Float(number.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::String(text) => Value::Str(text.clone()),
        serde_yaml::Value::Sequence(items) => {
            Value::List(items.iter().map(yaml_to_value).collect())
        }
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = ValueMap::new();
            for (key, value) in mapping {
                if let serde_yaml::Value::String(key) = key {
                    map.insert(key.clone(), yaml_to_value(value));
                }
            }
            Value::Map(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(&tagged.value),
    }
}
