use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use servolink_helpers::{logging, shutdown};
use servolink_manager::config::Config;
use servolink_manager::ProcessManager;
use servolink_proto::RpcServer;
use tracing::info;

const EXIT_CONFIG: u8 = 1;
const EXIT_SIGINT: u8 = 130;

#[derive(Debug)]
struct Args {
    config_path: Option<PathBuf>,
}

impl Args {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut config_path = None;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    config_path = args.next().map(PathBuf::from);
                    if config_path.is_none() {
                        bail!("missing value for --config");
                    }
                }
                "-h" | "--help" => {
                    bail!("usage: servolink-manager [--config path]");
                }
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(Self { config_path })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    logging::init_logging(
        "servolink-manager",
        "servolink_manager=info,servolink_proto=info",
    );

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("servolink-manager: {err}");
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
            eprintln!("servolink-manager: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = Config::load(args.config_path)
        .context("failed to load configuration")?;

    let manager = Arc::new(ProcessManager::new(config.services.clone()));
    let mut server = RpcServer::bind(
        &config.network.host,
        config.network.port,
        config.network.api_token.clone(),
    )
    .await
    .context("failed to bind rpc server")?;
    manager.register_endpoints(&mut server);

    let run_token = server.run_token();
    let signalled = Arc::new(AtomicBool::new(false));
    {
        let token = run_token.clone();
        let signalled = signalled.clone();
        tokio::spawn(async move {
            shutdown::listen_shutdown(token).await;
            signalled.store(true, Ordering::SeqCst);
        });
    }

    info!(
        "process manager starting: listen={}:{}, services={}",
        config.network.host,
        config.network.port,
        config.services.len()
    );

    server.run().await.context("rpc server failed")?;

    // Reap whatever is still running before exiting.
    for name in config.services.keys() {
        let _ = manager.stop_service(name, None).await;
    }

    Ok(signalled.load(Ordering::SeqCst))
}
