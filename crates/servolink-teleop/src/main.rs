mod config;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use servolink_driver::make_teleoperator;
use servolink_helpers::{logging, shutdown};
use servolink_proto::RpcServer;
use tracing::info;

use crate::config::Config;
use crate::server::TeleopActionServer;

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
                    bail!("usage: servolink-teleop [--config path]");
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
        "servolink-teleop",
        "servolink_teleop=info,servolink_proto=info",
    );

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("servolink-teleop: {err}");
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
            eprintln!("servolink-teleop: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = Config::load(args.config_path)
        .context("failed to load configuration")?;

    let teleop = make_teleoperator(&config.teleop);
    let service = Arc::new(TeleopActionServer::new(
        config.teleop_id.clone(),
        teleop,
        None,
        None,
    ));

    let mut server = RpcServer::bind(
        &config.network.host,
        config.network.port,
        config.network.api_token.clone(),
    )
    .await
    .context("failed to bind rpc server")?;
    service.register_endpoints(&mut server);

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
        "teleop server starting: listen={}:{}, teleop_id={}",
        config.network.host, config.network.port, config.teleop_id
    );

    service.serve(server).await?;
    Ok(signalled.load(Ordering::SeqCst))
}
