use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::ExitCode;

const EX_USAGE: u8 = 64;
const DEFAULT_SOCKET: &str = "/tmp/servolink-mode.sock";

type Result<T> = std::result::Result<T, ToolError>;

fn main() -> ExitCode {
    match run() {
        Ok(accepted) => {
            if accepted {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            let code = match err {
                ToolError::Usage(_) => EX_USAGE,
                ToolError::Runtime(_) => 1,
            };
            eprintln!("send-mode-command error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse(std::env::args().skip(1))?;
    let command = cli.command_json()?;

    let stream = UnixStream::connect(&cli.socket).map_err(|err| {
        runtime_err(
            format!("failed to connect to {}", cli.socket.display()),
            err,
        )
    })?;
    let mut writer = stream.try_clone().map_err(|err| {
        runtime_err("failed to clone dispatcher connection", err)
    })?;

    writer
        .write_all(format!("{command}\n").as_bytes())
        .map_err(|err| runtime_err("failed to send command", err))?;

    let mut reader = BufReader::new(stream);
    let mut reply = String::new();
    reader
        .read_line(&mut reply)
        .map_err(|err| runtime_err("failed to read reply", err))?;
    let reply = reply.trim_end();
    println!("{reply}");

    Ok(reply == "OK")
}

#[derive(Debug)]
struct Cli {
    socket: PathBuf,
    raw: Option<String>,
    teleop: Option<String>,
    infer: Option<String>,
    idle: bool,
    data: Option<String>,
    shutdown: bool,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut cli = Cli {
            socket: PathBuf::from(DEFAULT_SOCKET),
            raw: None,
            teleop: None,
            infer: None,
            idle: false,
            data: None,
            shutdown: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--socket" => {
                    cli.socket = args.next().map(PathBuf::from).ok_or_else(
                        || usage_err("missing value for --socket"),
                    )?;
                }
                "--teleop" => {
                    cli.teleop = Some(args.next().ok_or_else(|| {
                        usage_err("missing value for --teleop")
                    })?);
                }
                "--infer" => {
                    cli.infer = Some(args.next().ok_or_else(|| {
                        usage_err("missing value for --infer")
                    })?);
                }
                "--idle" => cli.idle = true,
                "--data" => {
                    cli.data = Some(args.next().unwrap_or_default());
                }
                "--shutdown" => cli.shutdown = true,
                "-h" | "--help" => {
                    return Err(usage_err(
                        "usage: send-mode-command [--socket path] (--teleop alias | --infer text | --idle | --data cmd | --shutdown | '<json>')",
                    ));
                }
                other if !other.starts_with('-') && cli.raw.is_none() => {
                    cli.raw = Some(other.to_string());
                }
                other => {
                    return Err(usage_err(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(cli)
    }

    fn command_json(&self) -> Result<String> {
        if let Some(raw) = &self.raw {
            // Validate operator-supplied JSON before shipping it.
            serde_json::from_str::<serde_json::Value>(raw).map_err(|err| {
                usage_err(format!("invalid JSON command: {err}"))
            })?;
            return Ok(raw.clone());
        }

        let command = if let Some(alias) = &self.teleop {
            serde_json::json!({"teleop": alias})
        } else if let Some(instruction) = &self.infer {
            serde_json::json!({"infer": instruction})
        } else if self.idle {
            serde_json::json!({"idle": ""})
        } else if let Some(control) = &self.data {
            serde_json::json!({"data": control})
        } else if self.shutdown {
            serde_json::json!({"shutdown": ""})
        } else {
            return Err(usage_err(
                "no command given (try --teleop, --infer, --idle, --data, --shutdown or raw JSON)",
            ));
        };
        Ok(command.to_string())
    }
}

#[derive(Debug)]
enum ToolError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for ToolError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ToolError::Usage(msg) => write!(f, "{msg}"),
            ToolError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ToolError {}

fn usage_err(message: impl Into<String>) -> ToolError {
    ToolError::Usage(message.into())
}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display,
) -> ToolError {
    ToolError::Runtime(format!("{}: {err}", context.into()))
}
