use std::fmt;
use std::io::Read;
use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

use servolink_proto::{decode_value, Value};

const EX_USAGE: u8 = 64;
const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

type Result<T> = std::result::Result<T, ProbeError>;

/// Subscribes to a camera publisher and prints one line per received
/// frame. Useful for checking topics, rates and envelope contents without
/// a browser.
fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                ProbeError::Usage(_) => EX_USAGE,
                ProbeError::Runtime(_) => 1,
            };
            eprintln!("camstream-probe error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse(std::env::args().skip(1))?;

    let mut stream = TcpStream::connect((cli.host.as_str(), cli.port))
        .map_err(|err| {
            runtime_err(
                format!("failed to connect to {}:{}", cli.host, cli.port),
                err,
            )
        })?;
    stream
        .set_read_timeout(Some(Duration::from_secs(cli.timeout_secs)))
        .map_err(|err| runtime_err("failed to set read timeout", err))?;

    println!("subscribed to {}:{}", cli.host, cli.port);

    let mut received = 0_u64;
    while cli.count == 0 || received < cli.count {
        let topic = read_part(&mut stream)?;
        let payload = read_part(&mut stream)?;
        received += 1;

        let topic = String::from_utf8_lossy(&topic).to_string();
        match decode_value(&payload, MAX_PART_BYTES) {
            Ok(envelope) => print_frame(&topic, &envelope, payload.len()),
            Err(err) => println!(
                "topic={topic} bytes={} (undecodable envelope: {err})",
                payload.len()
            ),
        }
    }

    Ok(())
}

fn print_frame(topic: &str, envelope: &Value, payload_bytes: usize) {
    let map = envelope.as_map();
    let field = |name: &str| -> String {
        map.and_then(|map| map.get(name))
            .map(|value| match value {
                Value::Str(text) => text.clone(),
                Value::Int(number) => number.to_string(),
                Value::Float(number) => format!("{number:.3}"),
                other => format!("{other:?}"),
            })
            .unwrap_or_else(|| "-".to_string())
    };
    let data_bytes = map
        .and_then(|map| map.get("data"))
        .and_then(|value| match value {
            Value::Bytes(bytes) => Some(bytes.len()),
            _ => None,
        })
        .unwrap_or(0);

    println!(
        "topic={topic} camera={} encoding={} size={}x{} quality={} jpeg_bytes={data_bytes} payload_bytes={payload_bytes} ts={}",
        field("camera"),
        field("encoding"),
        field("width"),
        field("height"),
        field("quality"),
        field("timestamp"),
    );
}

fn read_part(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|err| runtime_err("failed to read part length", err))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PART_BYTES {
        return Err(ProbeError::Runtime(format!(
            "part too large: {len} bytes"
        )));
    }
    let mut part = vec![0_u8; len];
    stream
        .read_exact(&mut part)
        .map_err(|err| runtime_err("failed to read part body", err))?;
    Ok(part)
}

#[derive(Debug)]
struct Cli {
    host: String,
    port: u16,
    count: u64,
    timeout_secs: u64,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut host = "127.0.0.1".to_string();
        let mut port = 7005_u16;
        let mut count = 0_u64;
        let mut timeout_secs = 10_u64;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" => {
                    host = args.next().ok_or_else(|| {
                        usage_err("missing value for --host")
                    })?;
                }
                "--port" => {
                    let raw = args.next().ok_or_else(|| {
                        usage_err("missing value for --port")
                    })?;
                    port = raw.parse().map_err(|_| {
                        usage_err("--port must be an integer")
                    })?;
                }
                "--count" => {
                    let raw = args.next().ok_or_else(|| {
                        usage_err("missing value for --count")
                    })?;
                    count = raw.parse().map_err(|_| {
                        usage_err("--count must be an integer")
                    })?;
                }
                "--timeout-secs" => {
                    let raw = args.next().ok_or_else(|| {
                        usage_err("missing value for --timeout-secs")
                    })?;
                    timeout_secs = raw.parse().map_err(|_| {
                        usage_err("--timeout-secs must be an integer")
                    })?;
                }
                "-h" | "--help" => {
                    return Err(usage_err(
                        "usage: camstream-probe [--host 127.0.0.1] [--port 7005] [--count N] [--timeout-secs 10]",
                    ));
                }
                other => {
                    return Err(usage_err(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(Self { host, port, count, timeout_secs })
    }
}

#[derive(Debug)]
enum ProbeError {
    Usage(String),
    Runtime(String),
}

impl fmt::Display for ProbeError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ProbeError::Usage(msg) => write!(f, "{msg}"),
            ProbeError::Runtime(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ProbeError {}

fn usage_err(message: impl Into<String>) -> ProbeError {
    ProbeError::Usage(message.into())
}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display,
) -> ProbeError {
    ProbeError::Runtime(format!("{}: {err}", context.into()))
}

#[cfg(test)]
mod tests {
    use super::Cli;

    #[test]
    fn defaults_and_overrides_parse() {
        let cli = Cli::parse(Vec::new().into_iter()).expect("parse");
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 7005);
        assert_eq!(cli.count, 0);

        let cli = Cli::parse(
            vec![
                "--host".to_string(),
                "10.0.0.3".to_string(),
                "--port".to_string(),
                "7010".to_string(),
                "--count".to_string(),
                "5".to_string(),
            ]
            .into_iter(),
        )
        .expect("parse");
        assert_eq!(cli.host, "10.0.0.3");
        assert_eq!(cli.port, 7010);
        assert_eq!(cli.count, 5);
    }

    #[test]
    fn bad_port_is_a_usage_error() {
        let err = Cli::parse(
            vec!["--port".to_string(), "seven".to_string()].into_iter(),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("--port"));
    }
}
