use std::fs::File;
use std::future::Future;
use std::io::{self, BufRead, BufReader};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ducts::discovery;
use ducts::{Duct, DuctConfig, DuctError, OpenParams, Reply};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Duct(#[from] DuctError),
    #[error("unknown event `{0}`; not in the discovery EVENT table")]
    UnknownEvent(String),
    #[error("invalid --param `{0}`; expected key=value")]
    InvalidParam(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("missing expected field `{0}`")]
    MissingField(&'static str),
}

#[derive(Parser, Debug)]
#[command(name = "ducts-cli", about = "Ducts discovery and websocket CLI")]
struct Cli {
    #[arg(long, env = "DUCTS_WSD_URL", default_value = "http://127.0.0.1:8080/ducts/wsd")]
    wsd_url: String,

    /// Session id sent as `uuid`; random when unset.
    #[arg(long, env = "DUCTS_SESSION_ID")]
    session_id: Option<String>,

    /// Extra discovery query parameter, repeatable.
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the discovery descriptor without connecting.
    Discover,
    /// Call one event and print the reply.
    Call(CallArgs),
    /// Run calls from JSON lines `{"event": ..., "data": ...}`.
    Batch(BatchArgs),
    /// Print the clock estimate from the open-time probe.
    Clock,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Event name from the EVENT table, or a numeric id.
    event: String,

    #[arg(long, default_value = "null", help = "JSON payload")]
    data: String,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let params = open_params(cli.session_id, &cli.params)?;
    let timeout = Duration::from_secs(cli.timeout_secs);
    let config = DuctConfig::from_env();

    if let Command::Discover = cli.command {
        return run_discover(&config, &cli.wsd_url, &params).await;
    }

    let duct = Duct::with_config(config);
    within(timeout, duct.open(&cli.wsd_url, &params)).await?;
    let result = match cli.command {
        Command::Call(args) => run_call(&duct, timeout, &args).await,
        Command::Batch(args) => run_batch(&duct, timeout, &args).await,
        Command::Clock => run_clock(&duct, timeout).await,
        Command::Discover => Ok(()),
    };
    within(timeout, duct.close()).await?;
    result
}

async fn run_discover(config: &DuctConfig, wsd_url: &str, params: &OpenParams) -> Result<(), CliError> {
    let client = discovery::http_client(config)?;
    let wsd = discovery::discover(&client, wsd_url, params).await?;
    let events = wsd
        .event
        .iter()
        .map(|(name, eid)| (name.to_owned(), Value::from(eid)))
        .collect::<Map<String, Value>>();
    print_json(&serde_json::json!({
        "websocket_url": wsd.websocket_url,
        "websocket_url_reconnect": wsd.reconnect_url(),
        "EVENT": events,
    }))
}

async fn run_call(duct: &Duct, timeout: Duration, args: &CallArgs) -> Result<(), CliError> {
    let eid = resolve_event(duct, &args.event)?;
    let data = serde_json::from_str::<Value>(&args.data)?;
    let reply = within(timeout, duct.call(eid, frames::json_to_value(&data))).await?;
    print_reply(reply, timeout).await
}

async fn run_batch(duct: &Duct, timeout: Duration, args: &BatchArgs) -> Result<(), CliError> {
    let mut reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&args.input)?))
    };

    let mut calls = 0_usize;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let Some((event, data)) = parse_batch_line(&line)? else {
            continue;
        };
        let eid = resolve_event(duct, &event)?;
        let reply = within(timeout, duct.call(eid, frames::json_to_value(&data))).await?;
        print_reply(reply, timeout).await?;
        calls = calls.saturating_add(1);
    }
    eprintln!("completed {calls} calls");
    Ok(())
}

async fn run_clock(duct: &Duct, timeout: Duration) -> Result<(), CliError> {
    let wait = async {
        while duct.clock().count == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| CliError::Timeout(timeout))?;

    let clock = duct.clock();
    print_json(&serde_json::json!({
        "offset": clock.offset,
        "latency": clock.latency,
        "count": clock.count,
    }))
}

async fn print_reply(reply: Reply, timeout: Duration) -> Result<(), CliError> {
    let stream = match reply {
        Reply::Value(value) => return print_json(&frames::value_to_json(&value)),
        Reply::Stream(stream) => stream,
    };
    loop {
        let item = tokio::time::timeout(timeout, stream.dequeue())
            .await
            .map_err(|_| CliError::Timeout(timeout))?;
        match item {
            Ok(Some(value)) => print_json(&frames::value_to_json(&value))?,
            Ok(None) => return Ok(()),
            Err(error) => eprintln!("stream item failed: {error}"),
        }
    }
}

async fn within<T>(timeout: Duration, fut: impl Future<Output = Result<T, DuctError>>) -> Result<T, CliError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CliError::Timeout(timeout))?
        .map_err(CliError::from)
}

fn resolve_event(duct: &Duct, event: &str) -> Result<i32, CliError> {
    event
        .parse::<i32>()
        .ok()
        .or_else(|| duct.event(event))
        .ok_or_else(|| CliError::UnknownEvent(event.to_owned()))
}

fn open_params(session_id: Option<String>, raw: &[String]) -> Result<OpenParams, CliError> {
    let mut params = OpenParams {
        session_id,
        ..OpenParams::default()
    };
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CliError::InvalidParam(pair.clone()));
        };
        params = params.with_param(key, value);
    }
    Ok(params)
}

fn parse_batch_line(line: &str) -> Result<Option<(String, Value)>, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut value = serde_json::from_str::<Value>(trimmed)?;
    let Some(map) = value.as_object_mut() else {
        return Ok(None);
    };
    let event = match map.remove("event") {
        Some(Value::String(name)) => name,
        Some(Value::Number(eid)) => eid.to_string(),
        _ => return Err(CliError::MissingField("event")),
    };
    let data = map.remove("data").unwrap_or(Value::Null);
    Ok(Some((event, data)))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
