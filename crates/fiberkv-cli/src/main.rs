use clap::{ArgAction, Parser, Subcommand};
use fiberkv::{ClientOption, DEFAULT_ADDR, SetOptions, with_request_timeout};
use fiberkv_runtime::{BridgeConfig, FiberClient, KvResult, KvStore, SuspensionBridge};
use serde_json::{Value, json};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fiberkv-cli")]
#[command(about = "Issue key-value commands through the fiberkv suspension bridge")]
struct Cli {
    /// Server address; defaults to FIBERKV_ADDR, then 127.0.0.1:6379.
    #[arg(long)]
    addr: Option<String>,
    /// Run against a throwaway in-memory store instead of a server.
    #[arg(long, action = ArgAction::SetTrue)]
    memory: bool,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Ping,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "xx")]
        nx: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        xx: bool,
        #[arg(long, conflicts_with = "px")]
        ex: Option<u64>,
        #[arg(long)]
        px: Option<u64>,
    },
    Getset {
        key: String,
        value: String,
    },
    Mget {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,
    },
    Mset {
        #[arg(required = true, num_args = 2..)]
        pairs: Vec<String>,
    },
    Msetnx {
        #[arg(required = true, num_args = 2..)]
        pairs: Vec<String>,
    },
    Setnx {
        key: String,
        value: String,
    },
    Setex {
        key: String,
        seconds: u64,
        value: String,
    },
    Incr {
        key: String,
        #[arg(long, allow_negative_numbers = true)]
        by: Option<i64>,
    },
    Decr {
        key: String,
        #[arg(long, allow_negative_numbers = true)]
        by: Option<i64>,
    },
    Append {
        key: String,
        value: String,
    },
    Substr {
        key: String,
        #[arg(allow_negative_numbers = true)]
        start: i64,
        #[arg(allow_negative_numbers = true)]
        end: i64,
    },
    Strlen {
        key: String,
    },
    Ttl {
        key: String,
    },
    Del {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,
    },
    Exists {
        key: String,
    },
    Flushdb,
}

#[derive(Debug, PartialEq)]
enum Reply {
    Ok,
    Nil,
    Flag(bool),
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Option<Vec<u8>>>),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<ExitCode, String> {
    if let Commands::Mset { pairs } | Commands::Msetnx { pairs } = &cli.command {
        if pairs.len() % 2 != 0 {
            return Err("expected KEY VALUE pairs".to_string());
        }
    }

    let mut config = BridgeConfig::from_env();
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(timeout_ms));
    }
    let bridge = SuspensionBridge::new(config).map_err(|error| error.to_string())?;

    let store: Arc<dyn KvStore> = if cli.memory {
        Arc::new(FiberClient::in_memory(bridge.clone()))
    } else {
        let addr = cli
            .addr
            .or_else(|| {
                std::env::var("FIBERKV_ADDR")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            })
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let mut opts: Vec<ClientOption> = Vec::new();
        if let Some(timeout_ms) = cli.timeout_ms {
            opts.push(with_request_timeout(Duration::from_millis(timeout_ms)));
        }
        tracing::debug!(%addr, "connecting");
        let client = FiberClient::connect(bridge.clone(), addr, opts)
            .await
            .map_err(|error| error.to_string())?;
        Arc::new(client)
    };

    let reply = execute(store.as_ref(), cli.command)
        .await
        .map_err(|error| error.to_string())?;
    bridge.shutdown();

    if cli.json {
        println!("{}", render_json(&reply));
    } else {
        println!("{}", render_text(&reply));
    }
    Ok(ExitCode::SUCCESS)
}

async fn execute(store: &dyn KvStore, command: Commands) -> KvResult<Reply> {
    let reply = match command {
        Commands::Ping => {
            store.ping().await?;
            Reply::Ok
        }
        Commands::Get { key } => optional(store.get(key.as_bytes()).await?),
        Commands::Set {
            key,
            value,
            nx,
            xx,
            ex,
            px,
        } => {
            let mut options = match (nx, xx) {
                (true, _) => SetOptions::nx(),
                (_, true) => SetOptions::xx(),
                _ => SetOptions::default(),
            };
            if let Some(seconds) = ex {
                options = options.expire_seconds(seconds);
            }
            if let Some(millis) = px {
                options = options.expire_millis(millis);
            }
            if options == SetOptions::default() {
                store.set(key.as_bytes(), value.as_bytes()).await?;
                Reply::Ok
            } else if store
                .set_with(key.as_bytes(), value.as_bytes(), options)
                .await?
            {
                Reply::Ok
            } else {
                Reply::Nil
            }
        }
        Commands::Getset { key, value } => {
            optional(store.getset(key.as_bytes(), value.as_bytes()).await?)
        }
        Commands::Mget { keys } => {
            let keys: Vec<&[u8]> = keys.iter().map(|key| key.as_bytes()).collect();
            Reply::List(store.mget(&keys).await?)
        }
        Commands::Mset { pairs } => {
            store.mset(&byte_pairs(&pairs)).await?;
            Reply::Ok
        }
        Commands::Msetnx { pairs } => Reply::Flag(store.msetnx(&byte_pairs(&pairs)).await?),
        Commands::Setnx { key, value } => {
            Reply::Flag(store.setnx(key.as_bytes(), value.as_bytes()).await?)
        }
        Commands::Setex {
            key,
            seconds,
            value,
        } => {
            store
                .setex(key.as_bytes(), seconds, value.as_bytes())
                .await?;
            Reply::Ok
        }
        Commands::Incr { key, by } => Reply::Integer(match by {
            Some(delta) => store.incr_by(key.as_bytes(), delta).await?,
            None => store.incr(key.as_bytes()).await?,
        }),
        Commands::Decr { key, by } => Reply::Integer(match by {
            Some(delta) => store.decr_by(key.as_bytes(), delta).await?,
            None => store.decr(key.as_bytes()).await?,
        }),
        Commands::Append { key, value } => {
            let len = store.append(key.as_bytes(), value.as_bytes()).await?;
            Reply::Integer(len as i64)
        }
        Commands::Substr { key, start, end } => {
            Reply::Bytes(store.substr(key.as_bytes(), start, end).await?)
        }
        Commands::Strlen { key } => Reply::Integer(store.strlen(key.as_bytes()).await? as i64),
        Commands::Ttl { key } => Reply::Integer(store.ttl(key.as_bytes()).await?),
        Commands::Del { keys } => {
            let keys: Vec<&[u8]> = keys.iter().map(|key| key.as_bytes()).collect();
            Reply::Integer(store.del(&keys).await? as i64)
        }
        Commands::Exists { key } => Reply::Flag(store.exists(key.as_bytes()).await?),
        Commands::Flushdb => {
            store.flush_db().await?;
            Reply::Ok
        }
    };
    Ok(reply)
}

fn optional(value: Option<Vec<u8>>) -> Reply {
    value.map(Reply::Bytes).unwrap_or(Reply::Nil)
}

fn byte_pairs(pairs: &[String]) -> Vec<(&[u8], &[u8])> {
    pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].as_bytes(), pair[1].as_bytes()))
        .collect()
}

fn render_text(reply: &Reply) -> String {
    match reply {
        Reply::Ok => "OK".to_string(),
        Reply::Nil => "(nil)".to_string(),
        Reply::Flag(flag) => format!("(integer) {}", u8::from(*flag)),
        Reply::Integer(value) => format!("(integer) {value}"),
        Reply::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Reply::List(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| match item {
                Some(bytes) => format!("{}) {}", index + 1, String::from_utf8_lossy(bytes)),
                None => format!("{}) (nil)", index + 1),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn render_json(reply: &Reply) -> Value {
    match reply {
        Reply::Ok => json!("OK"),
        Reply::Nil => Value::Null,
        Reply::Flag(flag) => json!(flag),
        Reply::Integer(value) => json!(value),
        Reply::Bytes(bytes) => json!(String::from_utf8_lossy(bytes)),
        Reply::List(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Some(bytes) => json!(String::from_utf8_lossy(bytes)),
                    None => Value::Null,
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_rendering_matches_reply_kinds() {
        assert_eq!(render_text(&Reply::Ok), "OK");
        assert_eq!(render_text(&Reply::Nil), "(nil)");
        assert_eq!(render_text(&Reply::Flag(false)), "(integer) 0");
        assert_eq!(
            render_text(&Reply::List(vec![Some(b"a".to_vec()), None])),
            "1) a\n2) (nil)"
        );
    }

    #[test]
    fn json_rendering_uses_null_for_missing_values() {
        assert_eq!(
            render_json(&Reply::List(vec![None, Some(b"x".to_vec())])),
            json!([null, "x"])
        );
        assert_eq!(render_json(&Reply::Flag(true)), json!(true));
    }
}
