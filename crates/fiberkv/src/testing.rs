// SPDX-License-Identifier: Apache-2.0

//! Loopback RESP server backed by a [`MemoryStore`], for tests that need a real
//! socket without an external server.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::commands::{Existence, KeyValueCommands, SetOptions};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::protocol::{read_value, write_value, Value};

pub struct MemoryServer {
    addr: SocketAddr,
    store: MemoryStore,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
    accept_thread: Option<JoinHandle<()>>,
}

/// Accepted streams and the threads serving them.
#[derive(Default)]
struct Connections {
    open: Mutex<Vec<(TcpStream, JoinHandle<()>)>>,
}

impl Connections {
    fn track(&self, stream: TcpStream, handle: JoinHandle<()>) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.retain(|(_, handle)| !handle.is_finished());
        open.push((stream, handle));
    }

    fn live(&self) -> usize {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    /// Shuts every stream down so blocked readers see EOF, then joins them.
    fn close_all(&self) {
        let open = std::mem::take(&mut *self.open.lock().unwrap_or_else(PoisonError::into_inner));
        for (stream, _) in &open {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for (_, handle) in open {
            let _ = handle.join();
        }
    }
}

impl MemoryServer {
    /// Binds `127.0.0.1:0` and starts accepting connections.
    pub fn start() -> Result<Self> {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let connections = Arc::new(Connections::default());

        let accept_store = store.clone();
        let accept_shutdown = shutdown.clone();
        let accept_connections = connections.clone();
        let accept_thread = thread::Builder::new()
            .name("fiberkv-memory-server".to_string())
            .spawn(move || {
                accept_loop(listener, accept_store, accept_shutdown, accept_connections)
            })?;

        Ok(Self {
            addr,
            store,
            shutdown,
            connections,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Number of connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.connections.live()
    }
}

impl Drop for MemoryServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake the accept loop so it observes the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.connections.close_all();
    }
}

fn accept_loop(
    listener: TcpListener,
    store: MemoryStore,
    shutdown: Arc<AtomicBool>,
    connections: Arc<Connections>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Ok(stream) = stream else {
            continue;
        };
        let Ok(tracked) = stream.try_clone() else {
            continue;
        };
        let store = store.clone();
        let spawned = thread::Builder::new()
            .name("fiberkv-memory-conn".to_string())
            .spawn(move || {
                if let Err(err) = serve_connection(stream, store) {
                    debug!(error = %err, "memory server connection closed");
                }
            });
        match spawned {
            Ok(handle) => connections.track(tracked, handle),
            Err(err) => debug!(error = %err, "memory server could not spawn connection thread"),
        }
    }
}

fn serve_connection(stream: TcpStream, store: MemoryStore) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    loop {
        let request = match read_value(&mut reader) {
            Ok(value) => value,
            // Peer hung up between requests.
            Err(Error::InvalidResponse(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let reply = match request_args(request) {
            Ok(args) => dispatch(&store, &args),
            Err(err) => Value::Error(format!("ERR {err}")),
        };
        write_value(&mut writer, &reply)?;
        writer.flush()?;
    }
}

fn request_args(request: Value) -> Result<Vec<Vec<u8>>> {
    let Value::Array(items) = request else {
        return Err(Error::invalid_response("request must be an array"));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Bulk(bytes) => Ok(bytes),
            other => Err(Error::invalid_response(format!(
                "request argument must be a bulk string, got {}",
                other.kind()
            ))),
        })
        .collect()
}

/// Executes one command against `store` and encodes the reply.
pub fn dispatch(store: &MemoryStore, args: &[Vec<u8>]) -> Value {
    match execute(store, args) {
        Ok(value) => value,
        Err(Error::Server(err)) => Value::Error(err.to_string()),
        Err(err) => Value::Error(format!("ERR {err}")),
    }
}

fn execute(store: &MemoryStore, args: &[Vec<u8>]) -> Result<Value> {
    let ctx = RequestContext::background();
    let Some((name, rest)) = args.split_first() else {
        return Err(Error::server("ERR", "empty command"));
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
    let wrong_arity = || {
        Error::server(
            "ERR",
            format!("wrong number of arguments for '{}' command", name.to_lowercase()),
        )
    };
    let arity = |min: usize, exact: bool| -> Result<()> {
        if rest.len() < min || (exact && rest.len() != min) {
            Err(wrong_arity())
        } else {
            Ok(())
        }
    };

    let value = match name.as_str() {
        "PING" => {
            store.ping(&ctx)?;
            Value::Simple("PONG".to_string())
        }
        "CLIENT" => {
            arity(2, true)?;
            Value::ok()
        }
        "SET" => {
            arity(2, false)?;
            let options = parse_set_options(&rest[2..])?;
            if options == SetOptions::default() {
                store.set(&ctx, &rest[0], &rest[1])?;
                Value::ok()
            } else if store.set_with(&ctx, &rest[0], &rest[1], options)? {
                Value::ok()
            } else {
                Value::Nil
            }
        }
        "GET" => {
            arity(1, true)?;
            bulk(store.get(&ctx, &rest[0])?)
        }
        "GETSET" => {
            arity(2, true)?;
            bulk(store.getset(&ctx, &rest[0], &rest[1])?)
        }
        "MGET" => {
            arity(1, false)?;
            let keys: Vec<&[u8]> = rest.iter().map(Vec::as_slice).collect();
            Value::Array(store.mget(&ctx, &keys)?.into_iter().map(bulk).collect())
        }
        "MSET" | "MSETNX" => {
            if rest.is_empty() || rest.len() % 2 != 0 {
                return Err(wrong_arity());
            }
            let pairs: Vec<(&[u8], &[u8])> = rest
                .chunks_exact(2)
                .map(|pair| (pair[0].as_slice(), pair[1].as_slice()))
                .collect();
            if name == "MSET" {
                store.mset(&ctx, &pairs)?;
                Value::ok()
            } else {
                Value::Integer(store.msetnx(&ctx, &pairs)? as i64)
            }
        }
        "SETNX" => {
            arity(2, true)?;
            Value::Integer(store.setnx(&ctx, &rest[0], &rest[1])? as i64)
        }
        "SETEX" => {
            arity(3, true)?;
            let seconds = parse_number::<u64>(&rest[1])?;
            store.setex(&ctx, &rest[0], seconds, &rest[2])?;
            Value::ok()
        }
        "INCR" => {
            arity(1, true)?;
            Value::Integer(store.incr(&ctx, &rest[0])?)
        }
        "INCRBY" => {
            arity(2, true)?;
            Value::Integer(store.incr_by(&ctx, &rest[0], parse_number(&rest[1])?)?)
        }
        "DECR" => {
            arity(1, true)?;
            Value::Integer(store.decr(&ctx, &rest[0])?)
        }
        "DECRBY" => {
            arity(2, true)?;
            Value::Integer(store.decr_by(&ctx, &rest[0], parse_number(&rest[1])?)?)
        }
        "APPEND" => {
            arity(2, true)?;
            Value::Integer(store.append(&ctx, &rest[0], &rest[1])? as i64)
        }
        "SUBSTR" | "GETRANGE" => {
            arity(3, true)?;
            let start = parse_number(&rest[1])?;
            let end = parse_number(&rest[2])?;
            Value::Bulk(store.substr(&ctx, &rest[0], start, end)?)
        }
        "STRLEN" => {
            arity(1, true)?;
            Value::Integer(store.strlen(&ctx, &rest[0])? as i64)
        }
        "TTL" => {
            arity(1, true)?;
            Value::Integer(store.ttl(&ctx, &rest[0])?)
        }
        "DEL" => {
            arity(1, false)?;
            let keys: Vec<&[u8]> = rest.iter().map(Vec::as_slice).collect();
            Value::Integer(store.del(&ctx, &keys)? as i64)
        }
        "EXISTS" => {
            arity(1, true)?;
            Value::Integer(store.exists(&ctx, &rest[0])? as i64)
        }
        "FLUSHDB" => {
            store.flush_db(&ctx)?;
            Value::ok()
        }
        other => {
            return Err(Error::server(
                "ERR",
                format!("unknown command '{}'", other.to_lowercase()),
            ))
        }
    };
    Ok(value)
}

fn bulk(value: Option<Vec<u8>>) -> Value {
    value.map(Value::Bulk).unwrap_or(Value::Nil)
}

fn parse_number<T: std::str::FromStr>(raw: &[u8]) -> Result<T> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| Error::server("ERR", "value is not an integer or out of range"))
}

fn parse_set_options(flags: &[Vec<u8>]) -> Result<SetOptions> {
    let mut options = SetOptions::default();
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.to_ascii_uppercase().as_slice() {
            b"NX" if options.existence.is_none() => options.existence = Some(Existence::Nx),
            b"XX" if options.existence.is_none() => options.existence = Some(Existence::Xx),
            b"EX" | b"PX" if options.expiry.is_none() => {
                let raw = iter
                    .next()
                    .ok_or_else(|| Error::server("ERR", "syntax error"))?;
                let amount = parse_number::<u64>(raw)?;
                options = if flag.eq_ignore_ascii_case(b"EX") {
                    options.expire_seconds(amount)
                } else {
                    options.expire_millis(amount)
                };
            }
            _ => return Err(Error::server("ERR", "syntax error")),
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    #[test]
    fn dispatch_reports_unknown_commands_and_arity() {
        let store = MemoryStore::new();
        assert!(matches!(dispatch(&store, &args(&["NOPE"])), Value::Error(msg) if msg.starts_with("ERR unknown command")));
        assert!(matches!(dispatch(&store, &args(&["GET"])), Value::Error(msg) if msg.contains("wrong number of arguments")));
        assert!(matches!(dispatch(&store, &args(&["MSET", "a"])), Value::Error(_)));
    }

    #[test]
    fn set_flags_are_parsed() {
        let store = MemoryStore::new();
        assert_eq!(dispatch(&store, &args(&["SET", "k", "v", "xx", "ex", "2"])), Value::Nil);
        assert_eq!(dispatch(&store, &args(&["SET", "k", "v", "NX", "PX", "2000"])), Value::ok());
        assert_eq!(dispatch(&store, &args(&["SET", "k", "v", "NX"])), Value::Nil);
        assert!(matches!(dispatch(&store, &args(&["SET", "k", "v", "EX"])), Value::Error(_)));
        assert!(matches!(dispatch(&store, &args(&["SET", "k", "v", "NX", "XX"])), Value::Error(_)));
    }

    #[test]
    fn oversized_setex_is_an_error_reply() {
        let store = MemoryStore::new();
        assert_eq!(
            dispatch(&store, &args(&["SETEX", "k", "18446744073709551615", "v"])),
            Value::Error("ERR invalid expire time in 'setex' command".to_string())
        );
        assert_eq!(dispatch(&store, &args(&["SET", "k", "v"])), Value::ok());
    }

    #[test]
    fn drop_closes_open_connections() {
        use std::io::Read;
        use std::time::{Duration, Instant};

        let server = MemoryServer::start().unwrap();
        let mut idle = TcpStream::connect(server.addr()).unwrap();
        let started = Instant::now();
        while server.live_connections() == 0 {
            assert!(started.elapsed() < Duration::from_secs(5), "connection never tracked");
            thread::sleep(Duration::from_millis(5));
        }

        drop(server);

        idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn incr_error_is_forwarded_verbatim() {
        let store = MemoryStore::new();
        dispatch(&store, &args(&["SET", "k", "abc"]));
        assert_eq!(
            dispatch(&store, &args(&["INCR", "k"])),
            Value::Error("ERR value is not an integer or out of range".to_string())
        );
    }
}
