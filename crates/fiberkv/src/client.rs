// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::commands::{Existence, Expiry, KeyValueCommands, SetOptions};
use crate::context::RequestContext;
use crate::error::{Error, Result, ServerError};
use crate::protocol::{self, Value, DEFAULT_DIAL_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, POLL_INTERVAL};

pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub client_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            client_name: None,
        }
    }
}

/// Functional option applied to a [`ClientConfig`] at dial time.
#[derive(Clone)]
pub struct ClientOption(Arc<dyn Fn(&mut ClientConfig) + Send + Sync>);

impl ClientOption {
    pub fn new(apply: impl Fn(&mut ClientConfig) + Send + Sync + 'static) -> Self {
        Self(Arc::new(apply))
    }

    fn apply(&self, config: &mut ClientConfig) {
        (self.0)(config)
    }
}

impl fmt::Debug for ClientOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientOption(..)")
    }
}

pub fn with_dial_timeout(timeout: Duration) -> ClientOption {
    ClientOption::new(move |config| config.dial_timeout = timeout)
}

pub fn with_request_timeout(timeout: Duration) -> ClientOption {
    ClientOption::new(move |config| config.request_timeout = timeout)
}

/// Announces the connection under `name` via `CLIENT SETNAME` after every dial.
pub fn with_client_name(name: impl Into<String>) -> ClientOption {
    let name = name.into();
    ClientOption::new(move |config| config.client_name = Some(name.clone()))
}

/// Connects to `addr` and returns a ready client.
pub fn dial(addr: &str, opts: impl IntoIterator<Item = ClientOption>) -> Result<Client> {
    let mut config = ClientConfig::default();
    for opt in opts {
        opt.apply(&mut config);
    }
    let client = Client {
        addr: addr.to_string(),
        config,
        conn: Mutex::new(None),
        closed: AtomicBool::new(false),
    };
    let stream = client.open(&RequestContext::background())?;
    *client.lock_conn()? = Some(stream);
    Ok(client)
}

/// Blocking client over a single TCP connection.
///
/// Requests are serialized on an internal mutex, so one client can be shared
/// behind an `Arc`. A connection that fails mid-request (I/O error, timeout,
/// cancellation, framing error) is dropped and redialed on the next request.
pub struct Client {
    addr: String,
    config: ClientConfig,
    conn: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Client {
    /// Dials `FIBERKV_ADDR`, falling back to [`DEFAULT_ADDR`].
    pub fn connect_from_env() -> Result<Self> {
        let addr = std::env::var("FIBERKV_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        dial(&addr, Vec::new())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Closes the connection. Later requests fail with [`Error::ClientClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut conn) = self.conn.lock() {
            if let Some(stream) = conn.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends one command and waits for its reply. Error replies come back as
    /// [`Error::Server`] and leave the connection usable.
    pub fn send_request(&self, ctx: &RequestContext, args: &[&[u8]]) -> Result<Value> {
        ctx.check()?;
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }

        let mut conn = self.lock_conn()?;
        // The request may have been cancelled while queued behind another one.
        ctx.check()?;
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        if conn.is_none() {
            debug!(addr = %self.addr, "redialing dropped connection");
            *conn = Some(self.open(ctx)?);
        }
        let Some(stream) = conn.as_ref() else {
            return Err(Error::ClientClosed);
        };

        match exchange(stream, ctx, self.config.request_timeout, args) {
            Ok(Value::Error(line)) => Err(Error::Server(ServerError::parse(&line))),
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(addr = %self.addr, error = %err, "dropping connection after failed request");
                if let Some(stream) = conn.take() {
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
                Err(err)
            }
        }
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Option<TcpStream>>> {
        self.conn.lock().map_err(|_| Error::ClientClosed)
    }

    fn open(&self, ctx: &RequestContext) -> Result<TcpStream> {
        let dial_deadline = ctx.effective_deadline(self.config.dial_timeout);
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            let timeout = remaining(dial_deadline)?;
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(addr = %addr, "connected");
                    self.handshake(&stream, ctx)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) if err.kind() == ErrorKind::TimedOut => Error::Timeout,
            Some(err) => Error::Io(err),
            None => Error::invalid_argument(format!("address resolved to nothing: {}", self.addr)),
        })
    }

    fn handshake(&self, stream: &TcpStream, ctx: &RequestContext) -> Result<()> {
        let Some(name) = self.config.client_name.as_deref() else {
            return Ok(());
        };
        match exchange(
            stream,
            ctx,
            self.config.request_timeout,
            &[b"CLIENT", b"SETNAME", name.as_bytes()],
        )? {
            Value::Error(line) => Err(Error::Server(ServerError::parse(&line))),
            other => expect_ok(other),
        }
    }

    fn command(&self, ctx: &RequestContext, args: &[&[u8]]) -> Result<Value> {
        self.send_request(ctx, args)
    }
}

/// Writes one command and reads one reply, honoring cancellation and the
/// earlier of the context deadline and `request_timeout`.
fn exchange(
    stream: &TcpStream,
    ctx: &RequestContext,
    request_timeout: Duration,
    args: &[&[u8]],
) -> Result<Value> {
    let deadline = ctx.effective_deadline(request_timeout);

    let mut frame = Vec::with_capacity(16 + args.iter().map(|arg| arg.len() + 16).sum::<usize>());
    protocol::write_command(&mut frame, args)?;
    stream.set_write_timeout(Some(remaining(deadline)?))?;
    let mut writer = stream;
    writer
        .write_all(&frame)
        .map_err(|err| classify(ctx, deadline, err))?;

    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut reader = BufReader::new(WatchedRead {
        stream,
        ctx,
        deadline,
    });
    let value = protocol::read_value(&mut reader).map_err(|err| match err {
        Error::Io(err) => classify(ctx, deadline, err),
        other => other,
    })?;
    if !reader.buffer().is_empty() {
        return Err(Error::invalid_response("unexpected data after reply"));
    }
    Ok(value)
}

/// A read half that wakes up every [`POLL_INTERVAL`] to check whether the
/// request was cancelled or ran past its deadline.
struct WatchedRead<'a> {
    stream: &'a TcpStream,
    ctx: &'a RequestContext,
    deadline: Instant,
}

impl Read for WatchedRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut stream = self.stream;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if self.ctx.is_cancelled() {
                        return Err(std::io::Error::new(ErrorKind::Other, "request cancelled"));
                    }
                    if Instant::now() >= self.deadline {
                        return Err(std::io::Error::new(ErrorKind::TimedOut, "deadline exceeded"));
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

fn classify(ctx: &RequestContext, deadline: Instant, err: std::io::Error) -> Error {
    if ctx.is_cancelled() {
        Error::Cancelled
    } else if Instant::now() >= deadline
        || matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
    {
        Error::Timeout
    } else {
        Error::Io(err)
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => Err(Error::Timeout),
    }
}

fn unexpected(command: &str, value: &Value) -> Error {
    Error::invalid_response(format!("{command}: unexpected {} reply", value.kind()))
}

fn expect_ok(value: Value) -> Result<()> {
    match value {
        Value::Simple(_) => Ok(()),
        other => Err(unexpected("status", &other)),
    }
}

fn expect_int(value: Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(i),
        other => Err(unexpected("integer", &other)),
    }
}

fn expect_len(value: Value) -> Result<u64> {
    let len = expect_int(value)?;
    u64::try_from(len).map_err(|_| Error::invalid_response(format!("negative length {len}")))
}

fn expect_bulk(value: Value) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Bulk(bytes) => Ok(Some(bytes)),
        Value::Nil => Ok(None),
        other => Err(unexpected("bulk", &other)),
    }
}

fn expect_bulk_array(value: Value) -> Result<Vec<Option<Vec<u8>>>> {
    match value {
        Value::Array(items) => items.into_iter().map(expect_bulk).collect(),
        other => Err(unexpected("array", &other)),
    }
}

fn flatten_pairs<'a>(command: &'a [u8], pairs: &[(&'a [u8], &'a [u8])]) -> Result<Vec<&'a [u8]>> {
    if pairs.is_empty() {
        return Err(Error::invalid_argument("at least one key/value pair is required"));
    }
    let mut args = Vec::with_capacity(1 + pairs.len() * 2);
    args.push(command);
    for (key, value) in pairs {
        args.push(*key);
        args.push(*value);
    }
    Ok(args)
}

impl KeyValueCommands for Client {
    fn ping(&self, ctx: &RequestContext) -> Result<()> {
        expect_ok(self.command(ctx, &[b"PING"])?)
    }

    fn set(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<()> {
        expect_ok(self.command(ctx, &[b"SET", key, value])?)
    }

    fn set_with(
        &self,
        ctx: &RequestContext,
        key: &[u8],
        value: &[u8],
        options: SetOptions,
    ) -> Result<bool> {
        let expiry = options.expiry.map(|expiry| match expiry {
            Expiry::Seconds(secs) => (&b"EX"[..], secs.to_string()),
            Expiry::Millis(millis) => (&b"PX"[..], millis.to_string()),
        });
        let mut args: Vec<&[u8]> = vec![&b"SET"[..], key, value];
        match options.existence {
            Some(Existence::Nx) => args.push(b"NX"),
            Some(Existence::Xx) => args.push(b"XX"),
            None => {}
        }
        if let Some((flag, amount)) = &expiry {
            args.push(*flag);
            args.push(amount.as_bytes());
        }
        match self.command(ctx, &args)? {
            Value::Simple(_) => Ok(true),
            Value::Nil => Ok(false),
            other => Err(unexpected("SET", &other)),
        }
    }

    fn get(&self, ctx: &RequestContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        expect_bulk(self.command(ctx, &[b"GET", key])?)
    }

    fn getset(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        expect_bulk(self.command(ctx, &[b"GETSET", key, value])?)
    }

    fn mget(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Err(Error::invalid_argument("MGET requires at least one key"));
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET");
        args.extend_from_slice(keys);
        expect_bulk_array(self.command(ctx, &args)?)
    }

    fn mset(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<()> {
        let args = flatten_pairs(b"MSET", pairs)?;
        expect_ok(self.command(ctx, &args)?)
    }

    fn msetnx(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<bool> {
        let args = flatten_pairs(b"MSETNX", pairs)?;
        Ok(expect_int(self.command(ctx, &args)?)? != 0)
    }

    fn setnx(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<bool> {
        Ok(expect_int(self.command(ctx, &[b"SETNX", key, value])?)? != 0)
    }

    fn setex(&self, ctx: &RequestContext, key: &[u8], seconds: u64, value: &[u8]) -> Result<()> {
        let seconds = seconds.to_string();
        expect_ok(self.command(ctx, &[b"SETEX", key, seconds.as_bytes(), value])?)
    }

    fn incr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        expect_int(self.command(ctx, &[b"INCR", key])?)
    }

    fn incr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        let delta = delta.to_string();
        expect_int(self.command(ctx, &[b"INCRBY", key, delta.as_bytes()])?)
    }

    fn decr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        expect_int(self.command(ctx, &[b"DECR", key])?)
    }

    fn decr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        let delta = delta.to_string();
        expect_int(self.command(ctx, &[b"DECRBY", key, delta.as_bytes()])?)
    }

    fn append(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<u64> {
        expect_len(self.command(ctx, &[b"APPEND", key, value])?)
    }

    fn substr(&self, ctx: &RequestContext, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        let start = start.to_string();
        let end = end.to_string();
        let value = self.command(ctx, &[b"SUBSTR", key, start.as_bytes(), end.as_bytes()])?;
        Ok(expect_bulk(value)?.unwrap_or_default())
    }

    fn strlen(&self, ctx: &RequestContext, key: &[u8]) -> Result<u64> {
        expect_len(self.command(ctx, &[b"STRLEN", key])?)
    }

    fn ttl(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        expect_int(self.command(ctx, &[b"TTL", key])?)
    }

    fn del(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL");
        args.extend_from_slice(keys);
        expect_len(self.command(ctx, &args)?)
    }

    fn exists(&self, ctx: &RequestContext, key: &[u8]) -> Result<bool> {
        Ok(expect_int(self.command(ctx, &[b"EXISTS", key])?)? > 0)
    }

    fn flush_db(&self, ctx: &RequestContext) -> Result<()> {
        expect_ok(self.command(ctx, &[b"FLUSHDB"])?)
    }
}
