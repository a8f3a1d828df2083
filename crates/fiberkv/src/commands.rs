// SPDX-License-Identifier: Apache-2.0

//! The blocking string-command surface shared by the TCP client and the
//! in-memory backend.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::Result;

/// Existence condition for an extended `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    /// Only set the key if it does not already exist.
    Nx,
    /// Only set the key if it already exists.
    Xx,
}

/// Expiry attached by an extended `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Seconds(u64),
    Millis(u64),
}

impl Expiry {
    pub fn as_millis(&self) -> u64 {
        match *self {
            Expiry::Seconds(secs) => secs.saturating_mul(1000),
            Expiry::Millis(millis) => millis,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub existence: Option<Existence>,
    pub expiry: Option<Expiry>,
}

impl SetOptions {
    pub fn nx() -> Self {
        Self {
            existence: Some(Existence::Nx),
            expiry: None,
        }
    }

    pub fn xx() -> Self {
        Self {
            existence: Some(Existence::Xx),
            expiry: None,
        }
    }

    pub fn expire_seconds(mut self, secs: u64) -> Self {
        self.expiry = Some(Expiry::Seconds(secs));
        self
    }

    pub fn expire_millis(mut self, millis: u64) -> Self {
        self.expiry = Some(Expiry::Millis(millis));
        self
    }
}

/// Blocking key-value commands. Every call may block the current thread on
/// network I/O; use the runtime bridge to call these from async code.
pub trait KeyValueCommands: Send + Sync {
    fn ping(&self, ctx: &RequestContext) -> Result<()>;

    fn set(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<()>;

    /// Returns `false` when the existence condition prevented the write.
    fn set_with(
        &self,
        ctx: &RequestContext,
        key: &[u8],
        value: &[u8],
        options: SetOptions,
    ) -> Result<bool>;

    fn get(&self, ctx: &RequestContext, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn getset(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>>;

    fn mget(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>>;

    fn mset(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<()>;

    /// Writes every pair or none of them; `false` if any key already existed.
    fn msetnx(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<bool>;

    fn setnx(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<bool>;

    fn setex(&self, ctx: &RequestContext, key: &[u8], seconds: u64, value: &[u8]) -> Result<()>;

    fn incr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        self.incr_by(ctx, key, 1)
    }

    fn incr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64>;

    fn decr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        self.decr_by(ctx, key, 1)
    }

    fn decr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64>;

    /// Returns the length of the value after the append.
    fn append(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<u64>;

    /// Inclusive byte range; negative offsets count from the end.
    fn substr(&self, ctx: &RequestContext, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>>;

    fn strlen(&self, ctx: &RequestContext, key: &[u8]) -> Result<u64>;

    /// Remaining time to live in seconds, `-2` for a missing key and `-1` for
    /// a key without expiry.
    fn ttl(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64>;

    fn del(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<u64>;

    fn exists(&self, ctx: &RequestContext, key: &[u8]) -> Result<bool>;

    fn flush_db(&self, ctx: &RequestContext) -> Result<()>;
}

impl<T> KeyValueCommands for Arc<T>
where
    T: KeyValueCommands + ?Sized,
{
    fn ping(&self, ctx: &RequestContext) -> Result<()> {
        (**self).ping(ctx)
    }

    fn set(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(ctx, key, value)
    }

    fn set_with(
        &self,
        ctx: &RequestContext,
        key: &[u8],
        value: &[u8],
        options: SetOptions,
    ) -> Result<bool> {
        (**self).set_with(ctx, key, value, options)
    }

    fn get(&self, ctx: &RequestContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(ctx, key)
    }

    fn getset(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).getset(ctx, key, value)
    }

    fn mget(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        (**self).mget(ctx, keys)
    }

    fn mset(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<()> {
        (**self).mset(ctx, pairs)
    }

    fn msetnx(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<bool> {
        (**self).msetnx(ctx, pairs)
    }

    fn setnx(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<bool> {
        (**self).setnx(ctx, key, value)
    }

    fn setex(&self, ctx: &RequestContext, key: &[u8], seconds: u64, value: &[u8]) -> Result<()> {
        (**self).setex(ctx, key, seconds, value)
    }

    fn incr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        (**self).incr(ctx, key)
    }

    fn incr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        (**self).incr_by(ctx, key, delta)
    }

    fn decr(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        (**self).decr(ctx, key)
    }

    fn decr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        (**self).decr_by(ctx, key, delta)
    }

    fn append(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<u64> {
        (**self).append(ctx, key, value)
    }

    fn substr(&self, ctx: &RequestContext, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        (**self).substr(ctx, key, start, end)
    }

    fn strlen(&self, ctx: &RequestContext, key: &[u8]) -> Result<u64> {
        (**self).strlen(ctx, key)
    }

    fn ttl(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        (**self).ttl(ctx, key)
    }

    fn del(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<u64> {
        (**self).del(ctx, keys)
    }

    fn exists(&self, ctx: &RequestContext, key: &[u8]) -> Result<bool> {
        (**self).exists(ctx, key)
    }

    fn flush_db(&self, ctx: &RequestContext) -> Result<()> {
        (**self).flush_db(ctx)
    }
}
