// SPDX-License-Identifier: Apache-2.0

//! In-process backend with the server's string-command semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::commands::{Existence, KeyValueCommands, SetOptions};
use crate::context::RequestContext;
use crate::error::{Error, Result};

const NOT_AN_INTEGER: &str = "value is not an integer or out of range";
const OVERFLOW: &str = "increment or decrement would overflow";

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<Vec<u8>, Entry>>>,
}

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn persistent(value: Vec<u8>) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|entry| entry.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self, ctx: &RequestContext) -> Result<MutexGuard<'_, HashMap<Vec<u8>, Entry>>> {
        ctx.check()?;
        // Commands validate before mutating, so a map left behind by a
        // panicking holder is still consistent.
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        map.retain(|_, entry| entry.is_live(now));
        Ok(map)
    }

    fn add(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        let mut map = self.state(ctx)?;
        let current = match map.get(key) {
            Some(entry) => parse_integer(&entry.value)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::server("ERR", OVERFLOW))?;
        let encoded = next.to_string().into_bytes();
        match map.get_mut(key) {
            Some(entry) => entry.value = encoded,
            None => {
                map.insert(key.to_vec(), Entry::persistent(encoded));
            }
        }
        Ok(next)
    }
}

/// Accepts only the canonical decimal form, so `007`, `-0` and `+1` are
/// rejected like the server rejects them.
fn parse_integer(value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok().filter(|n| n.to_string() == s))
        .ok_or_else(|| Error::server("ERR", NOT_AN_INTEGER))
}

fn expiry_from_now(after: Duration, command: &str) -> Result<Instant> {
    Instant::now()
        .checked_add(after)
        .ok_or_else(|| Error::server("ERR", format!("invalid expire time in '{command}' command")))
}

/// Resolves an inclusive `[start, end]` range against `len`, clamping the way
/// the server does. Returns `None` for an empty result.
fn clamp_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut end = if end < 0 { len + end } else { end };
    if start < 0 {
        start = 0;
    }
    if end < 0 {
        end = 0;
    }
    if end >= len {
        end = len - 1;
    }
    if start > end {
        return None;
    }
    Some((start as usize, end as usize))
}

impl KeyValueCommands for MemoryStore {
    fn ping(&self, ctx: &RequestContext) -> Result<()> {
        ctx.check()
    }

    fn set(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self.state(ctx)?;
        map.insert(key.to_vec(), Entry::persistent(value.to_vec()));
        Ok(())
    }

    fn set_with(
        &self,
        ctx: &RequestContext,
        key: &[u8],
        value: &[u8],
        options: SetOptions,
    ) -> Result<bool> {
        let mut map = self.state(ctx)?;
        let exists = map.contains_key(key);
        match options.existence {
            Some(Existence::Nx) if exists => return Ok(false),
            Some(Existence::Xx) if !exists => return Ok(false),
            _ => {}
        }
        let expires_at = match options.expiry {
            Some(expiry) if expiry.as_millis() == 0 => {
                return Err(Error::server("ERR", "invalid expire time in 'set' command"))
            }
            Some(expiry) => Some(expiry_from_now(
                Duration::from_millis(expiry.as_millis()),
                "set",
            )?),
            None => None,
        };
        map.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn get(&self, ctx: &RequestContext, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.state(ctx)?;
        Ok(map.get(key).map(|entry| entry.value.clone()))
    }

    fn getset(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut map = self.state(ctx)?;
        let previous = map.insert(key.to_vec(), Entry::persistent(value.to_vec()));
        Ok(previous.map(|entry| entry.value))
    }

    fn mget(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let map = self.state(ctx)?;
        Ok(keys
            .iter()
            .map(|key| map.get(*key).map(|entry| entry.value.clone()))
            .collect())
    }

    fn mset(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<()> {
        if pairs.is_empty() {
            return Err(Error::invalid_argument("at least one key/value pair is required"));
        }
        let mut map = self.state(ctx)?;
        for (key, value) in pairs {
            map.insert(key.to_vec(), Entry::persistent(value.to_vec()));
        }
        Ok(())
    }

    fn msetnx(&self, ctx: &RequestContext, pairs: &[(&[u8], &[u8])]) -> Result<bool> {
        if pairs.is_empty() {
            return Err(Error::invalid_argument("at least one key/value pair is required"));
        }
        let mut map = self.state(ctx)?;
        if pairs.iter().any(|(key, _)| map.contains_key(*key)) {
            return Ok(false);
        }
        for (key, value) in pairs {
            map.insert(key.to_vec(), Entry::persistent(value.to_vec()));
        }
        Ok(true)
    }

    fn setnx(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut map = self.state(ctx)?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_vec(), Entry::persistent(value.to_vec()));
        Ok(true)
    }

    fn setex(&self, ctx: &RequestContext, key: &[u8], seconds: u64, value: &[u8]) -> Result<()> {
        if seconds == 0 {
            return Err(Error::server("ERR", "invalid expire time in 'setex' command"));
        }
        let expires_at = expiry_from_now(Duration::from_secs(seconds), "setex")?;
        let mut map = self.state(ctx)?;
        map.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    fn incr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        self.add(ctx, key, delta)
    }

    fn decr_by(&self, ctx: &RequestContext, key: &[u8], delta: i64) -> Result<i64> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| Error::server("ERR", OVERFLOW))?;
        self.add(ctx, key, delta)
    }

    fn append(&self, ctx: &RequestContext, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut map = self.state(ctx)?;
        let entry = map
            .entry(key.to_vec())
            .or_insert_with(|| Entry::persistent(Vec::new()));
        entry.value.extend_from_slice(value);
        Ok(entry.value.len() as u64)
    }

    fn substr(&self, ctx: &RequestContext, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        let map = self.state(ctx)?;
        let Some(entry) = map.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match clamp_range(entry.value.len(), start, end) {
            Some((from, to)) => entry.value[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    fn strlen(&self, ctx: &RequestContext, key: &[u8]) -> Result<u64> {
        let map = self.state(ctx)?;
        Ok(map.get(key).map(|entry| entry.value.len() as u64).unwrap_or(0))
    }

    fn ttl(&self, ctx: &RequestContext, key: &[u8]) -> Result<i64> {
        let map = self.state(ctx)?;
        let Some(entry) = map.get(key) else {
            return Ok(-2);
        };
        let Some(expires_at) = entry.expires_at else {
            return Ok(-1);
        };
        let left = expires_at.saturating_duration_since(Instant::now());
        // Rounded to the nearest second, as the server reports it.
        Ok(((left.as_millis() + 500) / 1000) as i64)
    }

    fn del(&self, ctx: &RequestContext, keys: &[&[u8]]) -> Result<u64> {
        let mut map = self.state(ctx)?;
        Ok(keys.iter().filter(|key| map.remove(**key).is_some()).count() as u64)
    }

    fn exists(&self, ctx: &RequestContext, key: &[u8]) -> Result<bool> {
        let map = self.state(ctx)?;
        Ok(map.contains_key(key))
    }

    fn flush_db(&self, ctx: &RequestContext) -> Result<()> {
        let mut map = self.state(ctx)?;
        map.clear();
        Ok(())
    }
}
