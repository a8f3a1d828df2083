#![doc = r#"
Async access to the blocking `fiberkv` client through a suspension bridge.

A caller awaiting a bridged call is parked on a one-shot channel while a
dedicated worker thread runs the blocking command; executor threads never
block on socket I/O.

Command mapping:

| Async method | Blocking call | Wire command |
| --- | --- | --- |
| `KvStore::ping` | `KeyValueCommands::ping` | `PING` |
| `KvStore::set` | `KeyValueCommands::set` | `SET key value` |
| `KvStore::set_with` | `KeyValueCommands::set_with` | `SET key value [NX\|XX] [EX s\|PX ms]` |
| `KvStore::get` | `KeyValueCommands::get` | `GET` |
| `KvStore::getset` | `KeyValueCommands::getset` | `GETSET` |
| `KvStore::mget` | `KeyValueCommands::mget` | `MGET` |
| `KvStore::mset` / `msetnx` | `KeyValueCommands::mset` / `msetnx` | `MSET` / `MSETNX` |
| `KvStore::setnx` / `setex` | `KeyValueCommands::setnx` / `setex` | `SETNX` / `SETEX` |
| `KvStore::incr` / `incr_by` | `KeyValueCommands::incr` / `incr_by` | `INCR` / `INCRBY` |
| `KvStore::decr` / `decr_by` | `KeyValueCommands::decr` / `decr_by` | `DECR` / `DECRBY` |
| `KvStore::append` | `KeyValueCommands::append` | `APPEND` |
| `KvStore::substr` | `KeyValueCommands::substr` | `SUBSTR` |
| `KvStore::strlen` | `KeyValueCommands::strlen` | `STRLEN` |
| `KvStore::ttl` | `KeyValueCommands::ttl` | `TTL` |
| `KvStore::del` / `exists` | `KeyValueCommands::del` / `exists` | `DEL` / `EXISTS` |
| `KvStore::flush_db` | `KeyValueCommands::flush_db` | `FLUSHDB` |

Implementation notes:
- Errors from the blocking call come back as `BridgeError::Call` with their original kind.
- A caller that is dropped or times out cancels the call's `RequestContext`; the TCP client
  notices within one poll interval and drops its connection. Context-blind work runs to
  completion and its result is discarded.
- A worker slot stays occupied until the blocking call returns, abandoned or not.
"#]

pub mod bridge;
pub mod client;
pub mod pool;

pub use bridge::{
    BridgeConfig, BridgeError, DEFAULT_MAX_PENDING, SuspensionBridge, default_bridge,
    run_blocking,
};
pub use client::{FiberClient, KvError, KvResult, KvStore};
pub use pool::{PoolError, WorkerPool};
