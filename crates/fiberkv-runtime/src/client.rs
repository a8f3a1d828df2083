use crate::bridge::{BridgeError, SuspensionBridge, default_bridge};
use async_trait::async_trait;
use fiberkv::{Client, ClientOption, KeyValueCommands, MemoryStore, RequestContext, SetOptions};
use std::sync::Arc;
use tracing::debug;

pub type KvError = BridgeError<fiberkv::Error>;
pub type KvResult<T> = Result<T, KvError>;

/// Async view of the key-value command set. Each call suspends the calling
/// task until the underlying blocking command returns.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> KvResult<()>;
    async fn set(&self, key: &[u8], value: &[u8]) -> KvResult<()>;
    async fn set_with(&self, key: &[u8], value: &[u8], options: SetOptions) -> KvResult<bool>;
    async fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;
    async fn getset(&self, key: &[u8], value: &[u8]) -> KvResult<Option<Vec<u8>>>;
    async fn mget(&self, keys: &[&[u8]]) -> KvResult<Vec<Option<Vec<u8>>>>;
    async fn mset(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<()>;
    async fn msetnx(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<bool>;
    async fn setnx(&self, key: &[u8], value: &[u8]) -> KvResult<bool>;
    async fn setex(&self, key: &[u8], seconds: u64, value: &[u8]) -> KvResult<()>;
    async fn incr(&self, key: &[u8]) -> KvResult<i64>;
    async fn incr_by(&self, key: &[u8], delta: i64) -> KvResult<i64>;
    async fn decr(&self, key: &[u8]) -> KvResult<i64>;
    async fn decr_by(&self, key: &[u8], delta: i64) -> KvResult<i64>;
    async fn append(&self, key: &[u8], value: &[u8]) -> KvResult<u64>;
    async fn substr(&self, key: &[u8], start: i64, end: i64) -> KvResult<Vec<u8>>;
    async fn strlen(&self, key: &[u8]) -> KvResult<u64>;
    async fn ttl(&self, key: &[u8]) -> KvResult<i64>;
    async fn del(&self, keys: &[&[u8]]) -> KvResult<u64>;
    async fn exists(&self, key: &[u8]) -> KvResult<bool>;
    async fn flush_db(&self) -> KvResult<()>;
}

/// A blocking command backend driven through a [`SuspensionBridge`].
///
/// Arguments are copied before the call is handed to a worker, so callers
/// keep ownership of their buffers and the call outlives nothing it borrows.
pub struct FiberClient<C> {
    inner: Arc<C>,
    bridge: SuspensionBridge,
}

impl<C> Clone for FiberClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

impl<C> std::fmt::Debug for FiberClient<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberClient")
            .field("inner", &self.inner)
            .field("bridge", &self.bridge)
            .finish()
    }
}

impl<C> FiberClient<C>
where
    C: KeyValueCommands + 'static,
{
    pub fn new(inner: C, bridge: SuspensionBridge) -> Self {
        Self::from_shared(Arc::new(inner), bridge)
    }

    pub fn from_shared(inner: Arc<C>, bridge: SuspensionBridge) -> Self {
        Self { inner, bridge }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    pub fn bridge(&self) -> &SuspensionBridge {
        &self.bridge
    }

    async fn invoke<T, F>(&self, op: F) -> KvResult<T>
    where
        F: FnOnce(&C, &RequestContext) -> fiberkv::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        self.bridge.call(move |ctx| op(&inner, ctx)).await
    }
}

impl FiberClient<Client> {
    /// Dials `addr` on a bridge worker so the calling task never blocks on
    /// the connect.
    pub async fn connect(
        bridge: SuspensionBridge,
        addr: impl Into<String>,
        opts: Vec<ClientOption>,
    ) -> KvResult<Self> {
        let addr = addr.into();
        debug!(%addr, "dialing through bridge");
        let client = bridge.run(move || fiberkv::dial(&addr, opts)).await?;
        Ok(Self::new(client, bridge))
    }

    /// Uses the process-wide bridge and `FIBERKV_ADDR`.
    pub async fn connect_from_env() -> KvResult<Self> {
        let bridge = default_bridge()
            .map_err(|_| KvError::Closed)?
            .clone();
        let client = bridge.run(Client::connect_from_env).await?;
        Ok(Self::new(client, bridge))
    }
}

impl FiberClient<MemoryStore> {
    pub fn in_memory(bridge: SuspensionBridge) -> Self {
        Self::new(MemoryStore::new(), bridge)
    }
}

fn owned_keys(keys: &[&[u8]]) -> Vec<Vec<u8>> {
    keys.iter().map(|key| key.to_vec()).collect()
}

fn owned_pairs(pairs: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_vec(), value.to_vec()))
        .collect()
}

fn borrowed_keys(keys: &[Vec<u8>]) -> Vec<&[u8]> {
    keys.iter().map(Vec::as_slice).collect()
}

fn borrowed_pairs(pairs: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
    pairs
        .iter()
        .map(|(key, value)| (key.as_slice(), value.as_slice()))
        .collect()
}

#[async_trait]
impl<C> KvStore for FiberClient<C>
where
    C: KeyValueCommands + 'static,
{
    async fn ping(&self) -> KvResult<()> {
        self.invoke(|client, ctx| client.ping(ctx)).await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.set(ctx, &key, &value))
            .await
    }

    async fn set_with(&self, key: &[u8], value: &[u8], options: SetOptions) -> KvResult<bool> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.set_with(ctx, &key, &value, options))
            .await
    }

    async fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.get(ctx, &key)).await
    }

    async fn getset(&self, key: &[u8], value: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.getset(ctx, &key, &value))
            .await
    }

    async fn mget(&self, keys: &[&[u8]]) -> KvResult<Vec<Option<Vec<u8>>>> {
        let keys = owned_keys(keys);
        self.invoke(move |client, ctx| client.mget(ctx, &borrowed_keys(&keys)))
            .await
    }

    async fn mset(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<()> {
        let pairs = owned_pairs(pairs);
        self.invoke(move |client, ctx| client.mset(ctx, &borrowed_pairs(&pairs)))
            .await
    }

    async fn msetnx(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<bool> {
        let pairs = owned_pairs(pairs);
        self.invoke(move |client, ctx| client.msetnx(ctx, &borrowed_pairs(&pairs)))
            .await
    }

    async fn setnx(&self, key: &[u8], value: &[u8]) -> KvResult<bool> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.setnx(ctx, &key, &value))
            .await
    }

    async fn setex(&self, key: &[u8], seconds: u64, value: &[u8]) -> KvResult<()> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.setex(ctx, &key, seconds, &value))
            .await
    }

    async fn incr(&self, key: &[u8]) -> KvResult<i64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.incr(ctx, &key)).await
    }

    async fn incr_by(&self, key: &[u8], delta: i64) -> KvResult<i64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.incr_by(ctx, &key, delta))
            .await
    }

    async fn decr(&self, key: &[u8]) -> KvResult<i64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.decr(ctx, &key)).await
    }

    async fn decr_by(&self, key: &[u8], delta: i64) -> KvResult<i64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.decr_by(ctx, &key, delta))
            .await
    }

    async fn append(&self, key: &[u8], value: &[u8]) -> KvResult<u64> {
        let (key, value) = (key.to_vec(), value.to_vec());
        self.invoke(move |client, ctx| client.append(ctx, &key, &value))
            .await
    }

    async fn substr(&self, key: &[u8], start: i64, end: i64) -> KvResult<Vec<u8>> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.substr(ctx, &key, start, end))
            .await
    }

    async fn strlen(&self, key: &[u8]) -> KvResult<u64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.strlen(ctx, &key)).await
    }

    async fn ttl(&self, key: &[u8]) -> KvResult<i64> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.ttl(ctx, &key)).await
    }

    async fn del(&self, keys: &[&[u8]]) -> KvResult<u64> {
        let keys = owned_keys(keys);
        self.invoke(move |client, ctx| client.del(ctx, &borrowed_keys(&keys)))
            .await
    }

    async fn exists(&self, key: &[u8]) -> KvResult<bool> {
        let key = key.to_vec();
        self.invoke(move |client, ctx| client.exists(ctx, &key)).await
    }

    async fn flush_db(&self) -> KvResult<()> {
        self.invoke(|client, ctx| client.flush_db(ctx)).await
    }
}

#[async_trait]
impl<T> KvStore for Arc<T>
where
    T: KvStore + ?Sized,
{
    async fn ping(&self) -> KvResult<()> {
        (**self).ping().await
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        (**self).set(key, value).await
    }

    async fn set_with(&self, key: &[u8], value: &[u8], options: SetOptions) -> KvResult<bool> {
        (**self).set_with(key, value, options).await
    }

    async fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn getset(&self, key: &[u8], value: &[u8]) -> KvResult<Option<Vec<u8>>> {
        (**self).getset(key, value).await
    }

    async fn mget(&self, keys: &[&[u8]]) -> KvResult<Vec<Option<Vec<u8>>>> {
        (**self).mget(keys).await
    }

    async fn mset(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<()> {
        (**self).mset(pairs).await
    }

    async fn msetnx(&self, pairs: &[(&[u8], &[u8])]) -> KvResult<bool> {
        (**self).msetnx(pairs).await
    }

    async fn setnx(&self, key: &[u8], value: &[u8]) -> KvResult<bool> {
        (**self).setnx(key, value).await
    }

    async fn setex(&self, key: &[u8], seconds: u64, value: &[u8]) -> KvResult<()> {
        (**self).setex(key, seconds, value).await
    }

    async fn incr(&self, key: &[u8]) -> KvResult<i64> {
        (**self).incr(key).await
    }

    async fn incr_by(&self, key: &[u8], delta: i64) -> KvResult<i64> {
        (**self).incr_by(key, delta).await
    }

    async fn decr(&self, key: &[u8]) -> KvResult<i64> {
        (**self).decr(key).await
    }

    async fn decr_by(&self, key: &[u8], delta: i64) -> KvResult<i64> {
        (**self).decr_by(key, delta).await
    }

    async fn append(&self, key: &[u8], value: &[u8]) -> KvResult<u64> {
        (**self).append(key, value).await
    }

    async fn substr(&self, key: &[u8], start: i64, end: i64) -> KvResult<Vec<u8>> {
        (**self).substr(key, start, end).await
    }

    async fn strlen(&self, key: &[u8]) -> KvResult<u64> {
        (**self).strlen(key).await
    }

    async fn ttl(&self, key: &[u8]) -> KvResult<i64> {
        (**self).ttl(key).await
    }

    async fn del(&self, keys: &[&[u8]]) -> KvResult<u64> {
        (**self).del(keys).await
    }

    async fn exists(&self, key: &[u8]) -> KvResult<bool> {
        (**self).exists(key).await
    }

    async fn flush_db(&self) -> KvResult<()> {
        (**self).flush_db().await
    }
}
