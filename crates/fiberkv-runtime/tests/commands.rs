use fiberkv::testing::MemoryServer;
use fiberkv::{Error, SetOptions, with_request_timeout};
use fiberkv_runtime::{BridgeConfig, FiberClient, KvStore, SuspensionBridge};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FOO: &[u8] = b"foo";
const BAR: &[u8] = b"bar";

fn bridge() -> SuspensionBridge {
    SuspensionBridge::new(BridgeConfig {
        workers: 4,
        max_pending: 64,
        call_timeout_ms: None,
    })
    .expect("bridge should start")
}

async fn exercise_string_commands(store: &dyn KvStore) {
    store.flush_db().await.expect("flush");

    let big = vec![b'A'; 1000];
    store.set(FOO, &big).await.expect("set");
    assert_eq!(store.get(FOO).await.expect("get"), Some(big.clone()));
    assert_eq!(store.strlen(FOO).await.expect("strlen"), 1000);

    assert!(!store.setnx(FOO, BAR).await.expect("setnx"));
    assert!(store.setnx(BAR, FOO).await.expect("setnx"));
    assert!(!store
        .set_with(FOO, BAR, SetOptions::nx())
        .await
        .expect("set nx"));
    assert!(store
        .set_with(FOO, BAR, SetOptions::xx())
        .await
        .expect("set xx"));
    assert_eq!(
        store.getset(FOO, b"next").await.expect("getset"),
        Some(BAR.to_vec())
    );

    assert_eq!(
        store
            .mget(&[FOO, b"missing".as_slice(), BAR])
            .await
            .expect("mget"),
        vec![Some(b"next".to_vec()), None, Some(FOO.to_vec())]
    );
    store
        .mset(&[(b"k1".as_slice(), b"v1".as_slice()), (b"k2".as_slice(), b"v2".as_slice())])
        .await
        .expect("mset");
    assert!(!store
        .msetnx(&[(b"k1".as_slice(), b"x".as_slice()), (b"k3".as_slice(), b"x".as_slice())])
        .await
        .expect("msetnx"));
    assert!(!store.exists(b"k3").await.expect("exists"));

    assert_eq!(store.incr(b"counter").await.expect("incr"), 1);
    assert_eq!(store.incr_by(b"counter", 10).await.expect("incrby"), 11);
    assert_eq!(store.decr(b"counter").await.expect("decr"), 10);
    assert_eq!(store.decr_by(b"counter", 4).await.expect("decrby"), 6);

    let err = store.incr(FOO).await.expect_err("incr on text should fail");
    assert!(err.is_data_error());
    assert!(matches!(err.into_call_error(), Some(Error::Server(_))));
    // The failed command leaves the backend usable.
    store.ping().await.expect("ping after data error");

    assert_eq!(store.append(b"log", b"hello").await.expect("append"), 5);
    assert_eq!(store.append(b"log", b" world").await.expect("append"), 11);
    assert_eq!(
        store.substr(b"log", 0, 4).await.expect("substr"),
        b"hello".to_vec()
    );
    assert_eq!(
        store.substr(b"log", -5, -1).await.expect("substr"),
        b"world".to_vec()
    );

    store.setex(b"temp", 100, BAR).await.expect("setex");
    let ttl = store.ttl(b"temp").await.expect("ttl");
    assert!((99..=100).contains(&ttl), "ttl was {ttl}");
    assert_eq!(store.ttl(b"log").await.expect("ttl"), -1);
    assert_eq!(store.ttl(b"missing").await.expect("ttl"), -2);

    assert_eq!(
        store
            .del(&[b"temp".as_slice(), b"missing".as_slice()])
            .await
            .expect("del"),
        1
    );
}

#[tokio::test(flavor = "current_thread")]
async fn string_commands_against_memory_store() {
    let client = FiberClient::in_memory(bridge());
    exercise_string_commands(&client).await;
    assert!(!client.inner().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn string_commands_against_loopback_server() {
    let server = MemoryServer::start().expect("server should start");
    let client = FiberClient::connect(bridge(), server.addr_string(), Vec::new())
        .await
        .expect("connect should succeed");
    exercise_string_commands(&client).await;
    assert_eq!(client.inner().addr(), server.addr_string());
    assert!(!server.store().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tasks_sharing_one_connection_never_see_each_others_replies() {
    let server = MemoryServer::start().expect("server should start");
    let client = Arc::new(
        FiberClient::connect(bridge(), server.addr_string(), Vec::new())
            .await
            .expect("connect should succeed"),
    );

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let key = format!("key-{i}").into_bytes();
                let value = format!("value-{i}").repeat(i + 1).into_bytes();
                client.set(&key, &value).await?;
                let read = client.get(&key).await?;
                Ok::<_, fiberkv_runtime::KvError>((value, read))
            })
        })
        .collect();

    for task in tasks {
        let (written, read) = task
            .await
            .expect("task should not panic")
            .expect("commands should succeed");
        assert_eq!(read, Some(written));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn call_timeout_interrupts_a_hung_server() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind should succeed");
    let addr = listener.local_addr().expect("local addr").to_string();
    let _silent = thread::spawn(move || {
        let held: Vec<_> = listener.incoming().take(1).filter_map(Result::ok).collect();
        thread::sleep(Duration::from_secs(2));
        drop(held);
    });

    let bridge = SuspensionBridge::new(BridgeConfig {
        workers: 1,
        max_pending: 4,
        call_timeout_ms: Some(150),
    })
    .expect("bridge should start");
    let client = FiberClient::connect(
        bridge,
        addr,
        vec![with_request_timeout(Duration::from_secs(10))],
    )
    .await
    .expect("connect should succeed");

    let started = Instant::now();
    let err = client.get(FOO).await.expect_err("hung call should time out");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));

    // The worker drops the stalled connection once the context is cancelled,
    // so the next call on the single worker starts promptly on a fresh dial.
    let err = client
        .ping()
        .await
        .expect_err("silent server never replies");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
}
