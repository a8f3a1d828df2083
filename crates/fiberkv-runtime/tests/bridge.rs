use fiberkv::{Error, RequestContext};
use fiberkv_runtime::{BridgeConfig, BridgeError, SuspensionBridge, run_blocking};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn bridge(workers: usize) -> SuspensionBridge {
    SuspensionBridge::new(BridgeConfig {
        workers,
        max_pending: 64,
        call_timeout_ms: None,
    })
    .expect("bridge should start")
}

#[tokio::test(flavor = "current_thread")]
async fn blocking_work_runs_on_a_worker_thread() {
    let bridge = bridge(2);
    let name = bridge
        .run(|| Ok::<_, Error>(thread::current().name().map(str::to_string)))
        .await
        .expect("call should succeed");
    assert!(name.unwrap_or_default().starts_with("fiberkv-worker-"));
}

#[tokio::test(flavor = "current_thread")]
async fn call_errors_keep_their_kind() {
    let err = bridge(1)
        .run(|| {
            Err::<(), _>(Error::server(
                "ERR",
                "value is not an integer or out of range",
            ))
        })
        .await
        .expect_err("call should fail");
    assert!(err.is_data_error());
    assert!(!err.is_timeout());
    match err.into_call_error() {
        Some(Error::Server(server)) => {
            assert_eq!(server.code, "ERR");
            assert_eq!(server.detail, "value is not an integer or out of range");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn panicking_call_is_reported_and_the_pool_survives() {
    let bridge = bridge(1);
    let err = bridge
        .run(|| -> Result<(), Error> { panic!("worker exploded") })
        .await
        .expect_err("panic should surface as an error");
    assert!(matches!(err, BridgeError::Panicked(ref message) if message.contains("worker exploded")));

    let value = bridge
        .run(|| Ok::<_, Error>(7))
        .await
        .expect("worker should still accept calls");
    assert_eq!(value, 7);
}

#[tokio::test(flavor = "current_thread")]
async fn call_timeout_interrupts_context_aware_work() {
    let bridge = SuspensionBridge::new(BridgeConfig {
        workers: 1,
        max_pending: 4,
        call_timeout_ms: Some(200),
    })
    .expect("bridge should start");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let err = bridge
        .call(move |ctx: &RequestContext| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            flag.store(true, Ordering::SeqCst);
            Err::<(), _>(Error::Cancelled)
        })
        .await
        .expect_err("call should time out");
    assert!(matches!(err, BridgeError::Timeout(limit) if limit == Duration::from_millis(200)));
    assert!(err.is_timeout());

    // The single worker is free again once the interrupted call returns.
    let value = bridge
        .run(|| Ok::<_, Error>("next"))
        .await
        .expect("next call should succeed");
    assert_eq!(value, "next");
    assert!(interrupted.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "current_thread")]
async fn aborting_a_suspended_caller_cancels_the_call() {
    let bridge = bridge(1);
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let interrupted = Arc::new(AtomicBool::new(false));

    let task = {
        let bridge = bridge.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            bridge
                .call(move |ctx| {
                    let _ = started_tx.send(());
                    while !ctx.is_cancelled() {
                        thread::sleep(Duration::from_millis(2));
                    }
                    interrupted.store(true, Ordering::SeqCst);
                    Ok::<_, Error>(())
                })
                .await
        })
    };

    started_rx.await.expect("call should start");
    task.abort();
    assert!(task.await.expect_err("task was aborted").is_cancelled());

    let value = bridge
        .run(|| Ok::<_, Error>(42))
        .await
        .expect("pool should still serve calls");
    assert_eq!(value, 42);
    assert!(interrupted.load(Ordering::SeqCst));
    assert_eq!(bridge.in_flight(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn abandoned_opaque_call_runs_to_completion() {
    let bridge = bridge(1);
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        bridge.run(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Error>("discarded")
        }),
    )
    .await;
    assert!(outcome.is_err());

    bridge
        .run(|| Ok::<_, Error>(()))
        .await
        .expect("follow-up call should succeed");
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "current_thread")]
async fn call_timeout_bounds_waiting_for_admission() {
    let bridge = SuspensionBridge::new(BridgeConfig {
        workers: 2,
        max_pending: 1,
        call_timeout_ms: Some(100),
    })
    .expect("bridge should start");

    // An opaque op ignores its context, so it keeps the only slot after its
    // caller times out.
    let err = bridge
        .run(|| {
            thread::sleep(Duration::from_millis(1500));
            Ok::<_, Error>(())
        })
        .await
        .expect_err("slow call should time out");
    assert!(err.is_timeout());
    assert_eq!(bridge.in_flight(), 1);

    let started = Instant::now();
    let err = bridge
        .run(|| Ok::<_, Error>(()))
        .await
        .expect_err("no slot frees up before the deadline");
    assert!(matches!(err, BridgeError::Timeout(limit) if limit == Duration::from_millis(100)));
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "waited {:?}",
        started.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_each_receive_their_own_result() {
    let bridge = bridge(4);
    let calls = (0..64_u64).map(|i| {
        let bridge = bridge.clone();
        async move {
            bridge
                .run(move || {
                    thread::sleep(Duration::from_millis(i % 5));
                    Ok::<_, Error>(i * i)
                })
                .await
        }
    });
    let results = futures::future::join_all(calls).await;
    assert_eq!(results.len(), 64);
    for (i, result) in results.into_iter().enumerate() {
        let i = i as u64;
        assert_eq!(result.expect("call should succeed"), i * i);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_is_bounded_by_max_pending() {
    let bridge = SuspensionBridge::new(BridgeConfig {
        workers: 2,
        max_pending: 2,
        call_timeout_ms: None,
    })
    .expect("bridge should start");
    let peak = Arc::new(AtomicUsize::new(0));

    let calls = (0..12).map(|_| {
        let bridge = bridge.clone();
        let observer = bridge.clone();
        let peak = peak.clone();
        async move {
            bridge
                .run(move || {
                    peak.fetch_max(observer.in_flight(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    Ok::<_, Error>(())
                })
                .await
        }
    });
    for result in futures::future::join_all(calls).await {
        result.expect("call should succeed");
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "current_thread")]
async fn calls_after_shutdown_are_refused() {
    let bridge = bridge(1);
    bridge.shutdown();
    assert!(bridge.is_shut_down());
    let err = bridge
        .run(|| Ok::<_, Error>(()))
        .await
        .expect_err("call should be refused");
    assert!(matches!(err, BridgeError::Closed));
}

#[tokio::test(flavor = "current_thread")]
async fn run_blocking_uses_the_default_bridge() {
    let value = run_blocking(|| Ok::<_, Error>(5)).await.expect("call");
    assert_eq!(value, 5);
}
