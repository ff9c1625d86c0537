use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use framecast_common::cancel::CancelSignal;
use framecast_common::error::FramecastError;
use framecast_pool::{PoolConfig, SessionPool, SessionState};
use framecast_session::testing::{Script, ScriptedEngine};
use framecast_session::{MovieInfo, SessionOptions};

fn movie() -> MovieInfo {
    MovieInfo {
        width: 64,
        height: 36,
        fps: 30.0,
        frame_count: 64,
    }
}

fn build_pool(script: Script, max: usize) -> (ScriptedEngine, SessionPool) {
    let engine = ScriptedEngine::new(script);
    let pool = SessionPool::new(
        Arc::new(engine.clone()),
        PoolConfig {
            url: "http://localhost/movie".to_string(),
            max,
            session: SessionOptions::default(),
        },
    )
    .unwrap();
    (engine, pool)
}

async fn render_all(pool: &SessionPool, frames: u64) -> Vec<Result<u64, FramecastError>> {
    let mut handles = Vec::new();
    for index in 0..frames {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.submit("render", move |session| async move {
                session.render_frame(index).await.map(|f| f.index)
            })
            .await
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn busy_sessions_never_exceed_max(max in 1usize..5, tasks in 1u64..24) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (engine, pool) = build_pool(
            Script::new(movie()).with_default_latency(Duration::from_millis(2)),
            max,
        );

        let results = runtime.block_on(render_all(&pool, tasks));

        prop_assert!(results.iter().all(|r| r.is_ok()));
        let stats = pool.stats();
        prop_assert!(stats.peak_busy <= max);
        prop_assert!(engine.counters().peak_renders() <= max);
        prop_assert!(stats.spawned as usize <= max);
        prop_assert_eq!(stats.busy, 0);
        runtime.block_on(pool.shutdown());
    }
}

#[tokio::test]
async fn sessions_grow_only_with_demand() {
    let (engine, pool) = build_pool(
        Script::new(movie()).with_default_latency(Duration::from_millis(10)),
        4,
    );

    for round in 0..5u64 {
        let (a, b) = tokio::join!(
            pool.submit("a", move |s| async move { s.render_frame(round * 2).await }),
            pool.submit("b", move |s| async move { s.render_frame(round * 2 + 1).await }),
        );
        a.unwrap();
        b.unwrap();
    }

    assert_eq!(engine.counters().launches(), 2);
    assert_eq!(pool.stats().spawned, 2);
    assert_eq!(pool.stats().peak_busy, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn failed_session_is_never_handed_out_again() {
    let (engine, pool) = build_pool(Script::new(movie()).failing_on(2), 1);

    let first_id = pool
        .submit("ok", |s| async move { s.render_frame(0).await.map(|_| s.id()) })
        .await
        .unwrap();

    let err = pool
        .submit("fails", |s| async move { s.render_frame(2).await })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scripted failure on frame 2"));

    let stats = pool.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.live, 0);
    assert_eq!(engine.counters().closes(), 1);

    let lease = pool.obtain().await.unwrap().expect("pool refills after discard");
    assert_ne!(lease.id(), first_id);
    assert!(!lease.session().is_closed());
    lease.release();
    assert_eq!(engine.counters().launches(), 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_busy_and_available_sessions() {
    let (engine, pool) = build_pool(
        Script::new(movie()).with_latencies(vec![
            Duration::ZERO,
            Duration::from_millis(300),
            Duration::from_millis(300),
        ]),
        3,
    );

    // one idle session
    pool.submit("warm", |s| async move { s.render_frame(0).await })
        .await
        .unwrap();

    let slow: Vec<_> = (1..=2u64)
        .map(|index| {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.submit("slow", move |s| async move { s.render_frame(index).await })
                    .await
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(2), async {
        while pool.stats().busy < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both slow tasks should become busy");

    let spawned = pool.stats().spawned;
    assert_eq!(
        pool.records()
            .iter()
            .filter(|r| r.state == SessionState::Busy)
            .count(),
        2
    );

    pool.shutdown().await;
    pool.shutdown().await;
    assert_eq!(engine.counters().closes() as u64, spawned);
    assert!(pool.records().is_empty());

    for handle in slow {
        let _ = handle.await.unwrap();
    }
    let err = pool
        .submit("late", |s| async move { s.render_frame(0).await })
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::PoolClosed));
}

#[tokio::test]
async fn cancelled_waiters_are_not_dispatched() {
    let (engine, pool) = build_pool(
        Script::new(movie()).with_default_latency(Duration::from_millis(100)),
        1,
    );
    let cancel = CancelSignal::new();

    let running = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pool.submit_cancellable("running", &cancel, |s| async move {
                s.render_frame(0).await
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waiting = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pool.submit_cancellable("waiting", &cancel, |s| async move {
                s.render_frame(1).await
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let waiting = waiting.await.unwrap();
    assert!(matches!(waiting, Err(FramecastError::Cancelled)));

    // the task that was already running finishes normally
    assert_eq!(running.await.unwrap().unwrap().index, 0);
    assert_eq!(engine.counters().finished_frames(), vec![0]);
    assert_eq!(pool.stats().discarded, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn launch_failures_do_not_leak_slots() {
    let (_engine, pool) = build_pool(Script::new(movie()).failing_launch(), 1);

    for _ in 0..3 {
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            pool.submit("x", |s| async move { s.render_frame(0).await }),
        )
        .await
        .expect("slot must be released after a failed launch")
        .unwrap_err();
        assert!(matches!(err, FramecastError::Launch { .. }));
    }
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn failed_open_cancels_queued_work() {
    let (engine, pool) = build_pool(
        Script::new(movie())
            .with_default_latency(Duration::from_millis(100))
            .failing_launch_after(1),
        2,
    );
    let cancel = CancelSignal::new();

    let submit = |index: u64| {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pool.submit_cancellable("render", &cancel, move |s| async move {
                s.render_frame(index).await
            })
            .await
        })
    };

    let running = submit(0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let failing = submit(1);
    let queued = submit(2);

    let failing = failing.await.unwrap();
    assert!(matches!(failing, Err(FramecastError::Launch { .. })));
    assert!(cancel.is_cancelled());
    assert!(matches!(queued.await.unwrap(), Err(FramecastError::Cancelled)));

    assert_eq!(running.await.unwrap().unwrap().index, 0);
    assert_eq!(engine.counters().launches(), 1);
    assert_eq!(engine.counters().finished_frames(), vec![0]);
    pool.shutdown().await;
}
