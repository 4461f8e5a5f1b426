//! Exactly-once resolution of completions under concurrency

mod harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use futures::future::join_all;
use harness::{init_test_tracing, PeerPair};
use rand::Rng;
use remotemedia_rtc_bridge::{
    BridgeConfig, Completion, OfferAnswerOptions, RtcError, RtcErrorKind, RtcRuntime,
};

const COMPLETIONS: usize = 10_000;
const THREADS: usize = 8;

#[derive(Default)]
struct Tally {
    ok: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
}

#[test]
fn test_randomized_completions_fire_exactly_once() {
    init_test_tracing();
    let tally = Arc::new(Tally::default());
    let fired: Arc<Vec<AtomicUsize>> =
        Arc::new((0..COMPLETIONS).map(|_| AtomicUsize::new(0)).collect());

    let (tx, rx) = crossbeam::channel::unbounded::<(usize, Completion<usize>)>();
    for index in 0..COMPLETIONS {
        let (tally, fired) = (tally.clone(), fired.clone());
        let completion = Completion::new("stress", move |result: Result<usize, RtcError>| {
            fired[index].fetch_add(1, Ordering::SeqCst);
            match result {
                Ok(value) => {
                    assert_eq!(value, index);
                    tally.ok.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) if err.kind() == RtcErrorKind::InternalError => {
                    assert!(err.message().contains("abandoned"));
                    tally.abandoned.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    assert_eq!(err.kind(), RtcErrorKind::OperationErrorWithData);
                    tally.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        tx.send((index, completion)).unwrap();
    }
    drop(tx);

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let rx = rx.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for (index, completion) in rx.iter() {
                    match rng.gen_range(0..3) {
                        0 => completion.succeed(index),
                        1 => completion.fail(RtcError::new(RtcErrorKind::OperationErrorWithData, "boom")),
                        _ => drop(completion),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(fired.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    let total = tally.ok.load(Ordering::SeqCst)
        + tally.failed.load(Ordering::SeqCst)
        + tally.abandoned.load(Ordering::SeqCst);
    assert_eq!(total, COMPLETIONS);
}

#[tokio::test]
async fn test_mapped_completion_keeps_single_callback() {
    init_test_tracing();
    let (completion, rx) = Completion::<String>::channel("mapped");
    let mapped: Completion<u32> = completion.map(|n| format!("value {n}"));

    mapped.succeed(42);
    assert_eq!(rx.await.unwrap().unwrap(), "value 42");

    let (completion, rx) = Completion::<String>::channel("mapped-drop");
    drop(completion.map(|n: u32| n.to_string()));
    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), RtcErrorKind::InternalError);
}

#[tokio::test]
async fn test_posted_completions_resolve_on_engine_threads() {
    init_test_tracing();
    let runtime = RtcRuntime::start(&BridgeConfig::default()).unwrap();
    let mut receivers = Vec::new();

    for i in 0..300u32 {
        let (completion, rx) = Completion::channel("posted");
        let thread = match i % 3 {
            0 => runtime.network(),
            1 => runtime.worker(),
            _ => runtime.signaling(),
        };
        thread.post(move || completion.succeed(i));
        receivers.push(rx);
    }

    let results = join_all(receivers).await;
    let values: Vec<u32> = results
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();
    assert_eq!(values, (0..300).collect::<Vec<_>>());
    runtime.shutdown();
}

#[tokio::test]
async fn test_shutdown_abandons_queued_operations() {
    init_test_tracing();
    let pair = PeerPair::new().unwrap();
    pair.runtime.shutdown();

    let err = pair
        .offerer
        .offer(&OfferAnswerOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RtcErrorKind::InternalError);
}
