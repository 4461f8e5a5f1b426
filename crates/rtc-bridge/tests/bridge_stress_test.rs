//! Exactly-once delivery through the handle facade under randomized load

mod harness;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use harness::{init_test_tracing, wait_blocking};
use rand::Rng;
use remotemedia_rtc_bridge::{
    Bridge, BridgeConfig, Completion, DataChannelInit, Handle, OfferAnswerOptions,
    RtcConfiguration, SdpType,
};

const CALLS: usize = 10_000;
const THREADS: usize = 8;
const PEERS: usize = 4;

struct Targets {
    peers: Vec<Handle>,
    channels: Vec<Handle>,
    descriptions: Vec<Handle>,
    /// Released before the load starts
    dead: Handle,
}

impl Targets {
    fn pick(&self, rng: &mut impl Rng, live: &[Handle]) -> Handle {
        if rng.gen_bool(0.05) {
            self.dead
        } else {
            live[rng.gen_range(0..live.len())]
        }
    }
}

fn tracked<T: 'static>(
    operation: &'static str,
    fired: &Arc<Vec<AtomicUsize>>,
    index: usize,
) -> Completion<T> {
    let fired = Arc::clone(fired);
    Completion::new(operation, move |_| {
        fired[index].fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_randomized_bridge_calls_fire_exactly_once() {
    init_test_tracing();
    let bridge = Arc::new(Bridge::loopback(BridgeConfig::default()).unwrap());

    let peers: Vec<Handle> = (0..PEERS)
        .map(|_| {
            bridge
                .create_peer_connection(&RtcConfiguration::default(), None)
                .unwrap()
        })
        .collect();
    let channels: Vec<Handle> = peers
        .iter()
        .map(|&pc| {
            bridge
                .create_data_channel(pc, "load", &DataChannelInit::default())
                .unwrap()
        })
        .collect();

    let (done, offer) = Completion::channel("seed_offer");
    bridge.create_offer(peers[0], &OfferAnswerOptions::default(), done);
    let offer = tokio_test::block_on(offer).unwrap().unwrap();
    let descriptions = vec![
        bridge.register(Arc::new(offer)),
        bridge
            .create_session_description(SdpType::Rollback, "")
            .unwrap(),
    ];

    let dead = bridge
        .create_session_description(SdpType::Rollback, "")
        .unwrap();
    assert!(bridge.release(dead));

    let targets = Arc::new(Targets {
        peers,
        channels,
        descriptions,
        dead,
    });
    let fired: Arc<Vec<AtomicUsize>> = Arc::new((0..CALLS).map(|_| AtomicUsize::new(0)).collect());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let (bridge, targets, fired) = (bridge.clone(), targets.clone(), fired.clone());
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for index in (t..CALLS).step_by(THREADS) {
                    let peer = targets.pick(&mut rng, &targets.peers);
                    match rng.gen_range(0..5) {
                        0 => bridge.create_offer(
                            peer,
                            &OfferAnswerOptions::default(),
                            tracked("stress_offer", &fired, index),
                        ),
                        1 => {
                            let desc = targets.pick(&mut rng, &targets.descriptions);
                            bridge.set_local_description(
                                peer,
                                desc,
                                tracked("stress_set_local", &fired, index),
                            )
                        }
                        2 => {
                            let desc = targets.pick(&mut rng, &targets.descriptions);
                            bridge.set_remote_description(
                                peer,
                                desc,
                                tracked("stress_set_remote", &fired, index),
                            )
                        }
                        3 => {
                            let channel = targets.pick(&mut rng, &targets.channels);
                            bridge.send_async(
                                channel,
                                b"load",
                                rng.gen(),
                                tracked("stress_send", &fired, index),
                            )
                        }
                        _ => {
                            let counter = fired.clone();
                            // A dead handle still delivers (an empty report).
                            let _ = bridge.get_stats(peer, index, move |index, _report| {
                                counter[index].fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let total = || fired.iter().map(|n| n.load(Ordering::SeqCst)).sum::<usize>();
    assert!(
        wait_blocking(Duration::from_secs(30), || total() >= CALLS),
        "only {} of {CALLS} calls resolved",
        total()
    );

    // Late duplicates would show up here.
    thread::sleep(Duration::from_millis(100));
    for (index, count) in fired.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "call {index} resolved wrong number of times");
    }

    bridge.shutdown();
}
