//! Handle-based boundary layer over a WebRTC media engine
//!
//! This crate exposes peer connections, data channels, RTP transceivers and
//! stats to a foreign caller through opaque handles, observer callbacks and
//! one-shot completions, while the engine does its work on three dedicated
//! threads.
//!
//! # Features
//!
//! - **Handle registry**: non-zero `u64` handles, typed resolution, explicit release
//! - **Observer slots**: register/unregister that never races an in-flight callback
//! - **Completions**: every async operation reports success or failure exactly once
//! - **Error codec**: `RtcError` round-trips through a fixed-layout hex wire string
//! - **Engines**: in-process [`LoopbackEngine`], webrtc-rs behind the `webrtc-rs` feature
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Foreign caller (C ABI, bindings, tests)                 │
//! │  ↓ handles + observers + completions                     │
//! │  Bridge                                                  │
//! │  ├─ HandleRegistry   (Handle → Arc<object>)              │
//! │  ├─ PeerConnection   ─┬─ ObserverSlot<PeerObserver>      │
//! │  │                    ├─ DataChannel ─ ObserverSlot      │
//! │  │                    └─ RtpTransceiver ─ Sender/Receiver│
//! │  └─ stats::collect   (keeps target alive until delivery) │
//! │     ↓ Engine traits (Native*, *Sink)                     │
//! │  Engine  ── RtcRuntime: network │ worker │ signaling     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use remotemedia_rtc_bridge::{Bridge, BridgeConfig, OfferAnswerOptions, RtcConfiguration};
//! use remotemedia_rtc_bridge::Completion;
//!
//! let bridge = Bridge::loopback(BridgeConfig::default())?;
//! let pc = bridge.create_peer_connection(&RtcConfiguration::default(), None)?;
//!
//! let (done, rx) = Completion::channel("create_offer");
//! bridge.create_offer(pc, &OfferAnswerOptions::default(), done);
//! let offer = rx.blocking_recv().expect("completion dropped")?;
//! println!("{}", offer.sdp());
//!
//! bridge.release(pc);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(clippy::all)]

pub mod bridge;
pub mod completion;
pub mod config;
pub mod data_channel;
pub mod engine;
pub mod error;
pub mod handle;
pub mod jsep;
pub mod logging;
pub mod observer;
pub mod peer_connection;
pub mod rtp;
pub mod runtime;
pub mod stats;
pub mod thread;

pub use bridge::Bridge;
pub use completion::{Completion, CompletionResult};
pub use config::{
    BridgeConfig, ContinualGatheringPolicy, DataChannelInit, IceServer, IceTransportsType,
    MediaType, OfferAnswerOptions, Priority, RtcConfiguration, RtpTransceiverInit,
    TransceiverDirection,
};
pub use data_channel::{DataBuffer, DataChannel, DataChannelObserver, DataChannelState};
pub use engine::{Engine, LoopbackEngine};
pub use error::{Error, Result, RtcError, RtcErrorDetail, RtcErrorKind, WireError};
pub use handle::{BridgeObject, Bridged, Handle, HandleRegistry, ObjectKind};
pub use jsep::{IceCandidate, SdpType, SessionDescription};
pub use logging::init_tracing;
pub use observer::ObserverSlot;
pub use peer_connection::{
    IceCandidateError, IceConnectionState, IceGatheringState, PeerConnection,
    PeerConnectionObserver, PeerConnectionState, SignalingState, TrackEvent,
};
pub use rtp::{RtpReceiver, RtpSender, RtpTransceiver};
pub use runtime::RtcRuntime;
pub use stats::StatsReport;
pub use thread::ThreadRole;

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
