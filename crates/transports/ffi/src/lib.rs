//! C ABI for the RemoteMedia RTC bridge
//!
//! Exposes [`remotemedia_rtc_bridge::Bridge`] as `extern "C"` functions
//! prefixed `rtc_`. Objects cross the boundary as `u64` handles, callbacks
//! as `#[repr(C)]` tables of function pointers plus a `user_data` pointer,
//! and errors as wire-encoded strings (see [`RtcError::to_wire`]).
//!
//! A typical host:
//! 1. `rtc_bridge_create(NULL, &err)`
//! 2. `rtc_peer_connection_create(bridge, config_json, &observer, ctx, &err)`
//! 3. drive offer/answer with the `rtc_peer_connection_*` calls
//! 4. `rtc_handle_release` every handle it received
//! 5. `rtc_bridge_dispose(bridge)`
//!
//! [`RtcError::to_wire`]: remotemedia_rtc_bridge::RtcError::to_wire

#![warn(clippy::all)]

pub mod api;
pub mod callbacks;
pub mod channel;
pub mod error;
pub mod peer;

pub use api::RtcBridge;
pub use callbacks::{
    RtcCompletionObserver, RtcCreateSdpObserver, RtcDataChannelObserver, RtcPeerObserver,
    RtcSetSdpObserver, RtcStatsCallback, UserData,
};
pub use error::{FfiError, FfiResult};
pub use peer::{RtcDataChannelInit, RtcOfferAnswerOptions};
