//! Media engine interface
//!
//! The bridge drives the engine only through these traits. Engine objects are
//! shared (`Arc`) and report events through the `*Sink` traits, which the
//! bridge implements on top of its observer slots.
//!
//! Threading contract every engine must honour:
//!
//! - description operations and peer connection events run on the signaling
//!   thread;
//! - data channel traffic and state changes run on the network thread;
//! - stats are gathered off the signaling thread and delivered on it;
//! - every [`Completion`] handed to the engine is resolved exactly once, or
//!   dropped (which reports it abandoned).

use std::sync::Arc;

use crate::completion::Completion;
use crate::config::{
    DataChannelInit, MediaType, OfferAnswerOptions, RtcConfiguration, RtpTransceiverInit,
    TransceiverDirection,
};
use crate::data_channel::{DataBuffer, DataChannelState};
use crate::error::RtcError;
use crate::jsep::{IceCandidate, SessionDescription};
use crate::peer_connection::{
    IceCandidateError, IceConnectionState, IceGatheringState, PeerConnectionState, SignalingState,
};

pub mod loopback;
#[cfg(feature = "webrtc-rs")]
pub mod webrtc_rs;

pub use loopback::LoopbackEngine;
#[cfg(feature = "webrtc-rs")]
pub use webrtc_rs::WebRtcRsEngine;

/// What a stats request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsSelector {
    All,
    /// Outbound RTP of one sender, by sender id
    Sender(String),
    /// Inbound RTP of one receiver, by receiver id
    Receiver(String),
}

/// Peer connection factory
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        sink: Arc<dyn PeerConnectionSink>,
    ) -> Result<Arc<dyn NativePeerConnection>, RtcError>;
}

/// Peer connection events, delivered on the signaling thread
pub trait PeerConnectionSink: Send + Sync {
    fn on_signaling_change(&self, state: SignalingState);
    fn on_ice_candidate(&self, candidate: IceCandidate);
    fn on_data_channel(&self, channel: Arc<dyn NativeDataChannel>);
    fn on_track(&self, transceiver: Arc<dyn NativeRtpTransceiver>, streams: Vec<String>);
    fn on_remove_track(&self, receiver: Arc<dyn NativeRtpReceiver>);
    fn on_connection_change(&self, state: PeerConnectionState);
    fn on_ice_connection_change(&self, state: IceConnectionState);
    fn on_ice_gathering_change(&self, state: IceGatheringState);
    fn on_renegotiation_needed(&self);
    fn on_ice_candidate_error(&self, error: IceCandidateError);
}

pub trait NativePeerConnection: Send + Sync {
    fn create_offer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>);
    fn create_answer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>);
    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>);
    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>);
    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>);

    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, RtcError>;

    fn add_transceiver(
        &self,
        media_type: MediaType,
        init: &RtpTransceiverInit,
    ) -> Result<Arc<dyn NativeRtpTransceiver>, RtcError>;

    fn transceivers(&self) -> Vec<Arc<dyn NativeRtpTransceiver>>;

    fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), RtcError>;
    fn restart_ice(&self);

    /// Resolves with a serialized (JSON) report
    fn get_stats(&self, selector: StatsSelector, done: Completion<String>);

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> PeerConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;
    fn ice_gathering_state(&self) -> IceGatheringState;
    fn current_local_description(&self) -> Option<SessionDescription>;
    fn current_remote_description(&self) -> Option<SessionDescription>;

    fn close(&self) -> Result<(), RtcError>;
}

/// Data channel events, delivered on the network thread
pub trait DataChannelSink: Send + Sync {
    fn on_state_change(&self, state: DataChannelState);
    fn on_message(&self, buffer: DataBuffer<'_>);
    fn on_buffered_amount_change(&self, buffered_amount: u64);
}

pub trait NativeDataChannel: Send + Sync {
    fn register_observer(&self, sink: Arc<dyn DataChannelSink>);
    fn unregister_observer(&self);

    /// Resolves once the payload is queued or rejected
    fn send(&self, buffer: DataBuffer<'_>, done: Completion<()>);
    fn close(&self);

    fn label(&self) -> String;
    fn id(&self) -> Option<u16>;
    fn protocol(&self) -> String;
    fn negotiated(&self) -> bool;
    fn ordered(&self) -> bool;
    fn max_retransmit_time(&self) -> Option<u16>;
    fn max_retransmits(&self) -> Option<u16>;
    fn state(&self) -> DataChannelState;
    fn buffered_amount(&self) -> u64;
}

pub trait NativeRtpSender: Send + Sync {
    fn id(&self) -> String;
    fn media_type(&self) -> MediaType;
    fn stream_ids(&self) -> Vec<String>;
}

pub trait NativeRtpReceiver: Send + Sync {
    fn id(&self) -> String;
    fn media_type(&self) -> MediaType;
}

pub trait NativeRtpTransceiver: Send + Sync {
    fn mid(&self) -> Option<String>;
    fn media_type(&self) -> MediaType;
    fn direction(&self) -> TransceiverDirection;
    fn sender(&self) -> Arc<dyn NativeRtpSender>;
    fn receiver(&self) -> Arc<dyn NativeRtpReceiver>;
    fn stop(&self) -> Result<(), RtcError>;
}
