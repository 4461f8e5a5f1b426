//! Peer connection bridge

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::completion::{Completion, CompletionResult};
use crate::config::{
    DataChannelInit, MediaType, OfferAnswerOptions, RtcConfiguration, RtpTransceiverInit,
};
use crate::data_channel::DataChannel;
use crate::engine::{
    Engine, NativeDataChannel, NativePeerConnection, NativeRtpReceiver, NativeRtpTransceiver,
    PeerConnectionSink, StatsSelector,
};
use crate::error::RtcError;
use crate::jsep::{IceCandidate, SessionDescription};
use crate::observer::ObserverSlot;
use crate::rtp::{RtpReceiver, RtpSender, RtpTransceiver};
use crate::stats::{self, StatsReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveLocalPrAnswer,
    HaveRemoteOffer,
    HaveRemotePrAnswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

/// Failure reported by ICE for a single server or candidate pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateError {
    pub address: String,
    pub port: i32,
    pub url: String,
    pub error_code: i32,
    pub error_text: String,
}

/// Remote track announcement
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub transceiver: Arc<RtpTransceiver>,
    pub receiver: Arc<RtpReceiver>,
    pub streams: Vec<String>,
}

/// Peer connection notifications. Invoked on the signaling thread.
pub trait PeerConnectionObserver: Send + Sync {
    fn on_signaling_change(&self, state: SignalingState);

    fn on_ice_candidate(&self, candidate: IceCandidate);

    /// A channel opened by the remote peer
    fn on_data_channel(&self, channel: Arc<DataChannel>);

    fn on_track(&self, event: TrackEvent);

    fn on_connection_change(&self, state: PeerConnectionState);

    fn on_ice_candidate_error(&self, error: IceCandidateError);

    fn on_remove_track(&self, _receiver: Arc<RtpReceiver>) {}

    fn on_ice_connection_change(&self, _state: IceConnectionState) {}

    fn on_ice_gathering_change(&self, _state: IceGatheringState) {}

    fn on_renegotiation_needed(&self) {}
}

type DynPeerObserver = dyn PeerConnectionObserver;
type PeerObserverSlot = ObserverSlot<DynPeerObserver>;

/// Engine-facing sink: wraps engine objects, then forwards into the slot
struct PeerSink {
    slot: Weak<PeerObserverSlot>,
    peer: OnceLock<Weak<dyn NativePeerConnection>>,
    max_message_size: usize,
}

impl PeerSink {
    fn deliver(&self, f: impl FnOnce(&DynPeerObserver)) {
        if let Some(slot) = self.slot.upgrade() {
            slot.deliver(f);
        }
    }

    fn peer(&self) -> Option<Arc<dyn NativePeerConnection>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl PeerConnectionSink for PeerSink {
    fn on_signaling_change(&self, state: SignalingState) {
        self.deliver(|observer| observer.on_signaling_change(state));
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.deliver(|observer| observer.on_ice_candidate(candidate));
    }

    fn on_data_channel(&self, channel: Arc<dyn NativeDataChannel>) {
        let channel = DataChannel::new(channel, self.max_message_size);
        self.deliver(|observer| observer.on_data_channel(channel));
    }

    fn on_track(&self, transceiver: Arc<dyn NativeRtpTransceiver>, streams: Vec<String>) {
        let Some(peer) = self.peer() else {
            trace!("track announced after peer connection teardown");
            return;
        };
        let transceiver = RtpTransceiver::new(transceiver, peer);
        let event = TrackEvent {
            receiver: transceiver.receiver(),
            transceiver,
            streams,
        };
        self.deliver(|observer| observer.on_track(event));
    }

    fn on_remove_track(&self, receiver: Arc<dyn NativeRtpReceiver>) {
        let Some(peer) = self.peer() else {
            return;
        };
        let receiver = Arc::new(RtpReceiver::new(receiver, peer));
        self.deliver(|observer| observer.on_remove_track(receiver));
    }

    fn on_connection_change(&self, state: PeerConnectionState) {
        self.deliver(|observer| observer.on_connection_change(state));
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        self.deliver(|observer| observer.on_ice_connection_change(state));
    }

    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        self.deliver(|observer| observer.on_ice_gathering_change(state));
    }

    fn on_renegotiation_needed(&self) {
        self.deliver(|observer| observer.on_renegotiation_needed());
    }

    fn on_ice_candidate_error(&self, error: IceCandidateError) {
        self.deliver(|observer| observer.on_ice_candidate_error(error));
    }
}

fn lost(operation: &str) -> RtcError {
    RtcError::internal(format!("{operation} completion lost"))
}

pub struct PeerConnection {
    native: Arc<dyn NativePeerConnection>,
    observer: Arc<PeerObserverSlot>,
    max_message_size: usize,
}

impl PeerConnection {
    /// Create through `engine`. The observer, if any, is installed before the
    /// engine object exists so no early event is lost.
    pub fn create(
        engine: &dyn Engine,
        config: &RtcConfiguration,
        observer: Option<Arc<dyn PeerConnectionObserver>>,
        max_message_size: usize,
    ) -> Result<Arc<Self>, RtcError> {
        config.validate()?;

        let slot: Arc<PeerObserverSlot> = Arc::new(ObserverSlot::new("peer_connection"));
        if let Some(observer) = observer {
            slot.register(observer);
        }
        let sink = Arc::new(PeerSink {
            slot: Arc::downgrade(&slot),
            peer: OnceLock::new(),
            max_message_size,
        });

        let native = engine.create_peer_connection(config, sink.clone())?;
        let _ = sink.peer.set(Arc::downgrade(&native));
        debug!(engine = engine.name(), "peer connection created");

        Ok(Arc::new(Self {
            native,
            observer: slot,
            max_message_size,
        }))
    }

    /// Install `observer`, replacing any previous one
    pub fn register_observer(&self, observer: Arc<dyn PeerConnectionObserver>) {
        self.observer.register(observer);
    }

    /// Remove the observer; blocks until an in-flight callback has returned
    pub fn unregister_observer(&self) {
        drop(self.observer.unregister());
    }

    pub fn create_offer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        self.native.create_offer(options, done);
    }

    pub fn create_answer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        self.native.create_answer(options, done);
    }

    pub fn set_local_description(&self, desc: SessionDescription, done: Completion<()>) {
        self.native.set_local_description(desc, done);
    }

    pub fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>) {
        self.native.set_remote_description(desc, done);
    }

    pub fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>) {
        self.native.add_ice_candidate(candidate, done);
    }

    pub async fn offer(&self, options: &OfferAnswerOptions) -> CompletionResult<SessionDescription> {
        let (done, rx) = Completion::channel("create_offer");
        self.create_offer(options, done);
        rx.await.unwrap_or_else(|_| Err(lost("create_offer")))
    }

    pub async fn answer(&self, options: &OfferAnswerOptions) -> CompletionResult<SessionDescription> {
        let (done, rx) = Completion::channel("create_answer");
        self.create_answer(options, done);
        rx.await.unwrap_or_else(|_| Err(lost("create_answer")))
    }

    pub async fn apply_local_description(&self, desc: SessionDescription) -> CompletionResult<()> {
        let (done, rx) = Completion::channel("set_local_description");
        self.set_local_description(desc, done);
        rx.await
            .unwrap_or_else(|_| Err(lost("set_local_description")))
    }

    pub async fn apply_remote_description(&self, desc: SessionDescription) -> CompletionResult<()> {
        let (done, rx) = Completion::channel("set_remote_description");
        self.set_remote_description(desc, done);
        rx.await
            .unwrap_or_else(|_| Err(lost("set_remote_description")))
    }

    pub async fn apply_ice_candidate(&self, candidate: IceCandidate) -> CompletionResult<()> {
        let (done, rx) = Completion::channel("add_ice_candidate");
        self.add_ice_candidate(candidate, done);
        rx.await.unwrap_or_else(|_| Err(lost("add_ice_candidate")))
    }

    pub fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<DataChannel>, RtcError> {
        init.validate()?;
        let native = self.native.create_data_channel(label, init)?;
        Ok(DataChannel::new(native, self.max_message_size))
    }

    pub fn add_transceiver(
        &self,
        media_type: MediaType,
        init: &RtpTransceiverInit,
    ) -> Result<Arc<RtpTransceiver>, RtcError> {
        let native = self.native.add_transceiver(media_type, init)?;
        Ok(RtpTransceiver::new(native, Arc::clone(&self.native)))
    }

    pub fn transceivers(&self) -> Vec<Arc<RtpTransceiver>> {
        self.native
            .transceivers()
            .into_iter()
            .map(|native| RtpTransceiver::new(native, Arc::clone(&self.native)))
            .collect()
    }

    pub fn senders(&self) -> Vec<Arc<RtpSender>> {
        self.transceivers().iter().map(|t| t.sender()).collect()
    }

    pub fn receivers(&self) -> Vec<Arc<RtpReceiver>> {
        self.transceivers().iter().map(|t| t.receiver()).collect()
    }

    pub fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), RtcError> {
        config.validate()?;
        self.native.set_configuration(config)
    }

    pub fn restart_ice(&self) {
        self.native.restart_ice();
    }

    pub fn close(&self) -> Result<(), RtcError> {
        self.native.close()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.native.signaling_state()
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.native.connection_state()
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.native.ice_connection_state()
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.native.ice_gathering_state()
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.native.current_local_description()
    }

    pub fn current_remote_description(&self) -> Option<SessionDescription> {
        self.native.current_remote_description()
    }

    /// Full stats report. `on_delivered` fires exactly once, even if every
    /// handle to this peer connection is released before it does.
    pub fn get_stats<C, F>(self: &Arc<Self>, context: C, on_delivered: F)
    where
        C: Send + 'static,
        F: FnOnce(C, StatsReport) + Send + 'static,
    {
        stats::collect(
            &self.native,
            StatsSelector::All,
            Arc::clone(self),
            context,
            on_delivered,
        );
    }

    pub async fn stats(self: &Arc<Self>) -> StatsReport {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.get_stats(tx, |tx, report| {
            let _ = tx.send(report);
        });
        rx.await.unwrap_or_else(|_| StatsReport::empty())
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        drop(self.observer.unregister());
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("signaling_state", &self.native.signaling_state())
            .field("connection_state", &self.native.connection_state())
            .finish()
    }
}
