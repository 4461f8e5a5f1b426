//! Handle-based bridge facade
//!
//! [`Bridge`] ties the engine threads, an [`Engine`] and a [`HandleRegistry`]
//! together. Every object crosses the boundary as an opaque [`Handle`]; the
//! caller owns one reference per handle it receives and gives it back with
//! [`Bridge::release`].
//!
//! All methods may be called from any thread. Synchronous operations hop to
//! the signaling thread and block; called from one of the *other* engine
//! threads (typically from inside a data channel callback) they fail with
//! [`Error::WrongThread`] instead of deadlocking. Callback-style operations
//! never block.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::completion::Completion;
use crate::config::{
    BridgeConfig, DataChannelInit, MediaType, OfferAnswerOptions, RtcConfiguration,
    RtpTransceiverInit,
};
use crate::data_channel::{DataChannel, DataChannelObserver, DataChannelState};
use crate::engine::{Engine, LoopbackEngine};
use crate::error::{Error, Result};
use crate::handle::{BridgeObject, Bridged, Handle, HandleRegistry, ObjectKind};
use crate::jsep::{IceCandidate, SdpType, SessionDescription};
use crate::peer_connection::{
    PeerConnection, PeerConnectionObserver, PeerConnectionState, SignalingState,
};
use crate::rtp::RtpTransceiver;
use crate::runtime::RtcRuntime;
use crate::stats::StatsReport;

pub struct Bridge {
    config: BridgeConfig,
    runtime: RtcRuntime,
    engine: Arc<dyn Engine>,
    handles: Arc<HandleRegistry>,
}

impl Bridge {
    /// Start the engine threads and build the engine on top of them
    pub fn new<F>(config: BridgeConfig, engine: F) -> Result<Self>
    where
        F: FnOnce(RtcRuntime) -> Result<Arc<dyn Engine>>,
    {
        config.validate()?;
        let runtime = RtcRuntime::start(&config)?;
        let engine = engine(runtime.clone())?;
        info!(
            engine = engine.name(),
            runtime = runtime.id(),
            "RTC bridge started"
        );
        Ok(Self {
            config,
            runtime,
            engine,
            handles: Arc::new(HandleRegistry::new()),
        })
    }

    /// Bridge over the in-process [`LoopbackEngine`]
    pub fn loopback(config: BridgeConfig) -> Result<Self> {
        Self::new(config, |runtime| {
            Ok(Arc::new(LoopbackEngine::new(runtime)) as Arc<dyn Engine>)
        })
    }

    /// Bridge over the webrtc-rs stack
    #[cfg(feature = "webrtc-rs")]
    pub fn webrtc(config: BridgeConfig) -> Result<Self> {
        Self::new(config, |runtime| {
            Ok(Arc::new(crate::engine::WebRtcRsEngine::new(runtime)?) as Arc<dyn Engine>)
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RtcRuntime {
        &self.runtime
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    pub fn register<T: Bridged>(&self, object: Arc<T>) -> Handle {
        self.handles.create(object)
    }

    pub fn resolve<T: Bridged>(&self, handle: Handle) -> Result<Arc<T>> {
        self.handles.resolve(handle)
    }

    pub fn kind_of(&self, handle: Handle) -> Option<ObjectKind> {
        self.handles.kind_of(handle)
    }

    /// Give back the caller's reference. `false` if the handle was unknown.
    pub fn release(&self, handle: Handle) -> bool {
        self.handles.release(handle)
    }

    // ------------------------------------------------------------------
    // Session descriptions and candidates
    // ------------------------------------------------------------------

    pub fn create_session_description(&self, sdp_type: SdpType, sdp: &str) -> Result<Handle> {
        let desc = SessionDescription::parse(sdp_type, sdp)?;
        Ok(self.register(Arc::new(desc)))
    }

    pub fn create_ice_candidate(
        &self,
        sdp_mid: &str,
        sdp_mline_index: i32,
        candidate: &str,
    ) -> Result<Handle> {
        let candidate = IceCandidate::parse(sdp_mid, sdp_mline_index, candidate)?;
        Ok(self.register(Arc::new(candidate)))
    }

    // ------------------------------------------------------------------
    // Peer connections
    // ------------------------------------------------------------------

    pub fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        observer: Option<Arc<dyn PeerConnectionObserver>>,
    ) -> Result<Handle> {
        let peer = PeerConnection::create(
            self.engine.as_ref(),
            config,
            observer,
            self.config.max_message_size,
        )?;
        let handle = self.register(peer);
        debug!(%handle, "peer connection registered");
        Ok(handle)
    }

    pub fn register_peer_observer(
        &self,
        peer: Handle,
        observer: Arc<dyn PeerConnectionObserver>,
    ) -> Result<()> {
        self.resolve::<PeerConnection>(peer)?
            .register_observer(observer);
        Ok(())
    }

    pub fn unregister_peer_observer(&self, peer: Handle) -> Result<()> {
        self.resolve::<PeerConnection>(peer)?.unregister_observer();
        Ok(())
    }

    /// `done` fires exactly once, also when `peer` does not resolve
    pub fn create_offer(
        &self,
        peer: Handle,
        options: &OfferAnswerOptions,
        done: Completion<SessionDescription>,
    ) {
        match self.resolve::<PeerConnection>(peer) {
            Ok(pc) => pc.create_offer(options, done),
            Err(err) => done.fail(err.into()),
        }
    }

    pub fn create_answer(
        &self,
        peer: Handle,
        options: &OfferAnswerOptions,
        done: Completion<SessionDescription>,
    ) {
        match self.resolve::<PeerConnection>(peer) {
            Ok(pc) => pc.create_answer(options, done),
            Err(err) => done.fail(err.into()),
        }
    }

    pub fn set_local_description(&self, peer: Handle, desc: Handle, done: Completion<()>) {
        match self.resolve_pair::<SessionDescription>(peer, desc) {
            Ok((pc, desc)) => pc.set_local_description((*desc).clone(), done),
            Err(err) => done.fail(err.into()),
        }
    }

    pub fn set_remote_description(&self, peer: Handle, desc: Handle, done: Completion<()>) {
        match self.resolve_pair::<SessionDescription>(peer, desc) {
            Ok((pc, desc)) => pc.set_remote_description((*desc).clone(), done),
            Err(err) => done.fail(err.into()),
        }
    }

    pub fn add_ice_candidate(&self, peer: Handle, candidate: Handle, done: Completion<()>) {
        match self.resolve_pair::<IceCandidate>(peer, candidate) {
            Ok((pc, candidate)) => pc.add_ice_candidate((*candidate).clone(), done),
            Err(err) => done.fail(err.into()),
        }
    }

    fn resolve_pair<T: Bridged>(
        &self,
        peer: Handle,
        other: Handle,
    ) -> Result<(Arc<PeerConnection>, Arc<T>)> {
        Ok((self.resolve(peer)?, self.resolve(other)?))
    }

    pub fn create_data_channel(
        &self,
        peer: Handle,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Handle> {
        let channel = self
            .resolve::<PeerConnection>(peer)?
            .create_data_channel(label, init)?;
        Ok(self.register(channel))
    }

    pub fn add_transceiver(
        &self,
        peer: Handle,
        media_type: MediaType,
        init: &RtpTransceiverInit,
    ) -> Result<Handle> {
        let transceiver = self
            .resolve::<PeerConnection>(peer)?
            .add_transceiver(media_type, init)?;
        Ok(self.register(transceiver))
    }

    /// One new handle per transceiver; the caller releases each
    pub fn transceivers(&self, peer: Handle) -> Result<Vec<Handle>> {
        let transceivers = self.resolve::<PeerConnection>(peer)?.transceivers();
        Ok(transceivers
            .into_iter()
            .map(|transceiver| self.register(transceiver))
            .collect())
    }

    pub fn current_local_description(&self, peer: Handle) -> Result<Option<Handle>> {
        let desc = self
            .resolve::<PeerConnection>(peer)?
            .current_local_description();
        Ok(desc.map(|desc| self.register(Arc::new(desc))))
    }

    pub fn current_remote_description(&self, peer: Handle) -> Result<Option<Handle>> {
        let desc = self
            .resolve::<PeerConnection>(peer)?
            .current_remote_description();
        Ok(desc.map(|desc| self.register(Arc::new(desc))))
    }

    pub fn signaling_state(&self, peer: Handle) -> Result<SignalingState> {
        Ok(self.resolve::<PeerConnection>(peer)?.signaling_state())
    }

    pub fn connection_state(&self, peer: Handle) -> Result<PeerConnectionState> {
        Ok(self.resolve::<PeerConnection>(peer)?.connection_state())
    }

    pub fn set_configuration(&self, peer: Handle, config: &RtcConfiguration) -> Result<()> {
        self.resolve::<PeerConnection>(peer)?
            .set_configuration(config)?;
        Ok(())
    }

    pub fn restart_ice(&self, peer: Handle) -> Result<()> {
        self.resolve::<PeerConnection>(peer)?.restart_ice();
        Ok(())
    }

    pub fn close_peer_connection(&self, peer: Handle) -> Result<()> {
        self.resolve::<PeerConnection>(peer)?.close()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transceivers
    // ------------------------------------------------------------------

    pub fn transceiver_sender(&self, transceiver: Handle) -> Result<Handle> {
        let sender = self.resolve::<RtpTransceiver>(transceiver)?.sender();
        Ok(self.register(sender))
    }

    pub fn transceiver_receiver(&self, transceiver: Handle) -> Result<Handle> {
        let receiver = self.resolve::<RtpTransceiver>(transceiver)?.receiver();
        Ok(self.register(receiver))
    }

    pub fn stop_transceiver(&self, transceiver: Handle) -> Result<()> {
        self.resolve::<RtpTransceiver>(transceiver)?.stop()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data channels
    // ------------------------------------------------------------------

    pub fn register_data_channel_observer(
        &self,
        channel: Handle,
        observer: Arc<dyn DataChannelObserver>,
    ) -> Result<()> {
        self.resolve::<DataChannel>(channel)?
            .register_observer(observer);
        Ok(())
    }

    pub fn unregister_data_channel_observer(&self, channel: Handle) -> Result<()> {
        self.resolve::<DataChannel>(channel)?.unregister_observer();
        Ok(())
    }

    /// `done` fires exactly once, also when `channel` does not resolve
    pub fn send_async(&self, channel: Handle, data: &[u8], binary: bool, done: Completion<()>) {
        match self.resolve::<DataChannel>(channel) {
            Ok(dc) => dc.send_async(data, binary, done),
            Err(err) => done.fail(err.into()),
        }
    }

    pub fn close_data_channel(&self, channel: Handle) -> Result<()> {
        self.resolve::<DataChannel>(channel)?.close();
        Ok(())
    }

    pub fn data_channel_state(&self, channel: Handle) -> Result<DataChannelState> {
        Ok(self.resolve::<DataChannel>(channel)?.state())
    }

    pub fn buffered_amount(&self, channel: Handle) -> Result<u64> {
        Ok(self.resolve::<DataChannel>(channel)?.buffered_amount())
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    /// Stats for a peer connection, sender or receiver handle.
    ///
    /// `on_delivered` fires exactly once, even if `target` is released
    /// immediately afterwards. When `target` does not resolve to a stats
    /// source it receives an empty report before this returns `Err`.
    pub fn get_stats<C, F>(&self, target: Handle, context: C, on_delivered: F) -> Result<()>
    where
        C: Send + 'static,
        F: FnOnce(C, StatsReport) + Send + 'static,
    {
        let object = match self.handles.resolve_object(target) {
            Ok(object) => object,
            Err(err) => return Err(undeliverable_stats(err, context, on_delivered)),
        };
        match object {
            BridgeObject::PeerConnection(pc) => pc.get_stats(context, on_delivered),
            BridgeObject::RtpSender(sender) => sender.get_stats(context, on_delivered),
            BridgeObject::RtpReceiver(receiver) => receiver.get_stats(context, on_delivered),
            other => {
                let err = Error::HandleKindMismatch {
                    handle: target,
                    expected: ObjectKind::PeerConnection,
                    actual: other.kind(),
                };
                return Err(undeliverable_stats(err, context, on_delivered));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Release every outstanding handle and stop the engine threads.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.runtime.is_running() {
            return;
        }
        let released = self.handles.clear();
        self.runtime.shutdown();
        info!(released, "RTC bridge shut down");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn undeliverable_stats<C, F>(err: Error, context: C, on_delivered: F) -> Error
where
    F: FnOnce(C, StatsReport),
{
    warn!(error = %err, "stats target unavailable, delivering empty report");
    on_delivered(context, StatsReport::empty());
    err
}
