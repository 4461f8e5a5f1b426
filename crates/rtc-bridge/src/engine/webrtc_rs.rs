//! Engine adapter over the webrtc-rs stack
//!
//! webrtc-rs is async and runs on a private tokio runtime. Every callback it
//! raises is re-posted to the matching engine thread, so observers see the
//! same threading as with any other engine: peer connection events on the
//! signaling thread, data channel events on the network thread.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::{Handle as TokioHandle, Runtime as TokioRuntime};
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};

use super::{
    DataChannelSink, Engine, NativeDataChannel, NativePeerConnection, NativeRtpReceiver,
    NativeRtpSender, NativeRtpTransceiver, PeerConnectionSink, StatsSelector,
};
use crate::completion::Completion;
use crate::config::{
    DataChannelInit, IceTransportsType, MediaType, OfferAnswerOptions, RtcConfiguration,
    RtpTransceiverInit, TransceiverDirection,
};
use crate::data_channel::{DataBuffer, DataChannelState};
use crate::error::{Error, Result, RtcError, RtcErrorDetail, RtcErrorKind};
use crate::jsep::{IceCandidate, SdpType, SessionDescription};
use crate::peer_connection::{
    IceConnectionState, IceGatheringState, PeerConnectionState, SignalingState,
};
use crate::runtime::RtcRuntime;
use crate::thread::EngineThread;

type Relay<S> =
    Box<dyn FnMut(S) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> + Send + Sync>;

fn map_error(err: webrtc::Error) -> RtcError {
    match err {
        webrtc::Error::ErrConnectionClosed => RtcError::invalid_state(err.to_string()),
        other => RtcError::new(RtcErrorKind::OperationErrorWithData, other.to_string()),
    }
}

/// Run `fut` on the engine's tokio runtime and wait for it from a plain thread
fn block_on<F, T>(tokio: &TokioHandle, fut: F) -> std::result::Result<T, RtcError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = crossbeam::channel::bounded(1);
    tokio.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .map_err(|_| RtcError::internal("webrtc-rs task dropped before completion"))
}

/// Forward a webrtc-rs event to `thread`, then into `sink`
fn relay<S, F>(thread: &Arc<EngineThread>, sink: &Arc<dyn PeerConnectionSink>, deliver: F) -> Relay<S>
where
    S: Send + 'static,
    F: Fn(&dyn PeerConnectionSink, S) + Send + Sync + 'static,
{
    let thread = Arc::clone(thread);
    let sink = Arc::clone(sink);
    let deliver = Arc::new(deliver);
    Box::new(move |event: S| {
        let sink = Arc::clone(&sink);
        let deliver = Arc::clone(&deliver);
        thread.post(move || deliver(sink.as_ref(), event));
        Box::pin(async {})
    })
}

fn to_rtc_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.password.clone(),
            ..Default::default()
        })
        .collect();
    let ice_transport_policy = match config.ice_transport_type {
        IceTransportsType::Relay => RTCIceTransportPolicy::Relay,
        _ => RTCIceTransportPolicy::All,
    };
    RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        ..Default::default()
    }
}

fn to_rtc_description(desc: &SessionDescription) -> std::result::Result<RTCSessionDescription, RtcError> {
    let sdp = desc.sdp().to_string();
    let parsed = match desc.sdp_type() {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::PrAnswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    parsed.map_err(|err| {
        RtcError::new(RtcErrorKind::SyntaxError, err.to_string())
            .with_detail(RtcErrorDetail::SdpSyntaxError)
    })
}

fn from_rtc_description(desc: RTCSessionDescription) -> std::result::Result<SessionDescription, RtcError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::PrAnswer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Rollback => return Ok(SessionDescription::rollback()),
        RTCSdpType::Unspecified => {
            return Err(RtcError::internal("engine produced an untyped description"))
        }
    };
    SessionDescription::parse(sdp_type, desc.sdp)
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPrAnswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePrAnswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn map_ice_connection(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn map_gathering(state: RTCIceGathererState) -> IceGatheringState {
    match state {
        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
        RTCIceGathererState::Complete | RTCIceGathererState::Closed => IceGatheringState::Complete,
        _ => IceGatheringState::New,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        _ => DataChannelState::Connecting,
    }
}

fn codec_type(media_type: MediaType) -> RTPCodecType {
    match media_type {
        MediaType::Audio => RTPCodecType::Audio,
        MediaType::Video => RTPCodecType::Video,
    }
}

fn map_direction(direction: RTCRtpTransceiverDirection) -> TransceiverDirection {
    match direction {
        RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
        RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
        RTCRtpTransceiverDirection::Inactive => TransceiverDirection::Inactive,
        RTCRtpTransceiverDirection::Unspecified => TransceiverDirection::Stopped,
        RTCRtpTransceiverDirection::Sendrecv => TransceiverDirection::SendRecv,
    }
}

fn to_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive | TransceiverDirection::Stopped => {
            RTCRtpTransceiverDirection::Inactive
        }
    }
}

impl From<&DataChannelInit> for RTCDataChannelInit {
    #[allow(clippy::needless_update)]
    fn from(init: &DataChannelInit) -> Self {
        RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_packet_life_time: init.max_retransmit_time,
            max_retransmits: init.max_retransmits,
            protocol: Some(init.protocol.clone()),
            negotiated: if init.negotiated { init.id } else { None },
            ..Default::default()
        }
    }
}

/// Engine backed by webrtc-rs
pub struct WebRtcRsEngine {
    runtime: RtcRuntime,
    tokio: Option<TokioRuntime>,
    handle: TokioHandle,
    api: Arc<API>,
}

impl WebRtcRsEngine {
    pub fn new(runtime: RtcRuntime) -> Result<Self> {
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("rtc-io-{}", runtime.id()))
            .enable_all()
            .build()?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::runtime(format!("Failed to register codecs: {}", e)))?;
        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::runtime(format!("Failed to register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self {
            runtime,
            handle: tokio.handle().clone(),
            tokio: Some(tokio),
            api: Arc::new(api),
        })
    }
}

impl Drop for WebRtcRsEngine {
    fn drop(&mut self) {
        if let Some(tokio) = self.tokio.take() {
            tokio.shutdown_background();
        }
    }
}

impl Engine for WebRtcRsEngine {
    fn name(&self) -> &'static str {
        "webrtc-rs"
    }

    fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        sink: Arc<dyn PeerConnectionSink>,
    ) -> std::result::Result<Arc<dyn NativePeerConnection>, RtcError> {
        let api = Arc::clone(&self.api);
        let rtc_config = to_rtc_configuration(config);
        let pc = block_on(&self.handle, async move {
            api.new_peer_connection(rtc_config).await
        })?
        .map_err(map_error)?;

        let peer = Arc::new(WebRtcPeer {
            pc: Arc::new(pc),
            handle: self.handle.clone(),
            runtime: self.runtime.clone(),
            channels: Mutex::new(Vec::new()),
            transceivers: Mutex::new(Vec::new()),
            gathering: Arc::new(Mutex::new(IceGatheringState::New)),
            ice_restart: AtomicBool::new(false),
        });
        peer.install_handlers(&sink);
        debug!("webrtc-rs peer connection created");
        Ok(peer)
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    handle: TokioHandle,
    runtime: RtcRuntime,
    channels: Mutex<Vec<Weak<WebRtcChannel>>>,
    transceivers: Mutex<Vec<Arc<WebRtcTransceiver>>>,
    gathering: Arc<Mutex<IceGatheringState>>,
    ice_restart: AtomicBool,
}

impl WebRtcPeer {
    fn install_handlers(self: &Arc<Self>, sink: &Arc<dyn PeerConnectionSink>) {
        let signaling = self.runtime.signaling();

        self.pc.on_signaling_state_change(relay(signaling, sink, |sink, state| {
            sink.on_signaling_change(map_signaling(state))
        }));
        self.pc.on_peer_connection_state_change(relay(signaling, sink, |sink, state| {
            sink.on_connection_change(map_connection(state))
        }));
        self.pc.on_ice_connection_state_change(relay(signaling, sink, |sink, state| {
            sink.on_ice_connection_change(map_ice_connection(state))
        }));

        let gathering = Arc::clone(&self.gathering);
        self.pc.on_ice_gathering_state_change(relay(signaling, sink, move |sink, state| {
            let state = map_gathering(state);
            *gathering.lock() = state;
            sink.on_ice_gathering_change(state)
        }));

        let mut renegotiate = relay(signaling, sink, |sink, ()| sink.on_renegotiation_needed());
        self.pc
            .on_negotiation_needed(Box::new(move || renegotiate(())));

        self.pc.on_ice_candidate(relay(
            signaling,
            sink,
            |sink, candidate: Option<RTCIceCandidate>| {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        warn!(error = %err, "dropping unserializable local candidate");
                        return;
                    }
                };
                let parsed = IceCandidate::parse(
                    init.sdp_mid.unwrap_or_default(),
                    i32::from(init.sdp_mline_index.unwrap_or_default()),
                    &init.candidate,
                );
                match parsed {
                    Ok(candidate) => sink.on_ice_candidate(candidate),
                    Err(err) => warn!(error = %err, "dropping malformed local candidate"),
                }
            },
        ));

        let weak = Arc::downgrade(self);
        let signaling = Arc::clone(signaling);
        let sink_for_channels = Arc::clone(sink);
        self.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let Some(peer) = weak.upgrade() else {
                return Box::pin(async {});
            };
            let channel = WebRtcChannel::new(dc, None, &peer);
            let sink = Arc::clone(&sink_for_channels);
            signaling.post(move || sink.on_data_channel(channel));
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        let signaling = Arc::clone(self.runtime.signaling());
        let sink_for_tracks = Arc::clone(sink);
        self.pc
            .on_track(Box::new(move |track, _receiver, transceiver| {
                let weak = weak.clone();
                let signaling = Arc::clone(&signaling);
                let sink = Arc::clone(&sink_for_tracks);
                Box::pin(async move {
                    let Some(peer) = weak.upgrade() else {
                        return;
                    };
                    let wrapped = peer.adopt_transceiver(transceiver, Vec::new());
                    let streams = vec![track.stream_id().to_string()];
                    signaling.post(move || sink.on_track(wrapped, streams));
                })
            }));
    }

    fn adopt_transceiver(
        &self,
        inner: Arc<RTCRtpTransceiver>,
        stream_ids: Vec<String>,
    ) -> Arc<WebRtcTransceiver> {
        let mut transceivers = self.transceivers.lock();
        if let Some(existing) = transceivers
            .iter()
            .find(|known| Arc::ptr_eq(&known.inner, &inner))
        {
            return Arc::clone(existing);
        }
        let media_type = match inner.kind() {
            RTPCodecType::Video => MediaType::Video,
            _ => MediaType::Audio,
        };
        let wrapped = Arc::new(WebRtcTransceiver {
            inner,
            handle: self.handle.clone(),
            media_type,
            sender: Arc::new(WebRtcSender {
                id: Uuid::new_v4().to_string(),
                media_type,
                stream_ids,
            }),
            receiver: Arc::new(WebRtcReceiver {
                id: Uuid::new_v4().to_string(),
                media_type,
            }),
        });
        transceivers.push(Arc::clone(&wrapped));
        wrapped
    }

    /// Resolve `done` on the signaling thread with the outcome of `fut`
    fn complete_on_signaling<T, F>(&self, fut: F, done: Completion<T>)
    where
        T: Send + 'static,
        F: Future<Output = std::result::Result<T, RtcError>> + Send + 'static,
    {
        let signaling = Arc::clone(self.runtime.signaling());
        self.handle.spawn(async move {
            let result = fut.await;
            signaling.post(move || done.complete(result));
        });
    }

    fn stats_snapshot(&self, selector: &StatsSelector) -> serde_json::Value {
        let mut stats = Vec::new();
        if *selector == StatsSelector::All {
            stats.push(json!({
                "type": "peer-connection",
                "id": "P0",
                "connection_state": map_connection(self.pc.connection_state()),
                "signaling_state": map_signaling(self.pc.signaling_state()),
            }));
            let channels = self.channels.lock();
            for channel in channels.iter().filter_map(Weak::upgrade) {
                stats.push(channel.stats_entry());
            }
        }
        for transceiver in self.transceivers.lock().iter() {
            let wanted_out = match selector {
                StatsSelector::All => true,
                StatsSelector::Sender(id) => transceiver.sender.id == *id,
                StatsSelector::Receiver(_) => false,
            };
            let wanted_in = match selector {
                StatsSelector::All => true,
                StatsSelector::Receiver(id) => transceiver.receiver.id == *id,
                StatsSelector::Sender(_) => false,
            };
            if wanted_out {
                stats.push(json!({
                    "type": "outbound-rtp",
                    "id": format!("OT{}", transceiver.sender.id),
                    "kind": transceiver.media_type,
                    "sender_id": transceiver.sender.id,
                }));
            }
            if wanted_in {
                stats.push(json!({
                    "type": "inbound-rtp",
                    "id": format!("IT{}", transceiver.receiver.id),
                    "kind": transceiver.media_type,
                    "receiver_id": transceiver.receiver.id,
                }));
            }
        }
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or_default();
        json!({ "timestamp_us": timestamp_us, "stats": stats })
    }
}

impl NativePeerConnection for WebRtcPeer {
    fn create_offer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        let pc = Arc::clone(&self.pc);
        #[allow(clippy::needless_update)]
        let offer_options = RTCOfferOptions {
            ice_restart: options.ice_restart || self.ice_restart.swap(false, Ordering::SeqCst),
            voice_activity_detection: options.voice_activity_detection,
            ..Default::default()
        };
        self.complete_on_signaling(
            async move {
                let offer = pc.create_offer(Some(offer_options)).await.map_err(map_error)?;
                from_rtc_description(offer)
            },
            done,
        );
    }

    fn create_answer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        let pc = Arc::clone(&self.pc);
        #[allow(clippy::needless_update)]
        let answer_options = RTCAnswerOptions {
            voice_activity_detection: options.voice_activity_detection,
            ..Default::default()
        };
        self.complete_on_signaling(
            async move {
                let answer = pc
                    .create_answer(Some(answer_options))
                    .await
                    .map_err(map_error)?;
                from_rtc_description(answer)
            },
            done,
        );
    }

    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>) {
        let pc = Arc::clone(&self.pc);
        self.complete_on_signaling(
            async move {
                let desc = to_rtc_description(&desc)?;
                pc.set_local_description(desc).await.map_err(map_error)
            },
            done,
        );
    }

    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>) {
        let pc = Arc::clone(&self.pc);
        self.complete_on_signaling(
            async move {
                let desc = to_rtc_description(&desc)?;
                pc.set_remote_description(desc).await.map_err(map_error)
            },
            done,
        );
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>) {
        let pc = Arc::clone(&self.pc);
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate().to_string(),
            sdp_mid: Some(candidate.sdp_mid().to_string()),
            sdp_mline_index: u16::try_from(candidate.sdp_mline_index()).ok(),
            ..Default::default()
        };
        self.complete_on_signaling(
            async move { pc.add_ice_candidate(init).await.map_err(map_error) },
            done,
        );
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> std::result::Result<Arc<dyn NativeDataChannel>, RtcError> {
        init.validate()?;
        let pc = Arc::clone(&self.pc);
        let label = label.to_string();
        let options = RTCDataChannelInit::from(init);
        let dc = block_on(&self.handle, async move {
            pc.create_data_channel(&label, Some(options)).await
        })?
        .map_err(|err| map_error(err).with_detail(RtcErrorDetail::DataChannelFailure))?;

        let channel = WebRtcChannel::new(dc, Some(init.clone()), self);
        Ok(channel)
    }

    fn add_transceiver(
        &self,
        media_type: MediaType,
        init: &RtpTransceiverInit,
    ) -> std::result::Result<Arc<dyn NativeRtpTransceiver>, RtcError> {
        let pc = Arc::clone(&self.pc);
        let rtc_init = RTCRtpTransceiverInit {
            direction: to_direction(init.direction),
            send_encodings: Vec::new(),
        };
        let inner = block_on(&self.handle, async move {
            pc.add_transceiver_from_kind(codec_type(media_type), Some(rtc_init))
                .await
        })?
        .map_err(map_error)?;
        Ok(self.adopt_transceiver(inner, init.stream_ids.clone()))
    }

    fn transceivers(&self) -> Vec<Arc<dyn NativeRtpTransceiver>> {
        self.transceivers
            .lock()
            .iter()
            .map(|transceiver| Arc::clone(transceiver) as Arc<dyn NativeRtpTransceiver>)
            .collect()
    }

    fn set_configuration(&self, config: &RtcConfiguration) -> std::result::Result<(), RtcError> {
        let pc = Arc::clone(&self.pc);
        let rtc_config = to_rtc_configuration(config);
        block_on(&self.handle, async move {
            pc.set_configuration(rtc_config).await
        })?
        .map_err(map_error)
    }

    fn restart_ice(&self) {
        // Applied to the next offer.
        self.ice_restart.store(true, Ordering::SeqCst);
    }

    fn get_stats(&self, selector: StatsSelector, done: Completion<String>) {
        let report = self.stats_snapshot(&selector).to_string();
        let signaling = Arc::clone(self.runtime.signaling());
        self.runtime.worker().post(move || {
            signaling.post(move || done.succeed(report));
        });
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection(self.pc.connection_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_connection(self.pc.ice_connection_state())
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *self.gathering.lock()
    }

    fn current_local_description(&self) -> Option<SessionDescription> {
        let pc = Arc::clone(&self.pc);
        block_on(&self.handle, async move { pc.current_local_description().await })
            .ok()
            .flatten()
            .and_then(|desc| from_rtc_description(desc).ok())
    }

    fn current_remote_description(&self) -> Option<SessionDescription> {
        let pc = Arc::clone(&self.pc);
        block_on(&self.handle, async move { pc.current_remote_description().await })
            .ok()
            .flatten()
            .and_then(|desc| from_rtc_description(desc).ok())
    }

    fn close(&self) -> std::result::Result<(), RtcError> {
        let pc = Arc::clone(&self.pc);
        block_on(&self.handle, async move { pc.close().await })?.map_err(map_error)
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    init: Option<DataChannelInit>,
    handle: TokioHandle,
    network: Arc<EngineThread>,
    sink: Arc<Mutex<Option<Arc<dyn DataChannelSink>>>>,
    buffered: Arc<AtomicU64>,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>, init: Option<DataChannelInit>, peer: &WebRtcPeer) -> Arc<Self> {
        let channel = Arc::new(Self {
            dc,
            init,
            handle: peer.handle.clone(),
            network: Arc::clone(peer.runtime.network()),
            sink: Arc::new(Mutex::new(None)),
            buffered: Arc::new(AtomicU64::new(0)),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        });
        channel.install_handlers();
        peer.channels.lock().push(Arc::downgrade(&channel));
        channel
    }

    fn install_handlers(&self) {
        let (network, sink) = (Arc::clone(&self.network), Arc::clone(&self.sink));
        self.dc.on_open(Box::new(move || {
            network.post(move || {
                let current = sink.lock().clone();
                if let Some(sink) = current {
                    sink.on_state_change(DataChannelState::Open);
                }
            });
            Box::pin(async {})
        }));

        let (network, sink) = (Arc::clone(&self.network), Arc::clone(&self.sink));
        self.dc.on_close(Box::new(move || {
            let sink = Arc::clone(&sink);
            network.post(move || {
                let current = sink.lock().clone();
                if let Some(sink) = current {
                    sink.on_state_change(DataChannelState::Closed);
                }
            });
            Box::pin(async {})
        }));

        let (network, sink) = (Arc::clone(&self.network), Arc::clone(&self.sink));
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = Arc::clone(&sink);
            network.post(move || {
                let current = sink.lock().clone();
                if let Some(sink) = current {
                    sink.on_message(DataBuffer {
                        data: &msg.data,
                        binary: !msg.is_string,
                    });
                }
            });
            Box::pin(async {})
        }));
    }

    fn stats_entry(&self) -> serde_json::Value {
        json!({
            "type": "data-channel",
            "id": format!("D{}", self.dc.id()),
            "label": self.dc.label(),
            "protocol": self.dc.protocol(),
            "data_channel_identifier": self.dc.id(),
            "state": map_channel_state(self.dc.ready_state()),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "bytes_sent": self.bytes_sent.load(Ordering::Relaxed),
        })
    }
}

impl NativeDataChannel for WebRtcChannel {
    fn register_observer(&self, sink: Arc<dyn DataChannelSink>) {
        let previous = self.sink.lock().replace(sink);
        drop(previous);
    }

    fn unregister_observer(&self) {
        let previous = self.sink.lock().take();
        drop(previous);
    }

    fn send(&self, buffer: DataBuffer<'_>, done: Completion<()>) {
        let dc = Arc::clone(&self.dc);
        let payload = Bytes::copy_from_slice(buffer.data);
        let binary = buffer.binary;
        let len = payload.len() as u64;
        let network = Arc::clone(&self.network);
        let buffered = Arc::clone(&self.buffered);
        let sink = Arc::clone(&self.sink);

        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.handle.spawn(async move {
            let result = if binary {
                dc.send(&payload).await
            } else {
                dc.send_text(String::from_utf8_lossy(&payload).into_owned())
                    .await
            };
            let remaining = buffered.fetch_sub(len, Ordering::SeqCst).saturating_sub(len);
            network.post(move || {
                match result {
                    Ok(_) => done.succeed(()),
                    Err(err) => done.fail(
                        map_error(err).with_detail(RtcErrorDetail::DataChannelFailure),
                    ),
                }
                let current = sink.lock().clone();
                if let Some(sink) = current {
                    sink.on_buffered_amount_change(remaining);
                }
            });
        });
    }

    fn close(&self) {
        let dc = Arc::clone(&self.dc);
        self.handle.spawn(async move {
            if let Err(err) = dc.close().await {
                warn!(error = %err, "data channel close failed");
            }
        });
    }

    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn id(&self) -> Option<u16> {
        Some(self.dc.id())
    }

    fn protocol(&self) -> String {
        self.dc.protocol().to_string()
    }

    fn negotiated(&self) -> bool {
        self.dc.negotiated()
    }

    fn ordered(&self) -> bool {
        self.dc.ordered()
    }

    fn max_retransmit_time(&self) -> Option<u16> {
        self.init.as_ref().and_then(|init| init.max_retransmit_time)
    }

    fn max_retransmits(&self) -> Option<u16> {
        self.init.as_ref().and_then(|init| init.max_retransmits)
    }

    fn state(&self) -> DataChannelState {
        map_channel_state(self.dc.ready_state())
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }
}

struct WebRtcSender {
    id: String,
    media_type: MediaType,
    stream_ids: Vec<String>,
}

impl NativeRtpSender for WebRtcSender {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn stream_ids(&self) -> Vec<String> {
        self.stream_ids.clone()
    }
}

struct WebRtcReceiver {
    id: String,
    media_type: MediaType,
}

impl NativeRtpReceiver for WebRtcReceiver {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }
}

struct WebRtcTransceiver {
    inner: Arc<RTCRtpTransceiver>,
    handle: TokioHandle,
    media_type: MediaType,
    sender: Arc<WebRtcSender>,
    receiver: Arc<WebRtcReceiver>,
}

impl NativeRtpTransceiver for WebRtcTransceiver {
    fn mid(&self) -> Option<String> {
        self.inner.mid().map(|mid| mid.to_string())
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn direction(&self) -> TransceiverDirection {
        map_direction(self.inner.direction())
    }

    fn sender(&self) -> Arc<dyn NativeRtpSender> {
        self.sender.clone()
    }

    fn receiver(&self) -> Arc<dyn NativeRtpReceiver> {
        self.receiver.clone()
    }

    fn stop(&self) -> std::result::Result<(), RtcError> {
        let inner = Arc::clone(&self.inner);
        block_on(&self.handle, async move { inner.stop().await })?.map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_channel_init_preserves_unset_limits() {
        let init = DataChannelInit {
            reliable: false,
            max_retransmits: None,
            max_retransmit_time: Some(250),
            ..Default::default()
        };
        let rtc: RTCDataChannelInit = (&init).into();
        assert_eq!(rtc.max_retransmits, None);
        assert_eq!(rtc.max_packet_life_time, Some(250));
        assert_eq!(rtc.negotiated, None);
    }

    #[test]
    fn test_negotiated_carries_id() {
        let init = DataChannelInit {
            negotiated: true,
            id: Some(7),
            ..Default::default()
        };
        let rtc: RTCDataChannelInit = (&init).into();
        assert_eq!(rtc.negotiated, Some(7));
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_signaling(RTCSignalingState::HaveRemotePranswer),
            SignalingState::HaveRemotePrAnswer
        );
        assert_eq!(
            map_channel_state(RTCDataChannelState::Unspecified),
            DataChannelState::Connecting
        );
    }
}
