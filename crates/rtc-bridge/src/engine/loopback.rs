//! In-process loopback engine
//!
//! Peer connections created from the same [`LoopbackEngine`] negotiate with
//! each other through an ordinary offer/answer exchange. Every description
//! produced here carries an `a=x-loopback-peer:<id>` attribute; applying a
//! remote description resolves that id on the engine's network and, once both
//! sides are `stable`, the two peers are linked:
//!
//! ```text
//!   peer A (offerer)                         peer B (answerer)
//!   ────────────────                         ─────────────────
//!   create_offer ─► set_local(offer)
//!                          offer ──────────► set_remote(offer)
//!                                            create_answer ─► set_local(answer)
//!   set_remote(answer) ◄────────── answer
//!        │
//!        └─► link: mirror data channels (on_data_channel on B)
//!                  mirror transceivers  (on_track)
//!                  open channel pairs   (network thread)
//!                  connection state     connecting → connected
//! ```
//!
//! All peer state is mutated on the signaling thread; data channel traffic and
//! channel state changes run on the network thread; stats are gathered on the
//! worker thread and delivered on the signaling thread.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    DataChannelSink, Engine, NativeDataChannel, NativePeerConnection, NativeRtpReceiver,
    NativeRtpSender, NativeRtpTransceiver, PeerConnectionSink, StatsSelector,
};
use crate::completion::Completion;
use crate::config::{
    DataChannelInit, MediaType, OfferAnswerOptions, RtcConfiguration, RtpTransceiverInit,
    TransceiverDirection,
};
use crate::data_channel::{DataBuffer, DataChannelState};
use crate::error::{RtcError, RtcErrorDetail, RtcErrorKind};
use crate::jsep::{IceCandidate, SdpType, SessionDescription};
use crate::peer_connection::{
    IceConnectionState, IceGatheringState, PeerConnectionState, SignalingState,
};
use crate::runtime::RtcRuntime;

/// SDP attribute naming the peer that produced a description
pub const PEER_ATTRIBUTE: &str = "x-loopback-peer";

fn closed_error() -> RtcError {
    RtcError::invalid_state("peer connection is closed")
}

fn wrong_state(side: &str, sdp_type: SdpType, state: SignalingState) -> RtcError {
    RtcError::invalid_state(format!(
        "failed to set {side} {sdp_type} sdp: called in wrong state: {state}"
    ))
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
}

#[derive(Default)]
struct LoopbackNetwork {
    peers: DashMap<u64, Weak<LoopbackPeer>>,
    next_peer: AtomicU64,
}

impl LoopbackNetwork {
    fn lookup(&self, id: u64) -> Option<Arc<LoopbackPeer>> {
        self.peers.get(&id).and_then(|entry| entry.value().upgrade())
    }
}

/// Engine whose peer connections only talk to each other
pub struct LoopbackEngine {
    runtime: RtcRuntime,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackEngine {
    pub fn new(runtime: RtcRuntime) -> Self {
        Self {
            runtime,
            network: Arc::new(LoopbackNetwork::default()),
        }
    }

    pub fn runtime(&self) -> &RtcRuntime {
        &self.runtime
    }

    /// Live peer connections on this engine
    pub fn peer_count(&self) -> usize {
        self.network
            .peers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}

impl Engine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        sink: Arc<dyn PeerConnectionSink>,
    ) -> Result<Arc<dyn NativePeerConnection>, RtcError> {
        if !self.runtime.is_running() {
            return Err(RtcError::invalid_state("engine runtime has been shut down"));
        }
        let id = self.network.next_peer.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = Arc::new_cyclic(|weak_self| LoopbackPeer {
            id,
            weak_self: weak_self.clone(),
            runtime: self.runtime.clone(),
            network: Arc::downgrade(&self.network),
            sink,
            state: Mutex::new(PeerState::new(config.clone())),
        });
        self.network.peers.insert(id, Arc::downgrade(&peer));
        debug!(peer = id, "loopback peer connection created");
        Ok(peer)
    }
}

// ----------------------------------------------------------------------------
// Peer connection
// ----------------------------------------------------------------------------

struct RemoteLink {
    id: u64,
    peer: Weak<LoopbackPeer>,
}

struct PeerState {
    config: RtcConfiguration,
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice_connection: IceConnectionState,
    ice_gathering: IceGatheringState,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    remote: Option<RemoteLink>,
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<LoopbackChannel>>,
    transceivers: Vec<Arc<LoopbackTransceiver>>,
    session_version: u64,
    ice_ufrag: String,
    needs_ice_restart: bool,
    closed: bool,
}

impl PeerState {
    fn new(config: RtcConfiguration) -> Self {
        Self {
            config,
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            ice_connection: IceConnectionState::New,
            ice_gathering: IceGatheringState::New,
            pending_local: None,
            current_local: None,
            pending_remote: None,
            current_remote: None,
            remote: None,
            remote_candidates: Vec::new(),
            channels: Vec::new(),
            transceivers: Vec::new(),
            session_version: 0,
            ice_ufrag: random_token(8),
            needs_ice_restart: false,
            closed: false,
        }
    }

    fn next_free_channel_id(&self) -> Result<u16, RtcError> {
        (0..u16::MAX)
            .find(|id| self.channels.iter().all(|channel| channel.id != *id))
            .ok_or_else(|| {
                RtcError::new(RtcErrorKind::ResourceExhausted, "no free data channel ids")
            })
    }

    fn local_description(&self) -> Option<&SessionDescription> {
        self.pending_local.as_ref().or(self.current_local.as_ref())
    }

    fn remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote.as_ref().or(self.current_remote.as_ref())
    }
}

enum PeerEvent {
    Signaling(SignalingState),
    Connection(PeerConnectionState),
    IceConnection(IceConnectionState),
    IceGathering(IceGatheringState),
    Candidate(IceCandidate),
}

/// Result of a description being applied
struct Applied {
    events: Vec<PeerEvent>,
    gather: bool,
    link: bool,
}

struct LoopbackPeer {
    id: u64,
    weak_self: Weak<LoopbackPeer>,
    runtime: RtcRuntime,
    network: Weak<LoopbackNetwork>,
    sink: Arc<dyn PeerConnectionSink>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    /// Run `task` on the signaling thread. Dropped (abandoning any completion
    /// it owns) if the peer is gone or the runtime has stopped.
    fn on_signaling<F>(&self, task: F) -> bool
    where
        F: FnOnce(Arc<LoopbackPeer>) + Send + 'static,
    {
        let weak = self.weak_self.clone();
        self.runtime.signaling().post(move || {
            if let Some(peer) = weak.upgrade() {
                task(peer);
            }
        })
    }

    /// Blocking hop to the signaling thread for synchronous operations
    fn call_signaling<R, F>(&self, operation: &'static str, f: F) -> Result<R, RtcError>
    where
        R: Send + 'static,
        F: FnOnce(&LoopbackPeer) -> Result<R, RtcError> + Send + 'static,
    {
        let weak = self.weak_self.clone();
        self.runtime
            .signaling()
            .invoke(operation, move || match weak.upgrade() {
                Some(peer) => f(&peer),
                None => Err(RtcError::invalid_state("peer connection destroyed")),
            })
            .map_err(RtcError::from)?
    }

    fn emit(&self, events: Vec<PeerEvent>) {
        for event in events {
            match event {
                PeerEvent::Signaling(state) => self.sink.on_signaling_change(state),
                PeerEvent::Connection(state) => self.sink.on_connection_change(state),
                PeerEvent::IceConnection(state) => self.sink.on_ice_connection_change(state),
                PeerEvent::IceGathering(state) => self.sink.on_ice_gathering_change(state),
                PeerEvent::Candidate(candidate) => self.sink.on_ice_candidate(candidate),
            }
        }
    }

    fn create_description(
        &self,
        sdp_type: SdpType,
        options: OfferAnswerOptions,
    ) -> Result<SessionDescription, RtcError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(closed_error());
        }
        let allowed = match sdp_type {
            SdpType::Offer => matches!(
                st.signaling,
                SignalingState::Stable | SignalingState::HaveLocalOffer
            ),
            _ => matches!(
                st.signaling,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer
            ),
        };
        if !allowed {
            return Err(RtcError::invalid_state(format!(
                "cannot create {sdp_type} in state {}",
                st.signaling
            )));
        }
        if options.ice_restart || st.needs_ice_restart {
            st.ice_ufrag = random_token(8);
            st.needs_ice_restart = false;
        }
        st.session_version += 1;
        let sdp = self.render_sdp(&st, &options);
        SessionDescription::parse(sdp_type, sdp)
    }

    fn render_sdp(&self, st: &PeerState, options: &OfferAnswerOptions) -> String {
        let mut mids: Vec<String> = st
            .transceivers
            .iter()
            .enumerate()
            .map(|(index, transceiver)| transceiver.assign_mid(index))
            .collect();
        if !st.channels.is_empty() {
            mids.push(st.transceivers.len().to_string());
        }

        let mut sdp = String::new();
        let _ = write!(
            sdp,
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id, st.session_version
        );
        if options.use_rtp_mux && !mids.is_empty() {
            let _ = write!(sdp, "a=group:BUNDLE {}\r\n", mids.join(" "));
        }
        let _ = write!(
            sdp,
            "a={PEER_ATTRIBUTE}:{}\r\na=ice-ufrag:{}\r\n",
            self.id, st.ice_ufrag
        );
        for (transceiver, mid) in st.transceivers.iter().zip(&mids) {
            let kind = match transceiver.media_type {
                MediaType::Audio => "audio",
                MediaType::Video => "video",
            };
            let _ = write!(
                sdp,
                "m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na={}\r\n",
                transceiver.direction().as_sdp()
            );
            for stream in &transceiver.sender.stream_ids {
                let _ = write!(sdp, "a=msid:{stream} {}\r\n", transceiver.sender.id);
            }
        }
        if !st.channels.is_empty() {
            let _ = write!(
                sdp,
                "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{}\r\na=sctp-port:5000\r\n",
                st.transceivers.len()
            );
        }
        sdp
    }

    fn finish_transition(
        st: &mut PeerState,
        previous: SignalingState,
        next: SignalingState,
        gather: bool,
        link: bool,
    ) -> Applied {
        st.signaling = next;
        let mut events = Vec::new();
        if previous != next {
            events.push(PeerEvent::Signaling(next));
        }
        let gather = gather && st.ice_gathering == IceGatheringState::New;
        if gather {
            st.ice_gathering = IceGatheringState::Gathering;
            events.push(PeerEvent::IceGathering(IceGatheringState::Gathering));
        }
        Applied {
            events,
            gather,
            link: link && next == SignalingState::Stable,
        }
    }

    fn apply_local(&self, desc: SessionDescription) -> Result<Applied, RtcError> {
        let own_id = self.id.to_string();
        let sdp_type = desc.sdp_type();
        if sdp_type != SdpType::Rollback && !desc.attributes(PEER_ATTRIBUTE).any(|id| id == own_id)
        {
            return Err(RtcError::new(
                RtcErrorKind::InvalidModification,
                "local description was not created by this peer connection",
            ));
        }

        let mut st = self.state.lock();
        if st.closed {
            return Err(closed_error());
        }
        let previous = st.signaling;
        let next = match (sdp_type, previous) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                st.pending_local = Some(desc);
                SignalingState::HaveLocalOffer
            }
            (
                SdpType::PrAnswer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer,
            ) => {
                st.pending_local = Some(desc);
                SignalingState::HaveLocalPrAnswer
            }
            (
                SdpType::Answer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer,
            ) => {
                st.pending_local = None;
                st.current_local = Some(desc);
                if let Some(remote) = st.pending_remote.take() {
                    st.current_remote = Some(remote);
                }
                SignalingState::Stable
            }
            (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                st.pending_local = None;
                SignalingState::Stable
            }
            (sdp_type, state) => return Err(wrong_state("local", sdp_type, state)),
        };
        Ok(Self::finish_transition(
            &mut st,
            previous,
            next,
            sdp_type != SdpType::Rollback,
            sdp_type == SdpType::Answer,
        ))
    }

    fn apply_remote(&self, desc: SessionDescription) -> Result<Applied, RtcError> {
        let sdp_type = desc.sdp_type();
        let remote = if sdp_type == SdpType::Rollback {
            None
        } else {
            let id = desc
                .attributes(PEER_ATTRIBUTE)
                .next()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .ok_or_else(|| {
                    RtcError::new(
                        RtcErrorKind::SyntaxError,
                        format!("remote description has no {PEER_ATTRIBUTE} attribute"),
                    )
                    .with_detail(RtcErrorDetail::SdpSyntaxError)
                })?;
            if id == self.id {
                return Err(RtcError::invalid_parameter(
                    "remote description was created by this peer connection",
                ));
            }
            let peer = self
                .network
                .upgrade()
                .and_then(|network| network.lookup(id))
                .ok_or_else(|| {
                    RtcError::new(
                        RtcErrorKind::NetworkError,
                        format!("loopback peer {id} is unreachable"),
                    )
                })?;
            Some(RemoteLink {
                id,
                peer: Arc::downgrade(&peer),
            })
        };

        let mut st = self.state.lock();
        if st.closed {
            return Err(closed_error());
        }
        let previous = st.signaling;
        let next = match (sdp_type, previous) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                st.pending_remote = Some(desc);
                SignalingState::HaveRemoteOffer
            }
            (
                SdpType::PrAnswer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
            ) => {
                st.pending_remote = Some(desc);
                SignalingState::HaveRemotePrAnswer
            }
            (
                SdpType::Answer,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemotePrAnswer,
            ) => {
                st.pending_remote = None;
                st.current_remote = Some(desc);
                if let Some(local) = st.pending_local.take() {
                    st.current_local = Some(local);
                }
                SignalingState::Stable
            }
            (SdpType::Rollback, SignalingState::HaveRemoteOffer) => {
                st.pending_remote = None;
                SignalingState::Stable
            }
            (sdp_type, state) => return Err(wrong_state("remote", sdp_type, state)),
        };
        if remote.is_some() {
            st.remote = remote;
        }
        Ok(Self::finish_transition(
            &mut st,
            previous,
            next,
            false,
            sdp_type == SdpType::Answer,
        ))
    }

    fn after_transition(&self, applied: Applied) {
        self.emit(applied.events);
        if applied.gather {
            // Candidates trickle in after the set-description completion.
            self.on_signaling(|peer| peer.gather_candidates());
        }
        if applied.link {
            self.try_link();
        }
    }

    fn gather_candidates(&self) {
        let candidate = {
            let mut st = self.state.lock();
            if st.closed || st.ice_gathering != IceGatheringState::Gathering {
                return;
            }
            st.ice_gathering = IceGatheringState::Complete;
            let mid = st
                .local_description()
                .and_then(|desc| desc.attributes("mid").next().map(str::to_string))
                .unwrap_or_else(|| "0".to_string());
            let port: u16 = rand::thread_rng().gen_range(49152..=65535);
            IceCandidate::parse(
                mid,
                0,
                &format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                    self.id
                ),
            )
        };

        let mut events = Vec::new();
        match candidate {
            Ok(candidate) => events.push(PeerEvent::Candidate(candidate)),
            Err(err) => warn!(peer = self.id, error = %err, "host candidate rejected"),
        }
        events.push(PeerEvent::IceGathering(IceGatheringState::Complete));
        self.emit(events);
    }

    fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(closed_error());
        }
        let Some(remote) = st.remote_description() else {
            return Err(RtcError::invalid_state(
                "remote description is not set, cannot add ICE candidate",
            ));
        };
        let media = remote.media_sections().count();
        let mid_known = remote.attributes("mid").any(|mid| mid == candidate.sdp_mid());
        let index_known = (candidate.sdp_mline_index() as usize) < media.max(1);
        if !mid_known && !index_known {
            return Err(RtcError::invalid_parameter(format!(
                "candidate for unknown media section {} / {}",
                candidate.sdp_mid(),
                candidate.sdp_mline_index()
            )));
        }
        trace!(peer = self.id, candidate = candidate.candidate(), "remote candidate added");
        st.remote_candidates.push(candidate);
        Ok(())
    }

    fn is_stable_with(&self, remote_id: u64) -> bool {
        let st = self.state.lock();
        !st.closed
            && st.signaling == SignalingState::Stable
            && st.current_local.is_some()
            && st.current_remote.is_some()
            && st.remote.as_ref().map(|link| link.id) == Some(remote_id)
    }

    fn try_link(&self) {
        let remote = {
            let st = self.state.lock();
            if st.closed
                || st.signaling != SignalingState::Stable
                || st.current_local.is_none()
                || st.current_remote.is_none()
            {
                return;
            }
            st.remote.as_ref().and_then(|link| link.peer.upgrade())
        };
        let Some(remote) = remote else {
            return;
        };
        if !remote.is_stable_with(self.id) {
            return;
        }

        debug!(local = self.id, remote = remote.id, "loopback peers linked");
        self.mirror_into(&remote);
        remote.mirror_into(self);
        self.mark_connected();
        remote.mark_connected();
    }

    /// Announce everything not yet mirrored to `remote`
    fn mirror_into(&self, remote: &LoopbackPeer) {
        let (channels, transceivers) = {
            let st = self.state.lock();
            let channels: Vec<_> = st
                .channels
                .iter()
                .filter(|channel| !channel.is_linked())
                .cloned()
                .collect();
            let transceivers: Vec<_> = st
                .transceivers
                .iter()
                .filter(|transceiver| !transceiver.mirrored.swap(true, Ordering::SeqCst))
                .cloned()
                .collect();
            (channels, transceivers)
        };
        for channel in &channels {
            remote.accept_channel(channel);
        }
        for transceiver in &transceivers {
            remote.accept_track(transceiver);
        }
    }

    /// Pair a channel opened by the remote side with one on this side
    fn accept_channel(&self, remote_channel: &Arc<LoopbackChannel>) {
        if remote_channel.init.negotiated {
            let counterpart = {
                let st = self.state.lock();
                st.channels
                    .iter()
                    .find(|channel| {
                        channel.init.negotiated
                            && channel.id == remote_channel.id
                            && !channel.is_linked()
                    })
                    .cloned()
            };
            if let Some(counterpart) = counterpart {
                LoopbackChannel::link(remote_channel, &counterpart);
                LoopbackChannel::open_pair(remote_channel, &counterpart);
            }
            return;
        }

        let partner = LoopbackChannel::new(
            remote_channel.label.clone(),
            remote_channel.id,
            remote_channel.init.clone(),
            self.runtime.clone(),
        );
        self.state.lock().channels.push(Arc::clone(&partner));
        LoopbackChannel::link(remote_channel, &partner);
        self.sink.on_data_channel(partner.clone());
        LoopbackChannel::open_pair(remote_channel, &partner);
    }

    fn accept_track(&self, remote_transceiver: &Arc<LoopbackTransceiver>) {
        let mirror = LoopbackTransceiver::mirror_of(remote_transceiver);
        self.state.lock().transceivers.push(Arc::clone(&mirror));
        if remote_transceiver.direction().sends() {
            self.sink
                .on_track(mirror, remote_transceiver.sender.stream_ids.clone());
        }
    }

    fn mark_connected(&self) {
        {
            let mut st = self.state.lock();
            if st.closed || st.connection == PeerConnectionState::Connected {
                return;
            }
            st.connection = PeerConnectionState::Connected;
            st.ice_connection = IceConnectionState::Connected;
        }
        self.emit(vec![
            PeerEvent::IceConnection(IceConnectionState::Checking),
            PeerEvent::Connection(PeerConnectionState::Connecting),
            PeerEvent::IceConnection(IceConnectionState::Connected),
            PeerEvent::Connection(PeerConnectionState::Connected),
        ]);
    }

    fn on_remote_closed(&self) {
        self.on_signaling(|peer| {
            {
                let mut st = peer.state.lock();
                if st.closed || st.connection == PeerConnectionState::Disconnected {
                    return;
                }
                st.connection = PeerConnectionState::Disconnected;
                st.ice_connection = IceConnectionState::Disconnected;
            }
            peer.emit(vec![
                PeerEvent::IceConnection(IceConnectionState::Disconnected),
                PeerEvent::Connection(PeerConnectionState::Disconnected),
            ]);
        });
    }

    fn close_now(&self) {
        let (channels, transceivers, remote) = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.signaling = SignalingState::Closed;
            st.connection = PeerConnectionState::Closed;
            st.ice_connection = IceConnectionState::Closed;
            (
                st.channels.clone(),
                st.transceivers.clone(),
                st.remote.as_ref().and_then(|link| link.peer.upgrade()),
            )
        };
        debug!(peer = self.id, "loopback peer connection closed");

        for channel in &channels {
            channel.close();
        }
        for transceiver in &transceivers {
            transceiver.set_direction(TransceiverDirection::Stopped);
        }
        if let Some(remote) = remote {
            remote.on_remote_closed();
        }
        self.emit(vec![
            PeerEvent::Signaling(SignalingState::Closed),
            PeerEvent::IceConnection(IceConnectionState::Closed),
            PeerEvent::Connection(PeerConnectionState::Closed),
        ]);
    }

    fn create_data_channel_now(
        &self,
        label: String,
        init: DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, RtcError> {
        let (channel, remote, first) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(closed_error());
            }
            let id = match init.id {
                Some(id) if st.channels.iter().any(|channel| channel.id == id) => {
                    return Err(RtcError::invalid_parameter(format!(
                        "data channel id {id} is already in use"
                    )));
                }
                Some(id) => id,
                None => st.next_free_channel_id()?,
            };
            let channel = LoopbackChannel::new(label, id, init, self.runtime.clone());
            let first = st.channels.is_empty();
            st.channels.push(Arc::clone(&channel));
            let remote = if st.connection == PeerConnectionState::Connected {
                st.remote.as_ref().and_then(|link| link.peer.upgrade())
            } else {
                None
            };
            (channel, remote, first)
        };

        match remote {
            // Already connected: the SCTP association exists, open in-band.
            Some(remote) => remote.accept_channel(&channel),
            None if first => {
                self.on_signaling(|peer| peer.sink.on_renegotiation_needed());
            }
            None => {}
        }
        Ok(channel)
    }

    fn add_transceiver_now(
        &self,
        media_type: MediaType,
        init: RtpTransceiverInit,
    ) -> Result<Arc<dyn NativeRtpTransceiver>, RtcError> {
        let transceiver = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(closed_error());
            }
            let transceiver =
                LoopbackTransceiver::new(media_type, init.direction, init.stream_ids, false);
            st.transceivers.push(Arc::clone(&transceiver));
            transceiver
        };
        self.on_signaling(|peer| peer.sink.on_renegotiation_needed());
        Ok(transceiver)
    }

    fn collect_stats(&self, selector: &StatsSelector) -> Result<String, RtcError> {
        let mut stats = Vec::new();
        {
            let st = self.state.lock();
            match selector {
                StatsSelector::All => {
                    let channel_states: Vec<_> =
                        st.channels.iter().map(|channel| channel.state()).collect();
                    stats.push(StatsEntry::PeerConnection {
                        id: format!("P{}", self.id),
                        data_channels_opened: channel_states
                            .iter()
                            .filter(|state| **state == DataChannelState::Open)
                            .count() as u32,
                        data_channels_closed: channel_states
                            .iter()
                            .filter(|state| **state == DataChannelState::Closed)
                            .count() as u32,
                        remote_candidates: st.remote_candidates.len() as u32,
                    });
                    stats.extend(st.channels.iter().map(|channel| channel.stats_entry()));
                    for transceiver in &st.transceivers {
                        stats.push(transceiver.outbound_entry());
                        stats.push(transceiver.inbound_entry());
                    }
                }
                StatsSelector::Sender(id) => {
                    let transceiver = st
                        .transceivers
                        .iter()
                        .find(|transceiver| transceiver.sender.id == *id)
                        .ok_or_else(|| {
                            RtcError::invalid_parameter(format!("unknown sender {id}"))
                        })?;
                    stats.push(transceiver.outbound_entry());
                }
                StatsSelector::Receiver(id) => {
                    let transceiver = st
                        .transceivers
                        .iter()
                        .find(|transceiver| transceiver.receiver.id == *id)
                        .ok_or_else(|| {
                            RtcError::invalid_parameter(format!("unknown receiver {id}"))
                        })?;
                    stats.push(transceiver.inbound_entry());
                }
            }
        }

        serde_json::to_string(&StatsSnapshot {
            timestamp_us: timestamp_us(),
            stats,
        })
        .map_err(|err| RtcError::internal(format!("stats serialization failed: {err}")))
    }
}

impl NativePeerConnection for LoopbackPeer {
    fn create_offer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        let options = *options;
        self.on_signaling(move |peer| {
            done.complete(peer.create_description(SdpType::Offer, options));
        });
    }

    fn create_answer(&self, options: &OfferAnswerOptions, done: Completion<SessionDescription>) {
        let options = *options;
        self.on_signaling(move |peer| {
            done.complete(peer.create_description(SdpType::Answer, options));
        });
    }

    fn set_local_description(&self, desc: SessionDescription, done: Completion<()>) {
        self.on_signaling(move |peer| match peer.apply_local(desc) {
            Ok(applied) => {
                done.succeed(());
                peer.after_transition(applied);
            }
            Err(err) => done.fail(err),
        });
    }

    fn set_remote_description(&self, desc: SessionDescription, done: Completion<()>) {
        self.on_signaling(move |peer| match peer.apply_remote(desc) {
            Ok(applied) => {
                done.succeed(());
                peer.after_transition(applied);
            }
            Err(err) => done.fail(err),
        });
    }

    fn add_ice_candidate(&self, candidate: IceCandidate, done: Completion<()>) {
        self.on_signaling(move |peer| done.complete(peer.apply_candidate(candidate)));
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, RtcError> {
        init.validate()?;
        let label = label.to_string();
        let init = init.clone();
        self.call_signaling("create_data_channel", move |peer| {
            peer.create_data_channel_now(label, init)
        })
    }

    fn add_transceiver(
        &self,
        media_type: MediaType,
        init: &RtpTransceiverInit,
    ) -> Result<Arc<dyn NativeRtpTransceiver>, RtcError> {
        let init = init.clone();
        self.call_signaling("add_transceiver", move |peer| {
            peer.add_transceiver_now(media_type, init)
        })
    }

    fn transceivers(&self) -> Vec<Arc<dyn NativeRtpTransceiver>> {
        self.state
            .lock()
            .transceivers
            .iter()
            .map(|transceiver| Arc::clone(transceiver) as Arc<dyn NativeRtpTransceiver>)
            .collect()
    }

    fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), RtcError> {
        let config = config.clone();
        self.call_signaling("set_configuration", move |peer| {
            let mut st = peer.state.lock();
            if st.closed {
                return Err(closed_error());
            }
            if st.config.ice_servers != config.ice_servers
                || st.config.ice_transport_type != config.ice_transport_type
            {
                st.needs_ice_restart = true;
            }
            st.config = config;
            Ok(())
        })
    }

    fn restart_ice(&self) {
        self.on_signaling(|peer| {
            {
                let mut st = peer.state.lock();
                if st.closed {
                    return;
                }
                st.needs_ice_restart = true;
            }
            peer.sink.on_renegotiation_needed();
        });
    }

    fn get_stats(&self, selector: StatsSelector, done: Completion<String>) {
        let weak = self.weak_self.clone();
        let signaling = Arc::clone(self.runtime.signaling());
        self.runtime.worker().post(move || {
            let Some(peer) = weak.upgrade() else {
                return;
            };
            let report = peer.collect_stats(&selector);
            drop(peer);
            signaling.post(move || done.complete(report));
        });
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_connection
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().ice_gathering
    }

    fn current_local_description(&self) -> Option<SessionDescription> {
        self.state.lock().current_local.clone()
    }

    fn current_remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().current_remote.clone()
    }

    fn close(&self) -> Result<(), RtcError> {
        let weak = self.weak_self.clone();
        let result = self.runtime.signaling().invoke("close", move || {
            if let Some(peer) = weak.upgrade() {
                peer.close_now();
            }
        });
        match result {
            Ok(()) => Ok(()),
            Err(crate::error::Error::WrongThread { .. }) => {
                // Called from another engine thread: close asynchronously.
                self.on_signaling(|peer| peer.close_now());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        for channel in st.channels.drain(..) {
            channel.close();
        }
        if !st.closed {
            if let Some(remote) = st.remote.as_ref().and_then(|link| link.peer.upgrade()) {
                remote.on_remote_closed();
            }
        }
        if let Some(network) = self.network.upgrade() {
            network.peers.remove(&self.id);
        }
        trace!(peer = self.id, "loopback peer connection dropped");
    }
}

// ----------------------------------------------------------------------------
// Data channel
// ----------------------------------------------------------------------------

struct ChannelState {
    state: DataChannelState,
    sink: Option<Arc<dyn DataChannelSink>>,
    partner: Weak<LoopbackChannel>,
    linked: bool,
    buffered: u64,
    messages_sent: u64,
    bytes_sent: u64,
    messages_received: u64,
    bytes_received: u64,
}

struct LoopbackChannel {
    label: String,
    id: u16,
    init: DataChannelInit,
    runtime: RtcRuntime,
    weak_self: Weak<LoopbackChannel>,
    state: Mutex<ChannelState>,
}

enum Transmit {
    Rejected {
        error: RtcError,
        sink: Option<Arc<dyn DataChannelSink>>,
        buffered: u64,
    },
    Accepted {
        sink: Option<Arc<dyn DataChannelSink>>,
        partner: Option<Arc<LoopbackChannel>>,
        buffered: u64,
    },
}

impl LoopbackChannel {
    fn new(label: String, id: u16, init: DataChannelInit, runtime: RtcRuntime) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            label,
            id,
            init,
            runtime,
            weak_self: weak_self.clone(),
            state: Mutex::new(ChannelState {
                state: DataChannelState::Connecting,
                sink: None,
                partner: Weak::new(),
                linked: false,
                buffered: 0,
                messages_sent: 0,
                bytes_sent: 0,
                messages_received: 0,
                bytes_received: 0,
            }),
        })
    }

    fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        for (this, other) in [(a, b), (b, a)] {
            let mut st = this.state.lock();
            st.partner = Arc::downgrade(other);
            st.linked = true;
        }
    }

    fn open_pair(a: &Arc<Self>, b: &Arc<Self>) {
        let (a, b) = (Arc::clone(a), Arc::clone(b));
        a.runtime.clone().network().post(move || {
            a.open();
            b.open();
        });
    }

    /// Network thread only
    fn open(&self) {
        let sink = {
            let mut st = self.state.lock();
            if st.state != DataChannelState::Connecting {
                return;
            }
            st.state = DataChannelState::Open;
            st.sink.clone()
        };
        debug!(label = %self.label, id = self.id, "data channel open");
        if let Some(sink) = sink {
            sink.on_state_change(DataChannelState::Open);
        }
    }

    /// Network thread only
    fn transmit(&self, payload: Bytes, binary: bool, done: Completion<()>) {
        let len = payload.len() as u64;
        let outcome = {
            let mut st = self.state.lock();
            if st.state != DataChannelState::Open {
                st.buffered = st.buffered.saturating_sub(len);
                Transmit::Rejected {
                    error: RtcError::invalid_state(format!("data channel is {}", st.state))
                        .with_detail(RtcErrorDetail::DataChannelFailure),
                    sink: st.sink.clone(),
                    buffered: st.buffered,
                }
            } else {
                st.messages_sent += 1;
                st.bytes_sent += len;
                Transmit::Accepted {
                    sink: st.sink.clone(),
                    partner: st.partner.upgrade(),
                    buffered: st.buffered,
                }
            }
        };

        let (sink, partner, buffered) = match outcome {
            Transmit::Rejected {
                error,
                sink,
                buffered,
            } => {
                if let Some(sink) = sink {
                    sink.on_buffered_amount_change(buffered);
                }
                done.fail(error);
                return;
            }
            Transmit::Accepted {
                sink,
                partner,
                buffered,
            } => (sink, partner, buffered),
        };

        if let Some(sink) = &sink {
            sink.on_buffered_amount_change(buffered);
        }
        done.succeed(());
        if let Some(partner) = partner {
            partner.receive(&payload, binary);
        }

        let (sink, buffered) = {
            let mut st = self.state.lock();
            st.buffered = st.buffered.saturating_sub(len);
            (st.sink.clone(), st.buffered)
        };
        if let Some(sink) = sink {
            sink.on_buffered_amount_change(buffered);
        }
    }

    /// Network thread only
    fn receive(&self, data: &[u8], binary: bool) {
        let sink = {
            let mut st = self.state.lock();
            if st.state != DataChannelState::Open {
                trace!(label = %self.label, "message dropped, channel not open");
                return;
            }
            st.messages_received += 1;
            st.bytes_received += data.len() as u64;
            st.sink.clone()
        };
        if let Some(sink) = sink {
            sink.on_message(DataBuffer { data, binary });
        }
    }

    /// Network thread only
    fn close_now(&self) {
        let sink = {
            let mut st = self.state.lock();
            if matches!(st.state, DataChannelState::Closing | DataChannelState::Closed) {
                return;
            }
            st.state = DataChannelState::Closing;
            st.sink.clone()
        };
        if let Some(sink) = &sink {
            sink.on_state_change(DataChannelState::Closing);
        }

        let (sink, partner) = {
            let mut st = self.state.lock();
            st.state = DataChannelState::Closed;
            (st.sink.clone(), st.partner.upgrade())
        };
        debug!(label = %self.label, id = self.id, "data channel closed");
        if let Some(sink) = sink {
            sink.on_state_change(DataChannelState::Closed);
        }
        if let Some(partner) = partner {
            partner.close_now();
        }
    }

    fn stats_entry(&self) -> StatsEntry {
        let st = self.state.lock();
        StatsEntry::DataChannel {
            id: format!("D{}", self.id),
            label: self.label.clone(),
            protocol: self.init.protocol.clone(),
            data_channel_identifier: self.id,
            state: st.state,
            messages_sent: st.messages_sent,
            bytes_sent: st.bytes_sent,
            messages_received: st.messages_received,
            bytes_received: st.bytes_received,
        }
    }
}

impl NativeDataChannel for LoopbackChannel {
    fn register_observer(&self, sink: Arc<dyn DataChannelSink>) {
        let previous = self.state.lock().sink.replace(sink);
        drop(previous);
    }

    fn unregister_observer(&self) {
        let previous = self.state.lock().sink.take();
        drop(previous);
    }

    fn send(&self, buffer: DataBuffer<'_>, done: Completion<()>) {
        let Some(this) = self.weak_self.upgrade() else {
            done.fail(RtcError::invalid_state("data channel destroyed"));
            return;
        };
        let payload = Bytes::copy_from_slice(buffer.data);
        let binary = buffer.binary;
        let len = payload.len() as u64;

        self.state.lock().buffered += len;
        let posted = self
            .runtime
            .network()
            .post(move || this.transmit(payload, binary, done));
        if !posted {
            let mut st = self.state.lock();
            st.buffered = st.buffered.saturating_sub(len);
        }
    }

    fn close(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.runtime.network().post(move || this.close_now());
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> Option<u16> {
        Some(self.id)
    }

    fn protocol(&self) -> String {
        self.init.protocol.clone()
    }

    fn negotiated(&self) -> bool {
        self.init.negotiated
    }

    fn ordered(&self) -> bool {
        self.init.ordered
    }

    fn max_retransmit_time(&self) -> Option<u16> {
        self.init.max_retransmit_time
    }

    fn max_retransmits(&self) -> Option<u16> {
        self.init.max_retransmits
    }

    fn state(&self) -> DataChannelState {
        self.state.lock().state
    }

    fn buffered_amount(&self) -> u64 {
        self.state.lock().buffered
    }
}

// ----------------------------------------------------------------------------
// RTP
// ----------------------------------------------------------------------------

struct LoopbackSender {
    id: String,
    media_type: MediaType,
    stream_ids: Vec<String>,
    ssrc: u32,
}

impl NativeRtpSender for LoopbackSender {
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

struct LoopbackReceiver {
    id: String,
    media_type: MediaType,
    ssrc: u32,
}

impl NativeRtpReceiver for LoopbackReceiver {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }
}

struct LoopbackTransceiver {
    media_type: MediaType,
    mid: Mutex<Option<String>>,
    direction: Mutex<TransceiverDirection>,
    sender: Arc<LoopbackSender>,
    receiver: Arc<LoopbackReceiver>,
    /// Already announced to the remote side (or is itself a mirror)
    mirrored: AtomicBool,
}

impl LoopbackTransceiver {
    fn new(
        media_type: MediaType,
        direction: TransceiverDirection,
        stream_ids: Vec<String>,
        mirrored: bool,
    ) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        Arc::new(Self {
            media_type,
            mid: Mutex::new(None),
            direction: Mutex::new(direction),
            sender: Arc::new(LoopbackSender {
                id: Uuid::new_v4().to_string(),
                media_type,
                stream_ids,
                ssrc: rng.gen(),
            }),
            receiver: Arc::new(LoopbackReceiver {
                id: Uuid::new_v4().to_string(),
                media_type,
                ssrc: rng.gen(),
            }),
            mirrored: AtomicBool::new(mirrored),
        })
    }

    fn mirror_of(remote: &LoopbackTransceiver) -> Arc<Self> {
        let mirror = Self::new(
            remote.media_type,
            remote.direction().reversed(),
            Vec::new(),
            true,
        );
        *mirror.mid.lock() = remote.mid.lock().clone();
        mirror
    }

    fn assign_mid(&self, index: usize) -> String {
        self.mid
            .lock()
            .get_or_insert_with(|| index.to_string())
            .clone()
    }

    fn set_direction(&self, direction: TransceiverDirection) {
        *self.direction.lock() = direction;
    }

    fn outbound_entry(&self) -> StatsEntry {
        StatsEntry::OutboundRtp {
            id: format!("OT{}", self.sender.ssrc),
            kind: self.media_type,
            ssrc: self.sender.ssrc,
            mid: self.mid.lock().clone(),
            sender_id: self.sender.id.clone(),
        }
    }

    fn inbound_entry(&self) -> StatsEntry {
        StatsEntry::InboundRtp {
            id: format!("IT{}", self.receiver.ssrc),
            kind: self.media_type,
            ssrc: self.receiver.ssrc,
            mid: self.mid.lock().clone(),
            receiver_id: self.receiver.id.clone(),
        }
    }
}

impl NativeRtpTransceiver for LoopbackTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    fn media_type(&self) -> MediaType {
        self.media_type
    }

    fn direction(&self) -> TransceiverDirection {
        *self.direction.lock()
    }

    fn sender(&self) -> Arc<dyn NativeRtpSender> {
        self.sender.clone()
    }

    fn receiver(&self) -> Arc<dyn NativeRtpReceiver> {
        self.receiver.clone()
    }

    fn stop(&self) -> Result<(), RtcError> {
        self.set_direction(TransceiverDirection::Stopped);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct StatsSnapshot {
    timestamp_us: u64,
    stats: Vec<StatsEntry>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum StatsEntry {
    PeerConnection {
        id: String,
        data_channels_opened: u32,
        data_channels_closed: u32,
        remote_candidates: u32,
    },
    DataChannel {
        id: String,
        label: String,
        protocol: String,
        data_channel_identifier: u16,
        state: DataChannelState,
        messages_sent: u64,
        bytes_sent: u64,
        messages_received: u64,
        bytes_received: u64,
    },
    OutboundRtp {
        id: String,
        kind: MediaType,
        ssrc: u32,
        mid: Option<String>,
        sender_id: String,
    },
    InboundRtp {
        id: String,
        kind: MediaType,
        ssrc: u32,
        mid: Option<String>,
        receiver_id: String,
    },
}
