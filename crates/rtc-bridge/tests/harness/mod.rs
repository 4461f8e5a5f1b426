//! Integration test harness for the RTC bridge
//!
//! Provides:
//! - tracing setup shared by all tests
//! - recording observers for peer connections and data channels
//! - a negotiated loopback peer pair
//! - polling wait helpers with timeouts
//!
//! Basic usage pattern:
//!
//! 1. `let pair = PeerPair::new()?;`
//! 2. create data channels / transceivers on `pair.offerer`
//! 3. `pair.negotiate().await?;`
//! 4. assert on `pair.offerer_events` / `pair.answerer_events`

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use remotemedia_rtc_bridge::{
    BridgeConfig, DataBuffer, DataChannel, DataChannelObserver, DataChannelState,
    IceCandidate, IceCandidateError, IceConnectionState, IceGatheringState, LoopbackEngine,
    OfferAnswerOptions, PeerConnection, PeerConnectionObserver, PeerConnectionState,
    RtcConfiguration, RtcError, RtcRuntime, SignalingState, TrackEvent,
};

/// Default timeout for anything the engine threads do asynchronously
pub const WAIT: Duration = Duration::from_secs(5);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Engine error: {0}")]
    Rtc(#[from] RtcError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] remotemedia_rtc_bridge::Error),
}

/// Initialize test logging (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,remotemedia_rtc_bridge=debug,webrtc=warn")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Blocking variant of [`wait_until`] for plain `#[test]`s
pub fn wait_blocking<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Recording observers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Signaling(SignalingState),
    Candidate(IceCandidate),
    Connection(PeerConnectionState),
    IceConnection(IceConnectionState),
    IceGathering(IceGatheringState),
    DataChannel(String),
    Track(Vec<String>),
    RenegotiationNeeded,
    CandidateError(i32),
}

#[derive(Default)]
pub struct RecordingPeerObserver {
    events: Mutex<Vec<PeerEvent>>,
    channels: Mutex<Vec<Arc<DataChannel>>>,
    tracks: Mutex<Vec<TrackEvent>>,
}

impl RecordingPeerObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PeerEvent> {
        self.events.lock().clone()
    }

    pub fn signaling_states(&self) -> Vec<SignalingState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PeerEvent::Signaling(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PeerEvent::Candidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has(&self, event: &PeerEvent) -> bool {
        self.events.lock().contains(event)
    }

    pub fn channels(&self) -> Vec<Arc<DataChannel>> {
        self.channels.lock().clone()
    }

    pub fn tracks(&self) -> Vec<TrackEvent> {
        self.tracks.lock().clone()
    }

    fn push(&self, event: PeerEvent) {
        self.events.lock().push(event);
    }
}

impl PeerConnectionObserver for RecordingPeerObserver {
    fn on_signaling_change(&self, state: SignalingState) {
        self.push(PeerEvent::Signaling(state));
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.push(PeerEvent::Candidate(candidate));
    }

    fn on_data_channel(&self, channel: Arc<DataChannel>) {
        self.push(PeerEvent::DataChannel(channel.label()));
        self.channels.lock().push(channel);
    }

    fn on_track(&self, event: TrackEvent) {
        self.push(PeerEvent::Track(event.streams.clone()));
        self.tracks.lock().push(event);
    }

    fn on_connection_change(&self, state: PeerConnectionState) {
        self.push(PeerEvent::Connection(state));
    }

    fn on_ice_candidate_error(&self, error: IceCandidateError) {
        self.push(PeerEvent::CandidateError(error.error_code));
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        self.push(PeerEvent::IceConnection(state));
    }

    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        self.push(PeerEvent::IceGathering(state));
    }

    fn on_renegotiation_needed(&self) {
        self.push(PeerEvent::RenegotiationNeeded);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub data: Vec<u8>,
    pub binary: bool,
}

#[derive(Default)]
pub struct RecordingChannelObserver {
    states: Mutex<Vec<DataChannelState>>,
    messages: Mutex<Vec<ReceivedMessage>>,
    buffered: Mutex<Vec<u64>>,
}

impl RecordingChannelObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<DataChannelState> {
        self.states.lock().clone()
    }

    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn buffered_amounts(&self) -> Vec<u64> {
        self.buffered.lock().clone()
    }
}

impl DataChannelObserver for RecordingChannelObserver {
    fn on_state_change(&self, state: DataChannelState) {
        self.states.lock().push(state);
    }

    fn on_message(&self, buffer: DataBuffer<'_>) {
        self.messages.lock().push(ReceivedMessage {
            data: buffer.data.to_vec(),
            binary: buffer.binary,
        });
    }

    fn on_buffered_amount_change(&self, buffered_amount: u64) {
        self.buffered.lock().push(buffered_amount);
    }
}

// ============================================================================
// Loopback pair
// ============================================================================

pub struct PeerPair {
    pub runtime: RtcRuntime,
    pub engine: LoopbackEngine,
    pub offerer: Arc<PeerConnection>,
    pub answerer: Arc<PeerConnection>,
    pub offerer_events: Arc<RecordingPeerObserver>,
    pub answerer_events: Arc<RecordingPeerObserver>,
}

impl PeerPair {
    pub fn new() -> HarnessResult<Self> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> HarnessResult<Self> {
        let runtime = RtcRuntime::start(&config)?;
        let engine = LoopbackEngine::new(runtime.clone());
        let offerer_events = RecordingPeerObserver::new();
        let answerer_events = RecordingPeerObserver::new();

        let offerer = PeerConnection::create(
            &engine,
            &RtcConfiguration::default(),
            Some(offerer_events.clone()),
            config.max_message_size,
        )?;
        let answerer = PeerConnection::create(
            &engine,
            &RtcConfiguration::default(),
            Some(answerer_events.clone()),
            config.max_message_size,
        )?;

        Ok(Self {
            runtime,
            engine,
            offerer,
            answerer,
            offerer_events,
            answerer_events,
        })
    }

    /// Full offer/answer exchange, then wait for both sides to connect
    pub async fn negotiate(&self) -> HarnessResult<()> {
        let options = OfferAnswerOptions::default();

        let offer = self.offerer.offer(&options).await?;
        self.offerer.apply_local_description(offer.clone()).await?;
        self.answerer.apply_remote_description(offer).await?;

        let answer = self.answerer.answer(&options).await?;
        self.answerer
            .apply_local_description(answer.clone())
            .await?;
        self.offerer.apply_remote_description(answer).await?;

        let (offerer, answerer) = (self.offerer.clone(), self.answerer.clone());
        wait_until("both peers connected", WAIT, || {
            offerer.connection_state() == PeerConnectionState::Connected
                && answerer.connection_state() == PeerConnectionState::Connected
        })
        .await
    }

    /// Data channel the answerer received for `label`, once announced
    pub async fn remote_channel(&self, label: &str) -> HarnessResult<Arc<DataChannel>> {
        let events = self.answerer_events.clone();
        wait_until("remote data channel announced", WAIT, || {
            events.channels().iter().any(|channel| channel.label() == label)
        })
        .await?;
        self.answerer_events
            .channels()
            .into_iter()
            .find(|channel| channel.label() == label)
            .ok_or_else(|| HarnessError::Timeout(format!("channel {label}")))
    }
}

/// Wait until `channel` reports `state`
pub async fn wait_for_state(
    channel: &Arc<DataChannel>,
    state: DataChannelState,
) -> HarnessResult<()> {
    let channel = channel.clone();
    wait_until(&format!("data channel {state}"), WAIT, || {
        channel.state() == state
    })
    .await
}
