//! `#[repr(C)]` callback tables and the adapters that drive them
//!
//! Every table is copied by value when it is handed to the library. Each
//! entry is optional; a null entry silently drops that notification. The
//! `user_data` pointer given alongside a table is passed back verbatim as the
//! first argument of every callback and is never dereferenced here.
//!
//! Handles delivered to a callback (new candidates, channels, transceivers,
//! descriptions) belong to the caller, who releases them with
//! `rtc_handle_release`. Strings passed to a callback are borrowed and only
//! valid for the duration of the call.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use remotemedia_rtc_bridge::{
    Completion, CompletionResult, DataBuffer, DataChannel, DataChannelObserver, DataChannelState,
    HandleRegistry, IceCandidate, IceCandidateError, IceConnectionState, IceGatheringState,
    PeerConnectionObserver, PeerConnectionState, RtcError, RtpReceiver, SessionDescription,
    SignalingState, StatsReport, TrackEvent,
};
use tracing::trace;

use crate::error::c_string;

/// Caller context, passed back untouched
#[derive(Debug, Clone, Copy)]
pub struct UserData(pub *mut c_void);

// The library never dereferences the pointer; thread-safety of whatever it
// points to is the caller's contract.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

pub type RtcStateCallback = extern "C" fn(user_data: *mut c_void, state: i32);
pub type RtcHandleCallback = extern "C" fn(user_data: *mut c_void, handle: u64);
pub type RtcFailureCallback = extern "C" fn(user_data: *mut c_void, error: *const c_char);
pub type RtcSuccessCallback = extern "C" fn(user_data: *mut c_void);

/// Peer connection notifications, delivered on the signaling thread.
///
/// State values are the declaration order of the bridge enums
/// (`SignalingState::Stable` = 0, ...).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcPeerObserver {
    pub on_signaling_change: Option<RtcStateCallback>,
    /// Ice candidate handle
    pub on_ice_candidate: Option<RtcHandleCallback>,
    /// Data channel handle for a channel opened by the remote side
    pub on_data_channel: Option<RtcHandleCallback>,
    /// Transceiver handle, receiver handle, stream ids as a JSON array
    pub on_track: Option<
        extern "C" fn(user_data: *mut c_void, transceiver: u64, receiver: u64, streams: *const c_char),
    >,
    pub on_connection_change: Option<RtcStateCallback>,
    pub on_ice_candidate_error: Option<
        extern "C" fn(
            user_data: *mut c_void,
            address: *const c_char,
            port: i32,
            url: *const c_char,
            error_code: i32,
            error_text: *const c_char,
        ),
    >,
    pub on_ice_connection_change: Option<RtcStateCallback>,
    pub on_ice_gathering_change: Option<RtcStateCallback>,
    pub on_renegotiation_needed: Option<RtcSuccessCallback>,
    /// Receiver handle of the removed track
    pub on_remove_track: Option<RtcHandleCallback>,
}

/// Data channel notifications, delivered on the network thread
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcDataChannelObserver {
    pub on_state_change: Option<RtcStateCallback>,
    pub on_message:
        Option<extern "C" fn(user_data: *mut c_void, data: *const u8, len: usize, binary: bool)>,
    pub on_buffered_amount_change: Option<extern "C" fn(user_data: *mut c_void, amount: u64)>,
}

/// Result of `create_offer` / `create_answer`; success carries a new
/// session description handle
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcCreateSdpObserver {
    pub on_success: Option<RtcHandleCallback>,
    pub on_failure: Option<RtcFailureCallback>,
}

/// Result of an operation with no payload (set description, add candidate,
/// send)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcCompletionObserver {
    pub on_success: Option<RtcSuccessCallback>,
    pub on_failure: Option<RtcFailureCallback>,
}

pub type RtcSetSdpObserver = RtcCompletionObserver;

/// Stats report as a JSON document
pub type RtcStatsCallback = extern "C" fn(user_data: *mut c_void, json: *const c_char);

fn fail(on_failure: Option<RtcFailureCallback>, user_data: UserData, err: &RtcError) {
    if let Some(callback) = on_failure {
        let wire = c_string(err.to_wire());
        callback(user_data.0, wire.as_ptr());
    }
}

impl RtcCreateSdpObserver {
    /// Completion that registers the description and reports its handle
    pub(crate) fn into_completion(
        self,
        handles: Arc<HandleRegistry>,
        user_data: UserData,
    ) -> Completion<SessionDescription> {
        Completion::new("ffi_create_sdp", move |result: CompletionResult<SessionDescription>| {
            match result {
                Ok(desc) => {
                    let handle = handles.create(Arc::new(desc));
                    match self.on_success {
                        Some(callback) => callback(user_data.0, handle.as_raw()),
                        None => {
                            handles.release(handle);
                        }
                    }
                }
                Err(err) => fail(self.on_failure, user_data, &err),
            }
        })
    }

    pub(crate) fn fail_now(self, user_data: UserData, err: &RtcError) {
        fail(self.on_failure, user_data, err);
    }
}

impl RtcCompletionObserver {
    pub(crate) fn into_completion(self, operation: &'static str, user_data: UserData) -> Completion<()> {
        Completion::new(operation, move |result: CompletionResult<()>| match result {
            Ok(()) => {
                if let Some(callback) = self.on_success {
                    callback(user_data.0);
                }
            }
            Err(err) => fail(self.on_failure, user_data, &err),
        })
    }

    /// Report a failure that happened before any completion existed
    pub(crate) fn fail_now(self, user_data: UserData, err: &RtcError) {
        fail(self.on_failure, user_data, err);
    }
}

/// Deliver a stats report to the foreign callback
pub(crate) fn deliver_stats(callback: RtcStatsCallback, user_data: UserData, report: StatsReport) {
    let json = c_string(report.into_json());
    callback(user_data.0, json.as_ptr());
}

// ----------------------------------------------------------------------------
// Adapters
// ----------------------------------------------------------------------------

pub(crate) struct ForeignPeerObserver {
    table: RtcPeerObserver,
    user_data: UserData,
    handles: Arc<HandleRegistry>,
}

impl ForeignPeerObserver {
    pub(crate) fn new(table: RtcPeerObserver, user_data: UserData, handles: Arc<HandleRegistry>) -> Self {
        Self {
            table,
            user_data,
            handles,
        }
    }

    fn state(&self, callback: Option<RtcStateCallback>, state: i32) {
        if let Some(callback) = callback {
            callback(self.user_data.0, state);
        }
    }
}

impl PeerConnectionObserver for ForeignPeerObserver {
    fn on_signaling_change(&self, state: SignalingState) {
        self.state(self.table.on_signaling_change, state as i32);
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        if let Some(callback) = self.table.on_ice_candidate {
            let handle = self.handles.create(Arc::new(candidate));
            callback(self.user_data.0, handle.as_raw());
        }
    }

    fn on_data_channel(&self, channel: Arc<DataChannel>) {
        match self.table.on_data_channel {
            Some(callback) => {
                let handle = self.handles.create(channel);
                callback(self.user_data.0, handle.as_raw());
            }
            None => trace!(label = %channel.label(), "remote data channel not forwarded"),
        }
    }

    fn on_track(&self, event: TrackEvent) {
        let Some(callback) = self.table.on_track else {
            return;
        };
        let streams = serde_json::to_string(&event.streams).unwrap_or_else(|_| "[]".to_string());
        let streams = c_string(streams);
        let transceiver = self.handles.create(event.transceiver);
        let receiver = self.handles.create(event.receiver);
        callback(
            self.user_data.0,
            transceiver.as_raw(),
            receiver.as_raw(),
            streams.as_ptr(),
        );
    }

    fn on_remove_track(&self, receiver: Arc<RtpReceiver>) {
        if let Some(callback) = self.table.on_remove_track {
            let handle = self.handles.create(receiver);
            callback(self.user_data.0, handle.as_raw());
        }
    }

    fn on_connection_change(&self, state: PeerConnectionState) {
        self.state(self.table.on_connection_change, state as i32);
    }

    fn on_ice_candidate_error(&self, error: IceCandidateError) {
        if let Some(callback) = self.table.on_ice_candidate_error {
            let address = c_string(error.address);
            let url = c_string(error.url);
            let text = c_string(error.error_text);
            callback(
                self.user_data.0,
                address.as_ptr(),
                error.port,
                url.as_ptr(),
                error.error_code,
                text.as_ptr(),
            );
        }
    }

    fn on_ice_connection_change(&self, state: IceConnectionState) {
        self.state(self.table.on_ice_connection_change, state as i32);
    }

    fn on_ice_gathering_change(&self, state: IceGatheringState) {
        self.state(self.table.on_ice_gathering_change, state as i32);
    }

    fn on_renegotiation_needed(&self) {
        if let Some(callback) = self.table.on_renegotiation_needed {
            callback(self.user_data.0);
        }
    }
}

pub(crate) struct ForeignChannelObserver {
    table: RtcDataChannelObserver,
    user_data: UserData,
}

impl ForeignChannelObserver {
    pub(crate) fn new(table: RtcDataChannelObserver, user_data: UserData) -> Self {
        Self { table, user_data }
    }
}

impl DataChannelObserver for ForeignChannelObserver {
    fn on_state_change(&self, state: DataChannelState) {
        if let Some(callback) = self.table.on_state_change {
            callback(self.user_data.0, state as i32);
        }
    }

    fn on_message(&self, buffer: DataBuffer<'_>) {
        if let Some(callback) = self.table.on_message {
            callback(
                self.user_data.0,
                buffer.data.as_ptr(),
                buffer.data.len(),
                buffer.binary,
            );
        }
    }

    fn on_buffered_amount_change(&self, buffered_amount: u64) {
        if let Some(callback) = self.table.on_buffered_amount_change {
            callback(self.user_data.0, buffered_amount);
        }
    }
}
