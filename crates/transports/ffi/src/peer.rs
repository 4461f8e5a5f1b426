//! Peer connection, transceiver and stats entry points
//!
//! Asynchronous calls (`create_offer`, `set_*_description`,
//! `add_ice_candidate`) take their observer table by value and fire exactly
//! one of its callbacks, including when the bridge pointer or a handle is
//! invalid.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use remotemedia_rtc_bridge::{
    DataChannelInit, MediaType, OfferAnswerOptions, PeerConnectionObserver, Priority,
    RtcConfiguration, RtpTransceiverInit, StatsReport, TransceiverDirection,
};

use crate::api::{bridge_ref, call, guard, handle, read_opt_str, read_str, RtcBridge};
use crate::callbacks::{
    deliver_stats, ForeignPeerObserver, RtcCompletionObserver, RtcCreateSdpObserver,
    RtcPeerObserver, RtcSetSdpObserver, RtcStatsCallback, UserData,
};
use crate::error::{FfiError, FfiResult};

/// `offer_to_receive_*`: negative leaves the engine default, 0 false,
/// positive true
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RtcOfferAnswerOptions {
    pub ice_restart: bool,
    pub use_rtp_mux: bool,
    pub offer_to_receive_audio: i32,
    pub offer_to_receive_video: i32,
    pub voice_activity_detection: bool,
}

impl From<&RtcOfferAnswerOptions> for OfferAnswerOptions {
    fn from(options: &RtcOfferAnswerOptions) -> Self {
        let tristate = |value: i32| (value >= 0).then_some(value > 0);
        Self {
            ice_restart: options.ice_restart,
            use_rtp_mux: options.use_rtp_mux,
            offer_to_receive_audio: tristate(options.offer_to_receive_audio),
            offer_to_receive_video: tristate(options.offer_to_receive_video),
            voice_activity_detection: options.voice_activity_detection,
        }
    }
}

/// Data channel parameters. Each optional value is only read when its
/// `has_*` flag is set.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RtcDataChannelInit {
    pub ordered: bool,
    pub reliable: bool,
    pub negotiated: bool,
    pub has_id: bool,
    pub id: u16,
    pub has_max_retransmits: bool,
    pub max_retransmits: u16,
    pub has_max_retransmit_time: bool,
    /// Milliseconds
    pub max_retransmit_time: u16,
    pub has_priority: bool,
    /// 0 very low, 1 low, 2 medium, 3 high
    pub priority: i32,
    /// Nullable
    pub protocol: *const c_char,
}

impl RtcDataChannelInit {
    unsafe fn to_init(&self) -> FfiResult<DataChannelInit> {
        let priority = if self.has_priority {
            Some(priority_from(self.priority)?)
        } else {
            None
        };
        Ok(DataChannelInit {
            id: self.has_id.then_some(self.id),
            negotiated: self.negotiated,
            ordered: self.ordered,
            protocol: read_opt_str(self.protocol, "protocol")?
                .unwrap_or_default()
                .to_string(),
            reliable: self.reliable,
            max_retransmit_time: self
                .has_max_retransmit_time
                .then_some(self.max_retransmit_time),
            max_retransmits: self.has_max_retransmits.then_some(self.max_retransmits),
            priority,
        })
    }
}

fn priority_from(value: i32) -> FfiResult<Priority> {
    match value {
        0 => Ok(Priority::VeryLow),
        1 => Ok(Priority::Low),
        2 => Ok(Priority::Medium),
        3 => Ok(Priority::High),
        value => Err(FfiError::UnknownEnum {
            what: "priority",
            value,
        }),
    }
}

fn media_type_from(value: i32) -> FfiResult<MediaType> {
    match value {
        0 => Ok(MediaType::Audio),
        1 => Ok(MediaType::Video),
        value => Err(FfiError::UnknownEnum {
            what: "media type",
            value,
        }),
    }
}

fn direction_from(value: i32) -> FfiResult<TransceiverDirection> {
    match value {
        0 => Ok(TransceiverDirection::SendRecv),
        1 => Ok(TransceiverDirection::SendOnly),
        2 => Ok(TransceiverDirection::RecvOnly),
        3 => Ok(TransceiverDirection::Inactive),
        value => Err(FfiError::UnknownEnum {
            what: "transceiver direction",
            value,
        }),
    }
}

unsafe fn read_config(config_json: *const c_char) -> FfiResult<RtcConfiguration> {
    match read_opt_str(config_json, "config_json")? {
        Some(json) => Ok(RtcConfiguration::from_json(json)?),
        None => Ok(RtcConfiguration::default()),
    }
}

// ----------------------------------------------------------------------------
// Lifecycle and observers
// ----------------------------------------------------------------------------

/// Create a peer connection. `config_json` (an `RtcConfiguration` document)
/// and `observer` may be null. Returns 0 on failure.
///
/// # Safety
/// `bridge` is a live bridge pointer; `config_json` is null or a valid
/// NUL-terminated string; `observer` is null or points to a valid table;
/// `error_out` is null or valid for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_create(
    bridge: *const RtcBridge,
    config_json: *const c_char,
    observer: *const RtcPeerObserver,
    user_data: *mut c_void,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_peer_connection_create", error_out, 0, || {
        let bridge = bridge_ref(bridge)?;
        let config = read_config(config_json)?;
        let observer = observer.as_ref().map(|table| {
            Arc::new(ForeignPeerObserver::new(
                *table,
                UserData(user_data),
                bridge.handles().clone(),
            )) as Arc<dyn PeerConnectionObserver>
        });
        Ok(bridge.create_peer_connection(&config, observer)?.as_raw())
    })
}

/// Replace the observer table. Returns `false` on failure.
///
/// # Safety
/// As [`rtc_peer_connection_create`]; `observer` must not be null.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_register_observer(
    bridge: *const RtcBridge,
    peer: u64,
    observer: *const RtcPeerObserver,
    user_data: *mut c_void,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_peer_connection_register_observer", error_out, false, || {
        let bridge = bridge_ref(bridge)?;
        let table = *observer.as_ref().ok_or(FfiError::NullPointer("observer"))?;
        let observer = Arc::new(ForeignPeerObserver::new(
            table,
            UserData(user_data),
            bridge.handles().clone(),
        ));
        bridge.register_peer_observer(handle(peer)?, observer)?;
        Ok(true)
    })
}

/// Detach the observer. Once this returns no callback of the old table is
/// running or will run, so `user_data` may be freed.
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_unregister_observer(
    bridge: *const RtcBridge,
    peer: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_peer_connection_unregister_observer", error_out, false, || {
        bridge_ref(bridge)?.unregister_peer_observer(handle(peer)?)?;
        Ok(true)
    })
}

/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_close(
    bridge: *const RtcBridge,
    peer: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_peer_connection_close", error_out, false, || {
        bridge_ref(bridge)?.close_peer_connection(handle(peer)?)?;
        Ok(true)
    })
}

// ----------------------------------------------------------------------------
// Offer / answer
// ----------------------------------------------------------------------------

unsafe fn create_sdp(
    name: &'static str,
    bridge: *const RtcBridge,
    peer: u64,
    options: *const RtcOfferAnswerOptions,
    observer: RtcCreateSdpObserver,
    user_data: UserData,
    answer: bool,
) {
    let bridge = match bridge_ref(bridge) {
        Ok(bridge) => bridge,
        Err(err) => return observer.fail_now(user_data, &err.to_rtc_error()),
    };
    let done = observer.into_completion(bridge.handles().clone(), user_data);
    guard(name, move || {
        let options = options.as_ref().map(OfferAnswerOptions::from).unwrap_or_default();
        match handle(peer) {
            Ok(peer) if answer => bridge.create_answer(peer, &options, done),
            Ok(peer) => bridge.create_offer(peer, &options, done),
            Err(err) => done.fail(err.to_rtc_error()),
        }
    });
}

/// On success `observer.on_success` receives a new session description
/// handle. `options` may be null.
///
/// # Safety
/// `bridge` is null or a live bridge pointer; `options` is null or points to
/// a valid struct.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_create_offer(
    bridge: *const RtcBridge,
    peer: u64,
    options: *const RtcOfferAnswerOptions,
    observer: RtcCreateSdpObserver,
    user_data: *mut c_void,
) {
    create_sdp(
        "rtc_peer_connection_create_offer",
        bridge,
        peer,
        options,
        observer,
        UserData(user_data),
        false,
    );
}

/// # Safety
/// As [`rtc_peer_connection_create_offer`].
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_create_answer(
    bridge: *const RtcBridge,
    peer: u64,
    options: *const RtcOfferAnswerOptions,
    observer: RtcCreateSdpObserver,
    user_data: *mut c_void,
) {
    create_sdp(
        "rtc_peer_connection_create_answer",
        bridge,
        peer,
        options,
        observer,
        UserData(user_data),
        true,
    );
}

#[derive(Clone, Copy)]
enum Apply {
    Local,
    Remote,
    Candidate,
}

unsafe fn apply(
    name: &'static str,
    bridge: *const RtcBridge,
    peer: u64,
    object: u64,
    observer: RtcCompletionObserver,
    user_data: UserData,
    what: Apply,
) {
    let bridge = match bridge_ref(bridge) {
        Ok(bridge) => bridge,
        Err(err) => return observer.fail_now(user_data, &err.to_rtc_error()),
    };
    let done = observer.into_completion(name, user_data);
    guard(name, move || {
        let (peer, object) = match handle(peer).and_then(|peer| Ok((peer, handle(object)?))) {
            Ok(pair) => pair,
            Err(err) => return done.fail(err.to_rtc_error()),
        };
        match what {
            Apply::Local => bridge.set_local_description(peer, object, done),
            Apply::Remote => bridge.set_remote_description(peer, object, done),
            Apply::Candidate => bridge.add_ice_candidate(peer, object, done),
        }
    });
}

/// The description handle stays owned by the caller.
///
/// # Safety
/// `bridge` is null or a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_set_local_description(
    bridge: *const RtcBridge,
    peer: u64,
    desc: u64,
    observer: RtcSetSdpObserver,
    user_data: *mut c_void,
) {
    apply(
        "rtc_peer_connection_set_local_description",
        bridge,
        peer,
        desc,
        observer,
        UserData(user_data),
        Apply::Local,
    );
}

/// # Safety
/// `bridge` is null or a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_set_remote_description(
    bridge: *const RtcBridge,
    peer: u64,
    desc: u64,
    observer: RtcSetSdpObserver,
    user_data: *mut c_void,
) {
    apply(
        "rtc_peer_connection_set_remote_description",
        bridge,
        peer,
        desc,
        observer,
        UserData(user_data),
        Apply::Remote,
    );
}

/// # Safety
/// `bridge` is null or a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_add_ice_candidate(
    bridge: *const RtcBridge,
    peer: u64,
    candidate: u64,
    observer: RtcCompletionObserver,
    user_data: *mut c_void,
) {
    apply(
        "rtc_peer_connection_add_ice_candidate",
        bridge,
        peer,
        candidate,
        observer,
        UserData(user_data),
        Apply::Candidate,
    );
}

// ----------------------------------------------------------------------------
// Channels and transceivers
// ----------------------------------------------------------------------------

/// `init` may be null for a reliable ordered channel. Returns 0 on failure.
///
/// # Safety
/// `bridge` is a live bridge pointer; `label` is a valid NUL-terminated
/// string; `init` is null or points to a valid struct; `error_out` is null
/// or valid for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_create_data_channel(
    bridge: *const RtcBridge,
    peer: u64,
    label: *const c_char,
    init: *const RtcDataChannelInit,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_peer_connection_create_data_channel", error_out, 0, || {
        let bridge = bridge_ref(bridge)?;
        let label = read_str(label, "label")?;
        let init = match init.as_ref() {
            Some(init) => init.to_init()?,
            None => DataChannelInit::default(),
        };
        Ok(bridge
            .create_data_channel(handle(peer)?, label, &init)?
            .as_raw())
    })
}

/// `media_type`: 0 audio, 1 video. `direction`: 0 sendrecv, 1 sendonly,
/// 2 recvonly, 3 inactive. `stream_ids_json` is a JSON array of strings or
/// null.
///
/// # Safety
/// `bridge` is a live bridge pointer; `stream_ids_json` is null or a valid
/// NUL-terminated string; `error_out` is null or valid for one pointer
/// write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_add_transceiver(
    bridge: *const RtcBridge,
    peer: u64,
    media_type: i32,
    direction: i32,
    stream_ids_json: *const c_char,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_peer_connection_add_transceiver", error_out, 0, || {
        let bridge = bridge_ref(bridge)?;
        let media_type = media_type_from(media_type)?;
        let stream_ids = match read_opt_str(stream_ids_json, "stream_ids_json")? {
            Some(json) => serde_json::from_str::<Vec<String>>(json)
                .map_err(|err| FfiError::json("stream_ids_json", err))?,
            None => Vec::new(),
        };
        let init = RtpTransceiverInit {
            direction: direction_from(direction)?,
            stream_ids,
        };
        Ok(bridge
            .add_transceiver(handle(peer)?, media_type, &init)?
            .as_raw())
    })
}

/// Sender of a transceiver as a new handle
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_transceiver_sender(
    bridge: *const RtcBridge,
    transceiver: u64,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_transceiver_sender", error_out, 0, || {
        Ok(bridge_ref(bridge)?
            .transceiver_sender(handle(transceiver)?)?
            .as_raw())
    })
}

/// # Safety
/// As [`rtc_transceiver_sender`].
#[no_mangle]
pub unsafe extern "C" fn rtc_transceiver_receiver(
    bridge: *const RtcBridge,
    transceiver: u64,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_transceiver_receiver", error_out, 0, || {
        Ok(bridge_ref(bridge)?
            .transceiver_receiver(handle(transceiver)?)?
            .as_raw())
    })
}

/// # Safety
/// As [`rtc_transceiver_sender`].
#[no_mangle]
pub unsafe extern "C" fn rtc_transceiver_stop(
    bridge: *const RtcBridge,
    transceiver: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_transceiver_stop", error_out, false, || {
        bridge_ref(bridge)?.stop_transceiver(handle(transceiver)?)?;
        Ok(true)
    })
}

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// `SignalingState` ordinal, `-1` for an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_signaling_state(
    bridge: *const RtcBridge,
    peer: u64,
) -> i32 {
    call("rtc_peer_connection_signaling_state", std::ptr::null_mut(), -1, || {
        Ok(bridge_ref(bridge)?.signaling_state(handle(peer)?)? as i32)
    })
}

/// `PeerConnectionState` ordinal, `-1` for an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_connection_state(
    bridge: *const RtcBridge,
    peer: u64,
) -> i32 {
    call("rtc_peer_connection_connection_state", std::ptr::null_mut(), -1, || {
        Ok(bridge_ref(bridge)?.connection_state(handle(peer)?)? as i32)
    })
}

/// Current local description as a new handle; 0 when there is none or on
/// failure (check `error_out`)
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_local_description(
    bridge: *const RtcBridge,
    peer: u64,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_peer_connection_local_description", error_out, 0, || {
        let desc = bridge_ref(bridge)?.current_local_description(handle(peer)?)?;
        Ok(desc.map_or(0, |desc| desc.as_raw()))
    })
}

/// # Safety
/// As [`rtc_peer_connection_local_description`].
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_remote_description(
    bridge: *const RtcBridge,
    peer: u64,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_peer_connection_remote_description", error_out, 0, || {
        let desc = bridge_ref(bridge)?.current_remote_description(handle(peer)?)?;
        Ok(desc.map_or(0, |desc| desc.as_raw()))
    })
}

/// # Safety
/// `bridge` is a live bridge pointer; `config_json` is a valid
/// NUL-terminated string; `error_out` is null or valid for one pointer
/// write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_set_configuration(
    bridge: *const RtcBridge,
    peer: u64,
    config_json: *const c_char,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_peer_connection_set_configuration", error_out, false, || {
        let bridge = bridge_ref(bridge)?;
        let config = RtcConfiguration::from_json(read_str(config_json, "config_json")?)?;
        bridge.set_configuration(handle(peer)?, &config)?;
        Ok(true)
    })
}

/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_peer_connection_restart_ice(
    bridge: *const RtcBridge,
    peer: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_peer_connection_restart_ice", error_out, false, || {
        bridge_ref(bridge)?.restart_ice(handle(peer)?)?;
        Ok(true)
    })
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

/// Request stats for a peer connection, sender or receiver.
///
/// `callback` fires exactly once with a JSON report, even if `target` is
/// released right after this returns. On `false` the report is empty
/// (`{"stats":[]}`), it has already been delivered, and `error_out` says why.
/// A null `callback` is rejected without any delivery.
///
/// # Safety
/// `bridge` is null or a live bridge pointer; `error_out` is null or valid
/// for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_get_stats(
    bridge: *const RtcBridge,
    target: u64,
    callback: Option<RtcStatsCallback>,
    user_data: *mut c_void,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_get_stats", error_out, false, || {
        let callback = callback.ok_or(FfiError::NullPointer("callback"))?;
        let user_data = UserData(user_data);
        let resolved = bridge_ref(bridge).and_then(|bridge| Ok((bridge, handle(target)?)));
        let (bridge, target) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                deliver_stats(callback, user_data, StatsReport::empty());
                return Err(err);
            }
        };
        bridge.get_stats(target, user_data, move |user_data, report| {
            deliver_stats(callback, user_data, report)
        })?;
        Ok(true)
    })
}
