//! Data channel entry points

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use remotemedia_rtc_bridge::DataChannel;

use crate::api::{bridge_ref, call, guard, handle, RtcBridge};
use crate::callbacks::{ForeignChannelObserver, RtcCompletionObserver, RtcDataChannelObserver, UserData};
use crate::error::{c_string, FfiError};

/// Attach an observer table, replacing any previous one.
///
/// # Safety
/// `bridge` is a live bridge pointer; `observer` points to a valid table;
/// `error_out` is null or valid for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_register_observer(
    bridge: *const RtcBridge,
    channel: u64,
    observer: *const RtcDataChannelObserver,
    user_data: *mut c_void,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_data_channel_register_observer", error_out, false, || {
        let bridge = bridge_ref(bridge)?;
        let table = *observer.as_ref().ok_or(FfiError::NullPointer("observer"))?;
        let observer = Arc::new(ForeignChannelObserver::new(table, UserData(user_data)));
        bridge.register_data_channel_observer(handle(channel)?, observer)?;
        Ok(true)
    })
}

/// Detach the observer. Once this returns no callback of the old table is
/// running or will run. May be called from inside one of its callbacks.
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_unregister_observer(
    bridge: *const RtcBridge,
    channel: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_data_channel_unregister_observer", error_out, false, || {
        bridge_ref(bridge)?.unregister_data_channel_observer(handle(channel)?)?;
        Ok(true)
    })
}

/// Queue `len` bytes for sending. The bytes are copied before this returns.
/// `observer` fires exactly once.
///
/// # Safety
/// `bridge` is null or a live bridge pointer; `data` is valid for `len`
/// bytes (it may be null when `len` is 0).
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_send_async(
    bridge: *const RtcBridge,
    channel: u64,
    data: *const u8,
    len: usize,
    binary: bool,
    observer: RtcCompletionObserver,
    user_data: *mut c_void,
) {
    let user_data = UserData(user_data);
    let bridge = match bridge_ref(bridge) {
        Ok(bridge) => bridge,
        Err(err) => return observer.fail_now(user_data, &err.to_rtc_error()),
    };
    let done = observer.into_completion("rtc_data_channel_send_async", user_data);
    guard("rtc_data_channel_send_async", move || {
        let payload: &[u8] = if len == 0 {
            &[]
        } else if data.is_null() {
            return done.fail(FfiError::NullPointer("data").to_rtc_error());
        } else {
            std::slice::from_raw_parts(data, len)
        };
        match handle(channel) {
            Ok(channel) => bridge.send_async(channel, payload, binary, done),
            Err(err) => done.fail(err.to_rtc_error()),
        }
    });
}

/// `DataChannelState` ordinal (0 connecting, 1 open, 2 closing, 3 closed),
/// `-1` for an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_state(bridge: *const RtcBridge, channel: u64) -> i32 {
    call("rtc_data_channel_state", std::ptr::null_mut(), -1, || {
        Ok(bridge_ref(bridge)?.data_channel_state(handle(channel)?)? as i32)
    })
}

/// Bytes queued but not yet sent; 0 for an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_buffered_amount(
    bridge: *const RtcBridge,
    channel: u64,
) -> u64 {
    call("rtc_data_channel_buffered_amount", std::ptr::null_mut(), 0, || {
        Ok(bridge_ref(bridge)?.buffered_amount(handle(channel)?)?)
    })
}

/// Channel label; free with `rtc_string_free`. Null on failure.
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_label(
    bridge: *const RtcBridge,
    channel: u64,
    error_out: *mut *mut c_char,
) -> *mut c_char {
    call("rtc_data_channel_label", error_out, std::ptr::null_mut(), || {
        let channel = bridge_ref(bridge)?.resolve::<DataChannel>(handle(channel)?)?;
        Ok(c_string(channel.label()).into_raw())
    })
}

/// Stream id, `-1` when not yet assigned or for an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_id(bridge: *const RtcBridge, channel: u64) -> i32 {
    call("rtc_data_channel_id", std::ptr::null_mut(), -1, || {
        let channel = bridge_ref(bridge)?.resolve::<DataChannel>(handle(channel)?)?;
        Ok(channel.id().map_or(-1, i32::from))
    })
}

/// Start closing; the state change is reported to the observer
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_data_channel_close(
    bridge: *const RtcBridge,
    channel: u64,
    error_out: *mut *mut c_char,
) -> bool {
    call("rtc_data_channel_close", error_out, false, || {
        bridge_ref(bridge)?.close_data_channel(handle(channel)?)?;
        Ok(true)
    })
}
