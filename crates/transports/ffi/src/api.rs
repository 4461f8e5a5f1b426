//! Bridge lifecycle, handles, strings and JSEP objects
//!
//! Conventions shared by every `rtc_*` function:
//! - `bridge` is the pointer returned by [`rtc_bridge_create`]
//! - handles are non-zero `u64`s; `0` means "no object" or failure
//! - `error_out`, when non-null, receives a wire-encoded error on failure and
//!   null on success; free it with [`rtc_string_free`]
//! - strings returned by the library are freed with [`rtc_string_free`]
//! - no panic unwinds into the caller

use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};

use remotemedia_rtc_bridge::{
    Bridge, BridgeConfig, Handle, IceCandidate, SdpType, SessionDescription,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::{c_string, report, reset, FfiError, FfiResult};

/// Opaque bridge instance owned by the caller
pub struct RtcBridge {
    pub(crate) inner: Bridge,
}

// ----------------------------------------------------------------------------
// Shared argument plumbing
// ----------------------------------------------------------------------------

/// Run a synchronous entry point: clears `error_out`, catches panics, and
/// reports failures through `error_out` while returning `fallback`.
pub(crate) fn call<T>(
    name: &'static str,
    error_out: *mut *mut c_char,
    fallback: T,
    f: impl FnOnce() -> FfiResult<T>,
) -> T {
    unsafe { reset(error_out) };
    let outcome = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(function = name, "panic caught at FFI boundary");
        Err(FfiError::Panic(name))
    });
    match outcome {
        Ok(value) => value,
        Err(err) => {
            unsafe { report(error_out, &err) };
            fallback
        }
    }
}

/// Run an entry point whose failures are delivered through callbacks
pub(crate) fn guard(name: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(function = name, "panic caught at FFI boundary");
    }
}

pub(crate) unsafe fn bridge_ref<'a>(bridge: *const RtcBridge) -> FfiResult<&'a Bridge> {
    bridge
        .as_ref()
        .map(|bridge| &bridge.inner)
        .ok_or(FfiError::NullPointer("bridge"))
}

pub(crate) unsafe fn read_str<'a>(ptr: *const c_char, what: &'static str) -> FfiResult<&'a str> {
    if ptr.is_null() {
        return Err(FfiError::NullPointer(what));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| FfiError::InvalidUtf8(what))
}

pub(crate) unsafe fn read_opt_str<'a>(
    ptr: *const c_char,
    what: &'static str,
) -> FfiResult<Option<&'a str>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        read_str(ptr, what).map(Some)
    }
}

pub(crate) fn handle(raw: u64) -> FfiResult<Handle> {
    Handle::from_raw(raw).ok_or(FfiError::NullHandle)
}

pub(crate) fn sdp_type_from(value: i32) -> FfiResult<SdpType> {
    match value {
        0 => Ok(SdpType::Offer),
        1 => Ok(SdpType::PrAnswer),
        2 => Ok(SdpType::Answer),
        3 => Ok(SdpType::Rollback),
        value => Err(FfiError::UnknownEnum {
            what: "sdp type",
            value,
        }),
    }
}

// ----------------------------------------------------------------------------
// Library
// ----------------------------------------------------------------------------

/// Library version, a static NUL-terminated string
#[no_mangle]
pub extern "C" fn rtc_bridge_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr().cast()
}

/// Install a global tracing subscriber.
///
/// `filter` may be null (defaults to `info`); `RUST_LOG` wins when set.
/// With `json` set, events are written as JSON lines. Returns `false` if a
/// subscriber was already installed.
///
/// # Safety
/// `filter` is null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn rtc_init_logging(filter: *const c_char, json: bool) -> bool {
    let filter = match read_opt_str(filter, "filter") {
        Ok(filter) => filter.unwrap_or("info").to_string(),
        Err(_) => return false,
    };
    if !json {
        return remotemedia_rtc_bridge::init_tracing(&filter);
    }
    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter)),
        )
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if installed {
        info!(version = remotemedia_rtc_bridge::version(), "RTC bridge JSON logging initialized");
    }
    installed
}

/// Free a string returned by this library. Null is ignored.
///
/// # Safety
/// `s` is null or a pointer previously returned by this library and not yet
/// freed.
#[no_mangle]
pub unsafe extern "C" fn rtc_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(std::ffi::CString::from_raw(s));
    }
}

// ----------------------------------------------------------------------------
// Bridge lifecycle
// ----------------------------------------------------------------------------

/// Start a bridge. `config_json` is a `BridgeConfig` document or null for
/// the defaults (plus `RTC_BRIDGE_*` environment overrides).
///
/// Returns null on failure.
///
/// # Safety
/// `config_json` is null or a valid NUL-terminated string; `error_out` is
/// null or valid for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_bridge_create(
    config_json: *const c_char,
    error_out: *mut *mut c_char,
) -> *mut RtcBridge {
    call("rtc_bridge_create", error_out, std::ptr::null_mut(), || {
        let config = match read_opt_str(config_json, "config_json")? {
            Some(json) => BridgeConfig::from_json(json)?,
            None => BridgeConfig::from_env()?,
        };
        #[cfg(feature = "webrtc-rs")]
        let inner = Bridge::webrtc(config)?;
        #[cfg(not(feature = "webrtc-rs"))]
        let inner = Bridge::loopback(config)?;
        Ok(Box::into_raw(Box::new(RtcBridge { inner })))
    })
}

/// Release every handle, stop the engine threads and free the bridge.
///
/// Pending completions fire their failure callbacks before this returns.
///
/// # Safety
/// `bridge` is null or a pointer from [`rtc_bridge_create`] not yet disposed;
/// no other call on it may be in progress or follow.
#[no_mangle]
pub unsafe extern "C" fn rtc_bridge_dispose(bridge: *mut RtcBridge) {
    if bridge.is_null() {
        return;
    }
    let bridge = Box::from_raw(bridge);
    guard("rtc_bridge_dispose", move || {
        bridge.inner.shutdown();
        drop(bridge);
    });
}

/// Drop the caller's reference behind `handle`. Unknown handles are a no-op.
///
/// Returns whether the handle was live.
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_handle_release(bridge: *const RtcBridge, handle: u64) -> bool {
    call("rtc_handle_release", std::ptr::null_mut(), false, || {
        let bridge = bridge_ref(bridge)?;
        Ok(Handle::from_raw(handle).is_some_and(|handle| bridge.release(handle)))
    })
}

// ----------------------------------------------------------------------------
// Session descriptions
// ----------------------------------------------------------------------------

/// `sdp_type`: 0 offer, 1 pranswer, 2 answer, 3 rollback
///
/// # Safety
/// `bridge` is a live bridge pointer; `sdp` is a valid NUL-terminated
/// string; `error_out` is null or valid for one pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_session_description_create(
    bridge: *const RtcBridge,
    sdp_type: i32,
    sdp: *const c_char,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_session_description_create", error_out, 0, || {
        let bridge = bridge_ref(bridge)?;
        let sdp_type = sdp_type_from(sdp_type)?;
        let sdp = read_str(sdp, "sdp")?;
        Ok(bridge.create_session_description(sdp_type, sdp)?.as_raw())
    })
}

/// Type of a description (see [`rtc_session_description_create`]), `-1` for
/// an invalid handle
///
/// # Safety
/// `bridge` is a live bridge pointer.
#[no_mangle]
pub unsafe extern "C" fn rtc_session_description_type(bridge: *const RtcBridge, desc: u64) -> i32 {
    call("rtc_session_description_type", std::ptr::null_mut(), -1, || {
        let desc = bridge_ref(bridge)?.resolve::<SessionDescription>(handle(desc)?)?;
        Ok(desc.sdp_type() as i32)
    })
}

/// SDP text of a description; null on failure
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_session_description_sdp(
    bridge: *const RtcBridge,
    desc: u64,
    error_out: *mut *mut c_char,
) -> *mut c_char {
    call(
        "rtc_session_description_sdp",
        error_out,
        std::ptr::null_mut(),
        || {
            let desc = bridge_ref(bridge)?.resolve::<SessionDescription>(handle(desc)?)?;
            Ok(c_string(desc.sdp()).into_raw())
        },
    )
}

// ----------------------------------------------------------------------------
// ICE candidates
// ----------------------------------------------------------------------------

/// # Safety
/// `bridge` is a live bridge pointer; `sdp_mid` and `candidate` are valid
/// NUL-terminated strings; `error_out` is null or valid for one pointer
/// write.
#[no_mangle]
pub unsafe extern "C" fn rtc_ice_candidate_create(
    bridge: *const RtcBridge,
    sdp_mid: *const c_char,
    sdp_mline_index: i32,
    candidate: *const c_char,
    error_out: *mut *mut c_char,
) -> u64 {
    call("rtc_ice_candidate_create", error_out, 0, || {
        let bridge = bridge_ref(bridge)?;
        let sdp_mid = read_str(sdp_mid, "sdp_mid")?;
        let candidate = read_str(candidate, "candidate")?;
        Ok(bridge
            .create_ice_candidate(sdp_mid, sdp_mline_index, candidate)?
            .as_raw())
    })
}

/// `{"sdp_mid": ..., "sdp_mline_index": ..., "candidate": ...}`; null on
/// failure
///
/// # Safety
/// `bridge` is a live bridge pointer; `error_out` is null or valid for one
/// pointer write.
#[no_mangle]
pub unsafe extern "C" fn rtc_ice_candidate_to_json(
    bridge: *const RtcBridge,
    candidate: u64,
    error_out: *mut *mut c_char,
) -> *mut c_char {
    call(
        "rtc_ice_candidate_to_json",
        error_out,
        std::ptr::null_mut(),
        || {
            let candidate = bridge_ref(bridge)?.resolve::<IceCandidate>(handle(candidate)?)?;
            let json = serde_json::to_string(candidate.as_ref())
                .map_err(|err| FfiError::json("candidate", err))?;
            Ok(c_string(json).into_raw())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotemedia_rtc_bridge::{RtcError, RtcErrorKind};
    use std::ffi::CString;
    use std::ptr;

    pub(crate) fn take_error(error: *mut c_char) -> RtcError {
        assert!(!error.is_null(), "expected an error");
        let wire = unsafe { CStr::from_ptr(error) }.to_str().unwrap().to_string();
        unsafe { rtc_string_free(error) };
        RtcError::from_wire(&wire).unwrap()
    }

    #[test]
    fn test_version_is_nul_terminated() {
        let version = unsafe { CStr::from_ptr(rtc_bridge_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_create_with_bad_config_reports_error() {
        let json = CString::new(r#"{"max_message_size": 0}"#).unwrap();
        let mut error = ptr::null_mut();
        let bridge = unsafe { rtc_bridge_create(json.as_ptr(), &mut error) };
        assert!(bridge.is_null());
        assert_eq!(take_error(error).kind(), RtcErrorKind::InvalidParameter);
    }

    #[test]
    fn test_description_round_trip() {
        let mut error = ptr::null_mut();
        let bridge = unsafe { rtc_bridge_create(ptr::null(), &mut error) };
        assert!(!bridge.is_null());
        assert!(error.is_null());

        let sdp = CString::new("v=0\r\ns=-\r\n").unwrap();
        let desc = unsafe { rtc_session_description_create(bridge, 2, sdp.as_ptr(), &mut error) };
        assert_ne!(desc, 0);
        assert_eq!(unsafe { rtc_session_description_type(bridge, desc) }, 2);

        let text = unsafe { rtc_session_description_sdp(bridge, desc, &mut error) };
        assert_eq!(unsafe { CStr::from_ptr(text) }.to_str().unwrap(), "v=0\r\ns=-\r\n");
        unsafe { rtc_string_free(text) };

        assert!(unsafe { rtc_handle_release(bridge, desc) });
        assert!(!unsafe { rtc_handle_release(bridge, desc) });
        assert_eq!(unsafe { rtc_session_description_type(bridge, desc) }, -1);

        let bad = unsafe { rtc_session_description_create(bridge, 7, sdp.as_ptr(), &mut error) };
        assert_eq!(bad, 0);
        assert_eq!(take_error(error).kind(), RtcErrorKind::InvalidParameter);

        unsafe { rtc_bridge_dispose(bridge) };
    }

    #[test]
    fn test_candidate_json_and_syntax_error() {
        let bridge = unsafe { rtc_bridge_create(ptr::null(), ptr::null_mut()) };
        let mid = CString::new("0").unwrap();
        let line = CString::new("candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host").unwrap();
        let mut error = ptr::null_mut();

        let candidate =
            unsafe { rtc_ice_candidate_create(bridge, mid.as_ptr(), 0, line.as_ptr(), &mut error) };
        assert_ne!(candidate, 0);
        let json = unsafe { rtc_ice_candidate_to_json(bridge, candidate, &mut error) };
        let value: serde_json::Value =
            serde_json::from_str(unsafe { CStr::from_ptr(json) }.to_str().unwrap()).unwrap();
        assert_eq!(value["sdp_mid"], "0");
        unsafe { rtc_string_free(json) };

        let garbage = CString::new("not a candidate").unwrap();
        let bad =
            unsafe { rtc_ice_candidate_create(bridge, mid.as_ptr(), 0, garbage.as_ptr(), &mut error) };
        assert_eq!(bad, 0);
        assert_eq!(take_error(error).kind(), RtcErrorKind::SyntaxError);

        unsafe { rtc_bridge_dispose(bridge) };
    }

    #[test]
    fn test_null_arguments_never_crash() {
        let mut error = ptr::null_mut();
        let desc = unsafe { rtc_session_description_create(ptr::null(), 0, ptr::null(), &mut error) };
        assert_eq!(desc, 0);
        assert_eq!(take_error(error).kind(), RtcErrorKind::InvalidParameter);

        assert!(!unsafe { rtc_handle_release(ptr::null(), 1) });
        unsafe { rtc_bridge_dispose(ptr::null_mut()) };
        unsafe { rtc_string_free(ptr::null_mut()) };
    }
}
