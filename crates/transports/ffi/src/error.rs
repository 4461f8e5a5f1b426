//! Error reporting across the C boundary
//!
//! Every failure leaves the library as a wire-encoded [`RtcError`] string:
//! either through an `error_out` parameter (synchronous calls) or as the
//! argument of an `on_failure` callback (asynchronous calls).

use std::ffi::{c_char, CString};

use remotemedia_rtc_bridge::{Error, RtcError, RtcErrorKind};

/// Argument validation failures detected before the bridge is reached
#[derive(Debug, thiserror::Error)]
pub enum FfiError {
    #[error("Null pointer: {0}")]
    NullPointer(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Unknown {what} value: {value}")]
    UnknownEnum { what: &'static str, value: i32 },

    #[error("Invalid JSON in {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Null handle")]
    NullHandle,

    #[error("Panic in {0}")]
    Panic(&'static str),

    #[error(transparent)]
    Bridge(#[from] Error),

    #[error(transparent)]
    Rtc(#[from] RtcError),
}

pub type FfiResult<T> = std::result::Result<T, FfiError>;

impl FfiError {
    pub fn json(what: &'static str, source: serde_json::Error) -> Self {
        FfiError::Json { what, source }
    }

    /// Flatten onto the shared taxonomy
    pub fn to_rtc_error(&self) -> RtcError {
        match self {
            FfiError::Rtc(err) => err.clone(),
            FfiError::Bridge(err) => err.to_rtc_error(),
            FfiError::NullHandle => RtcError::new(RtcErrorKind::InvalidHandle, self.to_string()),
            FfiError::Panic(_) => RtcError::internal(self.to_string()),
            FfiError::NullPointer(_)
            | FfiError::InvalidUtf8(_)
            | FfiError::UnknownEnum { .. }
            | FfiError::Json { .. } => RtcError::invalid_parameter(self.to_string()),
        }
    }

    pub fn to_wire(&self) -> CString {
        c_string(self.to_rtc_error().to_wire())
    }
}

/// `CString` from arbitrary text; interior NULs become U+FFFD
pub fn c_string(text: impl Into<String>) -> CString {
    let text = text.into();
    let bytes = if text.contains('\0') {
        text.replace('\0', "\u{fffd}").into_bytes()
    } else {
        text.into_bytes()
    };
    CString::new(bytes).unwrap_or_default()
}

/// Store `err` in `error_out` when the caller asked for it.
///
/// # Safety
/// `error_out` is null or valid for one pointer write.
pub unsafe fn report(error_out: *mut *mut c_char, err: &FfiError) {
    tracing::debug!(error = %err, "FFI call failed");
    if !error_out.is_null() {
        *error_out = err.to_wire().into_raw();
    }
}

/// Clear `error_out` on entry so callers never read a stale string
///
/// # Safety
/// `error_out` is null or valid for one pointer write.
pub unsafe fn reset(error_out: *mut *mut c_char) {
    if !error_out.is_null() {
        *error_out = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotemedia_rtc_bridge::Handle;

    #[test]
    fn test_argument_errors_are_invalid_parameter() {
        let err = FfiError::NullPointer("label");
        assert_eq!(err.to_rtc_error().kind(), RtcErrorKind::InvalidParameter);

        let err = FfiError::UnknownEnum {
            what: "media type",
            value: 9,
        };
        assert!(err.to_rtc_error().message().contains("media type"));
    }

    #[test]
    fn test_bridge_errors_keep_their_kind() {
        let handle = Handle::from_raw(5).unwrap();
        let err = FfiError::from(Error::InvalidHandle(handle));
        assert_eq!(err.to_rtc_error().kind(), RtcErrorKind::InvalidHandle);
        assert_eq!(
            FfiError::NullHandle.to_rtc_error().kind(),
            RtcErrorKind::InvalidHandle
        );
    }

    #[test]
    fn test_wire_string_decodes() {
        let err = FfiError::Rtc(RtcError::invalid_state("closed"));
        let wire = err.to_wire().into_string().unwrap();
        let decoded = RtcError::from_wire(&wire).unwrap();
        assert_eq!(decoded.kind(), RtcErrorKind::InvalidState);
        assert_eq!(decoded.message(), "closed");
    }

    #[test]
    fn test_interior_nul_is_replaced() {
        let s = c_string("a\0b");
        assert_eq!(s.to_str().unwrap(), "a\u{fffd}b");
    }

    #[test]
    fn test_report_writes_only_when_requested() {
        unsafe {
            report(std::ptr::null_mut(), &FfiError::NullHandle);

            let mut out: *mut c_char = std::ptr::null_mut();
            report(&mut out, &FfiError::NullHandle);
            assert!(!out.is_null());
            drop(CString::from_raw(out));
        }
    }
}
