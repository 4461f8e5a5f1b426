//! Error types for the RTC bridge
//!
//! Native failures are flattened into [`RtcError`] records so they can cross
//! the host boundary. A record travels as a single string: a fixed-width hex
//! header followed by the raw message.
//!
//! ```text
//! offset  width  field
//!      0      8  kind            (%08x)
//!      8      8  detail          (%08x)
//!     16      2  has cause code  (%02x, 0 or 1)
//!     18      4  sctp cause code (%04x)
//!     22      -  message         (raw, unescaped)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::{Handle, ObjectKind};
use crate::thread::ThreadRole;

/// Result type alias using the bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Length of the fixed-width hex header of a wire-encoded [`RtcError`]
pub const WIRE_HEADER_LEN: usize = 22;

/// Error classification shared with the native engine.
///
/// Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RtcErrorKind {
    /// Success marker; never produced by a failing bridge operation
    None = 0,
    UnsupportedOperation = 1,
    UnsupportedParameter = 2,
    InvalidParameter = 3,
    InvalidRange = 4,
    SyntaxError = 5,
    InvalidState = 6,
    InvalidModification = 7,
    NetworkError = 8,
    ResourceExhausted = 9,
    InternalError = 10,
    OperationErrorWithData = 11,
    /// Added by the bridge: the handle was unknown, released, or of the wrong kind
    InvalidHandle = 12,
}

impl RtcErrorKind {
    /// Wire code of this kind
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a kind by wire code
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::UnsupportedOperation,
            2 => Self::UnsupportedParameter,
            3 => Self::InvalidParameter,
            4 => Self::InvalidRange,
            5 => Self::SyntaxError,
            6 => Self::InvalidState,
            7 => Self::InvalidModification,
            8 => Self::NetworkError,
            9 => Self::ResourceExhausted,
            10 => Self::InternalError,
            11 => Self::OperationErrorWithData,
            12 => Self::InvalidHandle,
            _ => return None,
        })
    }
}

impl fmt::Display for RtcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Sub-classification attached to [`RtcErrorKind::OperationErrorWithData`]
/// and a few other native failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum RtcErrorDetail {
    #[default]
    None = 0,
    DataChannelFailure = 1,
    DtlsFailure = 2,
    FingerprintFailure = 3,
    SctpFailure = 4,
    SdpSyntaxError = 5,
    HardwareEncoderNotAvailable = 6,
    HardwareEncoderError = 7,
}

impl RtcErrorDetail {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::DataChannelFailure,
            2 => Self::DtlsFailure,
            3 => Self::FingerprintFailure,
            4 => Self::SctpFailure,
            5 => Self::SdpSyntaxError,
            6 => Self::HardwareEncoderNotAvailable,
            7 => Self::HardwareEncoderError,
            _ => return None,
        })
    }
}

/// Flattened native error.
///
/// Built once through [`RtcError::new`] and the `with_*` methods, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RtcError {
    kind: RtcErrorKind,
    detail: RtcErrorDetail,
    sctp_cause_code: Option<u16>,
    message: String,
}

impl RtcError {
    pub fn new(kind: RtcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            detail: RtcErrorDetail::None,
            sctp_cause_code: None,
            message: message.into(),
        }
    }

    pub fn with_detail(mut self, detail: RtcErrorDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_sctp_cause_code(mut self, code: u16) -> Self {
        self.sctp_cause_code = Some(code);
        self
    }

    /// Shorthand for an [`RtcErrorKind::InvalidState`] error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RtcErrorKind::InvalidState, message)
    }

    /// Shorthand for an [`RtcErrorKind::InvalidParameter`] error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(RtcErrorKind::InvalidParameter, message)
    }

    /// Shorthand for an [`RtcErrorKind::InternalError`] error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RtcErrorKind::InternalError, message)
    }

    pub fn kind(&self) -> RtcErrorKind {
        self.kind
    }

    pub fn detail(&self) -> RtcErrorDetail {
        self.detail
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn has_sctp_cause_code(&self) -> bool {
        self.sctp_cause_code.is_some()
    }

    pub fn sctp_cause_code(&self) -> Option<u16> {
        self.sctp_cause_code
    }

    /// Encode into the single-string wire format
    pub fn to_wire(&self) -> String {
        let (has_cause, cause) = match self.sctp_cause_code {
            Some(code) => (1u8, code),
            None => (0u8, 0u16),
        };
        format!(
            "{:08x}{:08x}{:02x}{:04x}{}",
            self.kind.code(),
            self.detail.code(),
            has_cause,
            cause,
            self.message
        )
    }

    /// Decode a record produced by [`RtcError::to_wire`]. Hex digits may be
    /// either case.
    pub fn from_wire(wire: &str) -> std::result::Result<Self, WireError> {
        let header = wire
            .get(..WIRE_HEADER_LEN)
            .ok_or(WireError::Truncated { len: wire.len() })?;
        if !header.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WireError::Malformed(header.to_string()));
        }
        // All-hex header is ASCII, so byte ranges are char boundaries.
        let field = |start: usize, end: usize| -> std::result::Result<u32, WireError> {
            u32::from_str_radix(&header[start..end], 16)
                .map_err(|_| WireError::Malformed(header[start..end].to_string()))
        };

        let kind_code = field(0, 8)?;
        let detail_code = field(8, 16)?;
        let has_cause = field(16, 18)?;
        let cause = field(18, 22)?;

        let kind = RtcErrorKind::from_code(kind_code).ok_or(WireError::UnknownKind(kind_code))?;
        let detail =
            RtcErrorDetail::from_code(detail_code).ok_or(WireError::UnknownDetail(detail_code))?;
        let sctp_cause_code = match has_cause {
            0 => None,
            // `cause` is four hex digits wide
            1 => Some(cause as u16),
            other => return Err(WireError::InvalidCauseFlag(other)),
        };

        Ok(Self {
            kind,
            detail,
            sctp_cause_code,
            message: wire[WIRE_HEADER_LEN..].to_string(),
        })
    }
}

/// Failure to decode a wire-encoded [`RtcError`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("wire error truncated: {len} bytes, header needs {}", WIRE_HEADER_LEN)]
    Truncated { len: usize },

    #[error("malformed wire header: {0:?}")]
    Malformed(String),

    #[error("unknown error kind code: {0}")]
    UnknownKind(u32),

    #[error("unknown error detail code: {0}")]
    UnknownDetail(u32),

    #[error("invalid sctp cause flag: {0}")]
    InvalidCauseFlag(u32),
}

/// Errors that can occur in bridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error reported by the media engine
    #[error(transparent)]
    Rtc(#[from] RtcError),

    /// Handle was never issued or has been released
    #[error("Invalid handle: {0}")]
    InvalidHandle(Handle),

    /// Handle refers to a different kind of object
    #[error("Handle {handle} refers to a {actual}, expected a {expected}")]
    HandleKindMismatch {
        handle: Handle,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    /// Blocking call issued from an engine thread that cannot wait on the target
    #[error("Wrong thread: {operation} requires the {required} thread, called from the {current} thread")]
    WrongThread {
        operation: &'static str,
        required: ThreadRole,
        current: ThreadRole,
    },

    /// Engine runtime stopped or unavailable
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire decoding error
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Check if this error is an invalid or mistyped handle
    pub fn is_invalid_handle(&self) -> bool {
        matches!(
            self,
            Error::InvalidHandle(_) | Error::HandleKindMismatch { .. }
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Flatten into the shared taxonomy for the wire
    pub fn to_rtc_error(&self) -> RtcError {
        match self {
            Error::Rtc(err) => err.clone(),
            Error::InvalidHandle(_) | Error::HandleKindMismatch { .. } => {
                RtcError::new(RtcErrorKind::InvalidHandle, self.to_string())
            }
            Error::WrongThread { .. } => RtcError::invalid_state(self.to_string()),
            Error::InvalidConfig(_) | Error::Serialization(_) => {
                RtcError::invalid_parameter(self.to_string())
            }
            Error::Wire(_) => RtcError::new(RtcErrorKind::SyntaxError, self.to_string()),
            Error::Runtime(_) | Error::Io(_) => RtcError::internal(self.to_string()),
        }
    }
}

impl From<Error> for RtcError {
    fn from(err: Error) -> Self {
        match err {
            Error::Rtc(err) => err,
            other => other.to_rtc_error(),
        }
    }
}
