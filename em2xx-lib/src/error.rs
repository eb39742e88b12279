use num_enum::IntoPrimitive;
use thiserror::Error;

/// The primary error type for the `em2xx` driver core.
#[derive(Error, Debug)]
pub enum EmError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("length check mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    LengthCheck { expected: u8, actual: u8 },

    #[error("link check mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    LinkCheck { expected: u32, actual: u32 },

    #[error("frame id gap: expected {expected}, received {received}")]
    FrameIdGap { expected: u16, received: u16 },

    #[error("stream decode error: {0}")]
    StreamDecode(String),

    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    #[error("payload size {0} out of range")]
    PayloadSize(usize),

    #[error("device not found")]
    NotFound,

    #[error("device already in use")]
    InUse,

    #[error("operation timed out")]
    TimedOut,

    #[error("synchronization lost: expected offset {expected}, got {actual}")]
    Synchronization { expected: u32, actual: u32 },

    #[error("operation aborted")]
    Aborted,

    #[error("too big")]
    TooBig,
}

/// Numeric return codes carried on `#` return-code topics.
///
/// 0 is success; every error kind maps to a distinct non-zero code so the
/// application can act on the status without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Unspecified = 1,
    ParameterInvalid = 2,
    NotFound = 3,
    InUse = 4,
    TimedOut = 5,
    TooBig = 6,
    Synchronization = 7,
    Aborted = 8,
    Framing = 9,
    Sequence = 10,
}

impl From<&EmError> for ErrorCode {
    fn from(e: &EmError) -> Self {
        match e {
            EmError::Framing(_) | EmError::LengthCheck { .. } | EmError::LinkCheck { .. } => ErrorCode::Framing,
            EmError::FrameIdGap { .. } => ErrorCode::Sequence,
            EmError::StreamDecode(_) => ErrorCode::Unspecified,
            EmError::ParameterInvalid(_) | EmError::PayloadSize(_) => ErrorCode::ParameterInvalid,
            EmError::NotFound => ErrorCode::NotFound,
            EmError::InUse => ErrorCode::InUse,
            EmError::TimedOut => ErrorCode::TimedOut,
            EmError::Synchronization { .. } => ErrorCode::Synchronization,
            EmError::Aborted => ErrorCode::Aborted,
            EmError::TooBig => ErrorCode::TooBig,
        }
    }
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self.into()
    }
}
