//! Wire-stable status codes shared by every service.
//!
//! The integer values are part of the external contract and must not be
//! reordered. Unknown incoming integers are first checked against the errno
//! table, then collapsed to `UnknownError`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum StatusCode {
    #[error("success")]
    Success,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("node not found")]
    NodeNotFound,
    #[error("io error")]
    IoError,
    #[error("network error")]
    NetworkError,
    #[error("virtual node error")]
    VirtualNodeError,
    #[error("unknown error")]
    UnknownError,
}

impl StatusCode {
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::InvalidArgument => 1,
            StatusCode::NodeNotFound => 2,
            StatusCode::IoError => 3,
            StatusCode::NetworkError => 4,
            StatusCode::VirtualNodeError => 5,
            StatusCode::UnknownError => 6,
        }
    }

    /// Maps a raw errno to the closest wire code.
    pub fn from_errno(err: i32) -> Self {
        match err {
            0 => StatusCode::Success,
            libc_errno::EINVAL => StatusCode::InvalidArgument,
            libc_errno::ENOENT => StatusCode::NodeNotFound,
            libc_errno::EIO => StatusCode::IoError,
            libc_errno::ETIMEDOUT | libc_errno::ECONNREFUSED | libc_errno::ENETUNREACH => {
                StatusCode::NetworkError
            }
            _ => StatusCode::UnknownError,
        }
    }

    /// A code that is already a valid wire kind passes through; anything
    /// else goes through the errno mapping.
    pub fn normalize(code: i32) -> Self {
        match code {
            0 => StatusCode::Success,
            1 => StatusCode::InvalidArgument,
            2 => StatusCode::NodeNotFound,
            3 => StatusCode::IoError,
            4 => StatusCode::NetworkError,
            5 => StatusCode::VirtualNodeError,
            6 => StatusCode::UnknownError,
            other => StatusCode::from_errno(other),
        }
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        StatusCode::normalize(code)
    }
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> i32 {
        code.as_i32()
    }
}

/// Status envelope carried on every reply.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Status {
            code,
            message: if message.is_empty() {
                "error".to_string()
            } else {
                message
            },
        }
    }

    pub fn from_errno(err: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        let code = StatusCode::from_errno(err);
        if code == StatusCode::Success {
            return Status::ok();
        }
        Status {
            code,
            message: if message.is_empty() {
                std::io::Error::from_raw_os_error(err).to_string()
            } else {
                message
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Success
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Status::from_errno(errno, err.to_string()),
            None => Status::error(StatusCode::IoError, err.to_string()),
        }
    }
}

// Raw errno values, spelled out so `common` does not need the libc crate.
mod libc_errno {
    pub const EINVAL: i32 = 22;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const ENETUNREACH: i32 = 101;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(StatusCode::from_errno(0), StatusCode::Success);
        assert_eq!(StatusCode::from_errno(22), StatusCode::InvalidArgument);
        assert_eq!(StatusCode::from_errno(2), StatusCode::NodeNotFound);
        assert_eq!(StatusCode::from_errno(5), StatusCode::IoError);
        assert_eq!(StatusCode::from_errno(110), StatusCode::NetworkError);
        assert_eq!(StatusCode::from_errno(111), StatusCode::NetworkError);
        assert_eq!(StatusCode::from_errno(9999), StatusCode::UnknownError);
    }

    #[test]
    fn normalize_passes_known_kinds_through() {
        assert_eq!(StatusCode::normalize(5), StatusCode::VirtualNodeError);
        // 22 is not a wire kind, so it is treated as EINVAL.
        assert_eq!(StatusCode::normalize(22), StatusCode::InvalidArgument);
    }

    #[test]
    fn wire_integers_are_stable() {
        assert_eq!(StatusCode::Success.as_i32(), 0);
        assert_eq!(StatusCode::InvalidArgument.as_i32(), 1);
        assert_eq!(StatusCode::NodeNotFound.as_i32(), 2);
        assert_eq!(StatusCode::IoError.as_i32(), 3);
        assert_eq!(StatusCode::NetworkError.as_i32(), 4);
        assert_eq!(StatusCode::VirtualNodeError.as_i32(), 5);
        assert_eq!(StatusCode::UnknownError.as_i32(), 6);
    }

    #[test]
    fn empty_error_message_gets_a_placeholder() {
        let st = Status::error(StatusCode::IoError, "");
        assert_eq!(st.message, "error");
        assert!(!st.is_ok());
    }
}
