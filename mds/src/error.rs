use common::inode::CodecError;
use common::{Status, StatusCode};
use thiserror::Error;

/// Metadata operation errors.
#[derive(Debug, Error)]
pub enum MdsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("inode {0} slot is truncated")]
    ShortRead(u64),

    #[error("no volume available for class {0:?}")]
    NoVolume(common::inode::NodeClass),

    #[error("volume {0} is out of free blocks")]
    NoSpace(String),

    #[error("storage gateway: {0}")]
    Gateway(Status),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MdsError {
    /// Collapses onto the wire status kinds. Path misses ride the ENOENT
    /// mapping; malformed input rides EINVAL; anything without an errno
    /// analogue is UnknownError with the message preserved.
    pub fn to_status(&self) -> Status {
        let code = match self {
            MdsError::Gateway(status) => return status.clone(),
            MdsError::NotFound(_) => StatusCode::NodeNotFound,
            MdsError::InvalidPath(_) | MdsError::Codec(_) => StatusCode::InvalidArgument,
            MdsError::ShortRead(_) => StatusCode::IoError,
            MdsError::Io(err) => {
                return match err.raw_os_error() {
                    Some(errno) => Status::from_errno(errno, err.to_string()),
                    None => Status::error(StatusCode::IoError, err.to_string()),
                };
            }
            _ => StatusCode::UnknownError,
        };
        Status::error(code, self.to_string())
    }
}

impl From<MdsError> for Status {
    fn from(err: MdsError) -> Status {
        err.to_status()
    }
}
