//! Open-flag bits as a typed newtype over the O_* constants.

use std::fmt;

/// Bitfield of open(2) flags as they travel on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);
    pub const CREAT: OpenFlags = OpenFlags(libc::O_CREAT);
    pub const TRUNC: OpenFlags = OpenFlags(libc::O_TRUNC);
    pub const EXCL: OpenFlags = OpenFlags(libc::O_EXCL);
    pub const APPEND: OpenFlags = OpenFlags(libc::O_APPEND);
    pub const DSYNC: OpenFlags = OpenFlags(libc::O_DSYNC);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | other.0)
    }

    fn access_mode(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    pub fn is_writable(self) -> bool {
        matches!(self.access_mode(), libc::O_WRONLY | libc::O_RDWR)
    }

    pub fn is_readable(self) -> bool {
        matches!(self.access_mode(), libc::O_RDONLY | libc::O_RDWR)
    }

    /// Cache key form: creation does not change which descriptor can be
    /// shared, so it is dropped.
    pub fn without_create(self) -> OpenFlags {
        OpenFlags(self.0 & !libc::O_CREAT)
    }

    /// Default write flags when a request carries none.
    pub fn write_default() -> OpenFlags {
        OpenFlags(libc::O_WRONLY | libc::O_CREAT)
    }

    /// Read normalization: write/create/truncate/exclusive bits are
    /// cleared; an empty result defaults to O_RDONLY.
    pub fn normalize_for_read(self) -> OpenFlags {
        let mut bits = self.0;
        bits &= !(libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL | libc::O_APPEND);
        if matches!(bits & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR) {
            bits = (bits & !libc::O_ACCMODE) | libc::O_RDONLY;
        }
        OpenFlags(bits)
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenFlags({:#o})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_normalization_strips_mutating_bits() {
        let raw = OpenFlags::WRONLY
            .union(OpenFlags::CREAT)
            .union(OpenFlags::TRUNC)
            .union(OpenFlags::EXCL);
        let normalized = raw.normalize_for_read();
        assert!(normalized.is_readable());
        assert!(!normalized.is_writable());
        assert!(!normalized.contains(OpenFlags::CREAT));
        assert!(!normalized.contains(OpenFlags::TRUNC));
    }

    #[test]
    fn zero_flags_normalize_to_rdonly() {
        let normalized = OpenFlags(0).normalize_for_read();
        assert_eq!(normalized.access_mode(), libc::O_RDONLY);
    }

    #[test]
    fn cache_key_ignores_create() {
        let a = OpenFlags::WRONLY.union(OpenFlags::CREAT);
        let b = OpenFlags::WRONLY;
        assert_eq!(a.without_create(), b.without_create());
    }

    #[test]
    fn writability_follows_access_mode() {
        assert!(OpenFlags::WRONLY.is_writable());
        assert!(OpenFlags::RDWR.is_writable());
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(OpenFlags::RDWR.is_readable());
    }
}
