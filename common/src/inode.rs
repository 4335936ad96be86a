//! On-disk inode model and the fixed 512-byte slot codec.
//!
//! The slot layout is little-endian and position-stable:
//! location u16, block_id u16, filename_len u8, digest_len u8, file_mode
//! u16, file_size u16, ino u64, namespace_id 32 B, fm/fa/im/fc u32,
//! filename, digest, volume_id_len u8, volume_id, segment_count u32,
//! segments as fixed u64 triples. Anything that does not fit in one slot
//! fails to encode.

use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one inode slot on disk.
pub const SLOT_BYTES: usize = 512;
/// Fixed length of the namespace id field.
pub const NAMESPACE_ID_LEN: usize = 32;
/// Maximum byte length of the filename and digest fields.
pub const NAME_MAX: usize = 255;

/// Sentinel returned by path lookups when no inode is bound.
pub const INO_NONE: i64 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialized inode is {0} bytes, larger than one {SLOT_BYTES}-byte slot")]
    SlotOverflow(usize),
    #[error("slot data truncated at offset {0}")]
    Truncated(usize),
    #[error("node class bits {0} are reserved")]
    ReservedNodeClass(u8),
    #[error("filename is not valid utf-8")]
    InvalidFilename,
    #[error("volume id is not valid utf-8")]
    InvalidVolumeId,
    #[error("field of {0} bytes exceeds the {NAME_MAX}-byte limit")]
    FieldTooLong(usize),
}

/// Storage node class encoded in the top two bits of the location word.
/// Value 3 is reserved and rejected on decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Ssd,
    Hdd,
    Mix,
}

impl NodeClass {
    pub fn as_bits(self) -> u8 {
        match self {
            NodeClass::Ssd => 0,
            NodeClass::Hdd => 1,
            NodeClass::Mix => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits & 0x03 {
            0 => Ok(NodeClass::Ssd),
            1 => Ok(NodeClass::Hdd),
            2 => Ok(NodeClass::Mix),
            other => Err(CodecError::ReservedNodeClass(other)),
        }
    }
}

/// File type nibble of the mode word, matching the POSIX d_type order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Unknown,
    Regular,
    Directory,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn as_bits(self) -> u8 {
        match self {
            FileKind::Unknown => 0,
            FileKind::Regular => 1,
            FileKind::Directory => 2,
            FileKind::Symlink => 3,
            FileKind::BlockDev => 4,
            FileKind::CharDev => 5,
            FileKind::Fifo => 6,
            FileKind::Socket => 7,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => FileKind::Regular,
            2 => FileKind::Directory,
            3 => FileKind::Symlink,
            4 => FileKind::BlockDev,
            5 => FileKind::CharDev,
            6 => FileKind::Fifo,
            7 => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }
}

/// Unit of the 14-bit size value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    Byte,
    Kib,
    Mib,
    Gib,
}

impl SizeUnit {
    pub fn as_bits(self) -> u8 {
        match self {
            SizeUnit::Byte => 0,
            SizeUnit::Kib => 1,
            SizeUnit::Mib => 2,
            SizeUnit::Gib => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => SizeUnit::Byte,
            1 => SizeUnit::Kib,
            2 => SizeUnit::Mib,
            _ => SizeUnit::Gib,
        }
    }

    fn multiplier(self) -> u64 {
        match self {
            SizeUnit::Byte => 1,
            SizeUnit::Kib => 1 << 10,
            SizeUnit::Mib => 1 << 20,
            SizeUnit::Gib => 1 << 30,
        }
    }
}

const SIZE_VALUE_MAX: u64 = (1 << 14) - 1;

/// Encodes a byte count into (unit, value) using the smallest unit whose
/// 14-bit value fits, rounding up. Saturates at 16383 GiB.
pub fn encode_size(bytes: u64) -> (SizeUnit, u16) {
    let mut unit = 0u8;
    let mut value = bytes;
    while unit < 3 && value > SIZE_VALUE_MAX {
        value = value.div_ceil(1 << 10);
        unit += 1;
    }
    if value > SIZE_VALUE_MAX {
        value = SIZE_VALUE_MAX;
    }
    (SizeUnit::from_bits(unit), value as u16)
}

/// Minute-granular timestamp packed into 32 bits: year-since-2000 (8),
/// month (6), day (6), hour (6), minute (6), year in the low bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTimestamp {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
}

impl InodeTimestamp {
    pub fn now() -> Self {
        let now = Local::now();
        let year = (now.year() - 2000).clamp(0, 255) as u8;
        InodeTimestamp {
            year,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn pack(self) -> u32 {
        (self.year as u32)
            | ((self.month as u32 & 0x3F) << 8)
            | ((self.day as u32 & 0x3F) << 14)
            | ((self.hour as u32 & 0x3F) << 20)
            | ((self.minute as u32 & 0x3F) << 26)
    }

    pub fn unpack(raw: u32) -> Self {
        InodeTimestamp {
            year: (raw & 0xFF) as u8,
            month: ((raw >> 8) & 0x3F) as u8,
            day: ((raw >> 14) & 0x3F) as u8,
            hour: ((raw >> 20) & 0x3F) as u8,
            minute: ((raw >> 26) & 0x3F) as u8,
        }
    }

    /// Monotonic ordering key for atime scans. Seconds are intentionally
    /// discarded; ties fall back to slot id at the call site.
    pub fn sort_key(self) -> u32 {
        ((self.year as u32 & 0xFF) << 24)
            | ((self.month as u32 & 0x3F) << 18)
            | ((self.day as u32 & 0x3F) << 12)
            | ((self.hour as u32 & 0x3F) << 6)
            | (self.minute as u32 & 0x3F)
    }
}

/// Contiguous mapping from file blocks to device blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSegment {
    pub logical_start: u64,
    pub physical_start: u64,
    pub count: u64,
}

const SEGMENT_BYTES: usize = 24;

/// In-memory inode. `ino` doubles as the slot index in the inode store.
///
/// `filename` holds the absolute path so the path table can be rebuilt from
/// a slot scan after restart.
#[derive(Clone, Debug, PartialEq)]
pub struct Inode {
    pub ino: u64,
    pub node_index: u16,
    pub node_class: NodeClass,
    pub block_id: u16,
    pub filename: String,
    pub digest: Vec<u8>,
    pub kind: FileKind,
    pub perm: u16,
    pub size_unit: SizeUnit,
    pub size_value: u16,
    pub namespace_id: String,
    pub fm_time: InodeTimestamp,
    pub fa_time: InodeTimestamp,
    pub im_time: InodeTimestamp,
    pub fc_time: InodeTimestamp,
    pub volume_id: String,
    pub segments: Vec<BlockSegment>,
}

impl Default for Inode {
    fn default() -> Self {
        Inode {
            ino: 0,
            node_index: 0,
            node_class: NodeClass::Ssd,
            block_id: 0,
            filename: String::new(),
            digest: Vec::new(),
            kind: FileKind::Unknown,
            perm: 0,
            size_unit: SizeUnit::Byte,
            size_value: 0,
            namespace_id: "0".repeat(NAMESPACE_ID_LEN),
            fm_time: InodeTimestamp::default(),
            fa_time: InodeTimestamp::default(),
            im_time: InodeTimestamp::default(),
            fc_time: InodeTimestamp::default(),
            volume_id: String::new(),
            segments: Vec::new(),
        }
    }
}

fn normalize_namespace_id(id: &str) -> String {
    if id.len() == NAMESPACE_ID_LEN {
        return id.to_string();
    }
    if id.len() > NAMESPACE_ID_LEN {
        return id[id.len() - NAMESPACE_ID_LEN..].to_string();
    }
    let mut out = "0".repeat(NAMESPACE_ID_LEN - id.len());
    out.push_str(id);
    out
}

impl Inode {
    pub fn set_node(&mut self, index: u16, class: NodeClass) {
        self.node_index = index & 0x3FFF;
        self.node_class = class;
        self.im_time = InodeTimestamp::now();
    }

    pub fn set_filename(&mut self, name: &str) -> Result<(), CodecError> {
        if name.len() > NAME_MAX {
            return Err(CodecError::FieldTooLong(name.len()));
        }
        self.filename = name.to_string();
        self.im_time = InodeTimestamp::now();
        Ok(())
    }

    pub fn set_digest(&mut self, digest: Vec<u8>) -> Result<(), CodecError> {
        if digest.len() > NAME_MAX {
            return Err(CodecError::FieldTooLong(digest.len()));
        }
        self.digest = digest;
        self.im_time = InodeTimestamp::now();
        Ok(())
    }

    pub fn set_namespace_id(&mut self, id: &str) {
        self.namespace_id = normalize_namespace_id(id);
        self.im_time = InodeTimestamp::now();
    }

    pub fn set_volume_id(&mut self, id: &str) {
        self.volume_id = id.to_string();
        self.im_time = InodeTimestamp::now();
    }

    pub fn set_perm(&mut self, perm: u16) {
        self.perm = perm & 0x0FFF;
        self.im_time = InodeTimestamp::now();
    }

    /// Encodes the byte count into the packed (unit, value) pair; the
    /// decoded size is the smallest representable value >= `bytes`.
    pub fn set_size_bytes(&mut self, bytes: u64) {
        let (unit, value) = encode_size(bytes);
        self.size_unit = unit;
        self.size_value = value;
        self.im_time = InodeTimestamp::now();
    }

    /// Decoded file size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_value as u64 * self.size_unit.multiplier()
    }

    pub fn append_segments(&mut self, segments: &[BlockSegment]) {
        if segments.is_empty() {
            return;
        }
        self.segments.extend_from_slice(segments);
        self.im_time = InodeTimestamp::now();
    }

    pub fn clear_segments(&mut self) {
        self.segments.clear();
        self.im_time = InodeTimestamp::now();
    }

    pub fn block_count(&self) -> u64 {
        self.segments.iter().map(|s| s.count).sum()
    }

    pub fn find_physical_block(&self, logical: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|seg| logical >= seg.logical_start && logical < seg.logical_start + seg.count)
            .map(|seg| seg.physical_start + (logical - seg.logical_start))
    }

    /// Serializes into exactly one zero-padded slot.
    pub fn encode_slot(&self) -> Result<Vec<u8>, CodecError> {
        if self.filename.len() > NAME_MAX {
            return Err(CodecError::FieldTooLong(self.filename.len()));
        }
        if self.digest.len() > NAME_MAX {
            return Err(CodecError::FieldTooLong(self.digest.len()));
        }
        if self.volume_id.len() > NAME_MAX {
            return Err(CodecError::FieldTooLong(self.volume_id.len()));
        }

        let mut buf = Vec::with_capacity(SLOT_BYTES);
        let location =
            (self.node_index & 0x3FFF) | ((self.node_class.as_bits() as u16) << 14);
        buf.extend_from_slice(&location.to_le_bytes());
        buf.extend_from_slice(&self.block_id.to_le_bytes());
        buf.push(self.filename.len() as u8);
        buf.push(self.digest.len() as u8);
        let mode = (self.kind.as_bits() as u16) | ((self.perm & 0x0FFF) << 4);
        buf.extend_from_slice(&mode.to_le_bytes());
        let size = (self.size_unit.as_bits() as u16) | ((self.size_value & 0x3FFF) << 2);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.ino.to_le_bytes());
        let ns = normalize_namespace_id(&self.namespace_id);
        buf.extend_from_slice(ns.as_bytes());
        for ts in [self.fm_time, self.fa_time, self.im_time, self.fc_time] {
            buf.extend_from_slice(&ts.pack().to_le_bytes());
        }
        buf.extend_from_slice(self.filename.as_bytes());
        buf.extend_from_slice(&self.digest);
        buf.push(self.volume_id.len() as u8);
        buf.extend_from_slice(self.volume_id.as_bytes());
        buf.extend_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for seg in &self.segments {
            buf.extend_from_slice(&seg.logical_start.to_le_bytes());
            buf.extend_from_slice(&seg.physical_start.to_le_bytes());
            buf.extend_from_slice(&seg.count.to_le_bytes());
        }

        if buf.len() > SLOT_BYTES {
            return Err(CodecError::SlotOverflow(buf.len()));
        }
        buf.resize(SLOT_BYTES, 0);
        Ok(buf)
    }

    /// Parses one slot. Bounds are checked against the supplied buffer, so
    /// callers may pass either a full slot or a tight serialized prefix.
    pub fn decode_slot(data: &[u8]) -> Result<Inode, CodecError> {
        let mut cur = Cursor { data, pos: 0 };

        let location = cur.read_u16()?;
        let node_index = location & 0x3FFF;
        let node_class = NodeClass::from_bits((location >> 14) as u8)?;
        let block_id = cur.read_u16()?;
        let filename_len = cur.read_u8()? as usize;
        let digest_len = cur.read_u8()? as usize;
        let mode = cur.read_u16()?;
        let kind = FileKind::from_bits((mode & 0x0F) as u8);
        let perm = (mode >> 4) & 0x0FFF;
        let size = cur.read_u16()?;
        let size_unit = SizeUnit::from_bits((size & 0x03) as u8);
        let size_value = (size >> 2) & 0x3FFF;
        let ino = cur.read_u64()?;
        let ns_bytes = cur.read_bytes(NAMESPACE_ID_LEN)?;
        let namespace_id = String::from_utf8_lossy(ns_bytes).into_owned();
        let fm_time = InodeTimestamp::unpack(cur.read_u32()?);
        let fa_time = InodeTimestamp::unpack(cur.read_u32()?);
        let im_time = InodeTimestamp::unpack(cur.read_u32()?);
        let fc_time = InodeTimestamp::unpack(cur.read_u32()?);
        let filename = String::from_utf8(cur.read_bytes(filename_len)?.to_vec())
            .map_err(|_| CodecError::InvalidFilename)?;
        let digest = cur.read_bytes(digest_len)?.to_vec();
        let volume_id_len = cur.read_u8()? as usize;
        let volume_id = String::from_utf8(cur.read_bytes(volume_id_len)?.to_vec())
            .map_err(|_| CodecError::InvalidVolumeId)?;
        let segment_count = cur.read_u32()? as usize;
        let mut segments = Vec::with_capacity(segment_count.min(SLOT_BYTES / SEGMENT_BYTES));
        for _ in 0..segment_count {
            segments.push(BlockSegment {
                logical_start: cur.read_u64()?,
                physical_start: cur.read_u64()?,
                count: cur.read_u64()?,
            });
        }

        Ok(Inode {
            ino,
            node_index,
            node_class,
            block_id,
            filename,
            digest,
            kind,
            perm,
            size_unit,
            size_value,
            namespace_id,
            fm_time,
            fa_time,
            im_time,
            fc_time,
            volume_id,
            segments,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(CodecError::Truncated(self.pos))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inode() -> Inode {
        let mut ino = Inode {
            ino: 42,
            block_id: 7,
            kind: FileKind::Regular,
            ..Inode::default()
        };
        ino.set_node(11, NodeClass::Hdd);
        ino.set_perm(0o644);
        ino.set_filename("/data/hot_file_42").unwrap();
        ino.set_digest(vec![0xAB; 32]).unwrap();
        ino.set_namespace_id("ns-17");
        ino.set_volume_id("vol_hot");
        ino.set_size_bytes(3 * 1024 * 1024);
        ino.fm_time = InodeTimestamp {
            year: 24,
            month: 5,
            day: 14,
            hour: 9,
            minute: 30,
        };
        ino.fa_time = InodeTimestamp {
            year: 25,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
        };
        ino.fc_time = ino.fm_time;
        ino.append_segments(&[
            BlockSegment {
                logical_start: 0,
                physical_start: 100,
                count: 4,
            },
            BlockSegment {
                logical_start: 4,
                physical_start: 200,
                count: 2,
            },
        ]);
        ino
    }

    #[test]
    fn slot_round_trip_is_exact() {
        let original = sample_inode();
        let slot = original.encode_slot().unwrap();
        assert_eq!(slot.len(), SLOT_BYTES);
        let decoded = Inode::decode_slot(&slot).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn encode_rejects_oversized_inode() {
        let mut ino = sample_inode();
        // 255-byte name + 255-byte digest + many segments cannot fit.
        ino.filename = "f".repeat(NAME_MAX);
        ino.digest = vec![1; NAME_MAX];
        ino.segments = vec![BlockSegment::default(); 8];
        assert!(matches!(
            ino.encode_slot(),
            Err(CodecError::SlotOverflow(_))
        ));
    }

    #[test]
    fn reserved_node_class_is_rejected() {
        let mut slot = sample_inode().encode_slot().unwrap();
        // Force the class bits to the reserved value 3.
        slot[1] |= 0xC0;
        assert_eq!(
            Inode::decode_slot(&slot),
            Err(CodecError::ReservedNodeClass(3))
        );
    }

    #[test]
    fn size_encoding_picks_smallest_unit_rounding_up() {
        assert_eq!(encode_size(0), (SizeUnit::Byte, 0));
        assert_eq!(encode_size(16383), (SizeUnit::Byte, 16383));
        assert_eq!(encode_size(16384), (SizeUnit::Kib, 16));
        assert_eq!(encode_size(16385), (SizeUnit::Kib, 17));
        assert_eq!(encode_size(5 << 20), (SizeUnit::Kib, 5120));
        assert_eq!(encode_size(1 << 34), (SizeUnit::Gib, 16));
    }

    #[test]
    fn decoded_size_is_at_least_requested() {
        for bytes in [0u64, 1, 1023, 1024, 16385, 123_456_789, 7 << 30] {
            let mut ino = Inode::default();
            ino.set_size_bytes(bytes);
            assert!(ino.size_bytes() >= bytes, "bytes={bytes}");
        }
    }

    #[test]
    fn timestamp_pack_round_trip_and_key_order() {
        let old = InodeTimestamp {
            year: 20,
            month: 6,
            day: 1,
            hour: 12,
            minute: 0,
        };
        let new = InodeTimestamp {
            year: 24,
            month: 6,
            day: 1,
            hour: 12,
            minute: 0,
        };
        assert_eq!(InodeTimestamp::unpack(old.pack()), old);
        assert!(old.sort_key() < new.sort_key());

        let late_in_day = InodeTimestamp {
            minute: 59,
            ..old
        };
        assert!(old.sort_key() < late_in_day.sort_key());
    }

    #[test]
    fn namespace_id_is_normalized_to_fixed_width() {
        let mut ino = Inode::default();
        ino.set_namespace_id("7");
        assert_eq!(ino.namespace_id.len(), NAMESPACE_ID_LEN);
        assert!(ino.namespace_id.ends_with('7'));
        let long = "x".repeat(40);
        ino.set_namespace_id(&long);
        assert_eq!(ino.namespace_id.len(), NAMESPACE_ID_LEN);
    }

    #[test]
    fn physical_block_lookup_walks_segments() {
        let ino = sample_inode();
        assert_eq!(ino.find_physical_block(0), Some(100));
        assert_eq!(ino.find_physical_block(3), Some(103));
        assert_eq!(ino.find_physical_block(4), Some(200));
        assert_eq!(ino.find_physical_block(5), Some(201));
        assert_eq!(ino.find_physical_block(6), None);
        assert_eq!(ino.block_count(), 6);
    }

    #[test]
    fn truncated_slot_fails_cleanly() {
        let slot = sample_inode().encode_slot().unwrap();
        assert!(matches!(
            Inode::decode_slot(&slot[..40]),
            Err(CodecError::Truncated(_))
        ));
    }
}
