//! Volume layer: block reservation for new inodes and the storage gateway
//! seam the data path delegates to.
//!
//! The MDS only does bookkeeping here; actual bytes move through a
//! [`StorageGateway`] implementation owned by the deployment (the in-memory
//! one backs tests).

use crate::error::MdsError;
use async_trait::async_trait;
use common::Status;
use common::inode::{BlockSegment, Inode, NodeClass};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// Bytes per volume block.
pub const VOLUME_BLOCK_BYTES: u64 = 4 << 20;

/// One storage volume: an id, a class, and a free-extent map.
pub struct Volume {
    id: String,
    class: NodeClass,
    total_blocks: u64,
    // start block -> extent length, only free extents
    free: Mutex<BTreeMap<u64, u64>>,
}

impl Volume {
    pub fn new(id: impl Into<String>, class: NodeClass, total_blocks: u64) -> Self {
        let mut free = BTreeMap::new();
        if total_blocks > 0 {
            free.insert(0, total_blocks);
        }
        Volume {
            id: id.into(),
            class,
            total_blocks,
            free: Mutex::new(free),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> NodeClass {
        self.class
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> u64 {
        let free = self.free.lock().expect("volume lock poisoned");
        free.values().sum()
    }

    /// Reserves `blocks` physical blocks, possibly split across extents.
    /// All-or-nothing: insufficient space leaves the volume untouched.
    pub fn allocate(&self, blocks: u64) -> Result<Vec<(u64, u64)>, MdsError> {
        if blocks == 0 {
            return Ok(Vec::new());
        }
        let mut free = self.free.lock().expect("volume lock poisoned");
        let available: u64 = free.values().sum();
        if available < blocks {
            return Err(MdsError::NoSpace(self.id.clone()));
        }
        let mut out = Vec::new();
        let mut remaining = blocks;
        while remaining > 0 {
            let (&start, &len) = free.iter().next().expect("free space accounted above");
            free.remove(&start);
            let take = len.min(remaining);
            out.push((start, take));
            if take < len {
                free.insert(start + take, len - take);
            }
            remaining -= take;
        }
        Ok(out)
    }

    /// Returns the physical ranges of `segments` to the free map,
    /// coalescing adjacent extents.
    pub fn release(&self, segments: &[BlockSegment]) {
        let mut free = self.free.lock().expect("volume lock poisoned");
        for seg in segments {
            if seg.count == 0 {
                continue;
            }
            free.insert(seg.physical_start, seg.count);
        }
        // Merge neighbours in one pass.
        let merged: Vec<(u64, u64)> = {
            let mut merged: Vec<(u64, u64)> = Vec::with_capacity(free.len());
            for (&start, &len) in free.iter() {
                match merged.last_mut() {
                    Some((ps, pl)) if *ps + *pl == start => *pl += len,
                    _ => merged.push((start, len)),
                }
            }
            merged
        };
        free.clear();
        free.extend(merged);
    }
}

/// All volumes known to this MDS, indexed by registration order.
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: RwLock<Vec<Arc<Volume>>>,
}

impl VolumeRegistry {
    pub fn register(&self, volume: Arc<Volume>) -> usize {
        let mut volumes = self.volumes.write().expect("volume registry poisoned");
        volumes.push(volume);
        volumes.len() - 1
    }

    pub fn find(&self, volume_id: &str) -> Option<Arc<Volume>> {
        let volumes = self.volumes.read().expect("volume registry poisoned");
        volumes.iter().find(|v| v.id() == volume_id).cloned()
    }

    /// First registered volume of the class with room for `blocks`.
    pub fn pick(&self, class: NodeClass, blocks: u64) -> Option<Arc<Volume>> {
        let volumes = self.volumes.read().expect("volume registry poisoned");
        volumes
            .iter()
            .find(|v| v.class() == class && v.free_blocks() >= blocks)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.volumes.read().expect("volume registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Binds a volume and block segments to a new inode, and releases them on
/// removal.
pub struct VolumeAllocator {
    registry: Arc<VolumeRegistry>,
}

impl VolumeAllocator {
    pub fn new(registry: Arc<VolumeRegistry>) -> Self {
        VolumeAllocator { registry }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    /// Picks a volume matching the inode's node class and reserves blocks
    /// sized to its declared file size. Zero-sized files only get the
    /// volume binding.
    pub fn allocate_for_inode(&self, inode: &mut Inode) -> Result<(), MdsError> {
        let blocks = inode.size_bytes().div_ceil(VOLUME_BLOCK_BYTES);
        let volume = self
            .registry
            .pick(inode.node_class, blocks)
            .ok_or(MdsError::NoVolume(inode.node_class))?;
        let extents = volume.allocate(blocks)?;
        let mut logical = inode.block_count();
        let segments: Vec<BlockSegment> = extents
            .into_iter()
            .map(|(physical_start, count)| {
                let seg = BlockSegment {
                    logical_start: logical,
                    physical_start,
                    count,
                };
                logical += count;
                seg
            })
            .collect();
        inode.append_segments(&segments);
        inode.set_volume_id(volume.id());
        Ok(())
    }

    /// Returns every segment to the owning volume and clears the list.
    pub fn free_blocks_for_inode(&self, inode: &mut Inode) {
        if let Some(volume) = self.registry.find(&inode.volume_id) {
            volume.release(&inode.segments);
        }
        inode.clear_segments();
    }

    /// Extends the inode's reservation so `blocks` logical blocks are
    /// mapped, pulling from the already-bound volume.
    fn extend_to(&self, inode: &mut Inode, blocks: u64) -> Result<(), MdsError> {
        let have = inode.block_count();
        if blocks <= have {
            return Ok(());
        }
        let volume = self
            .registry
            .find(&inode.volume_id)
            .or_else(|| self.registry.pick(inode.node_class, blocks - have))
            .ok_or(MdsError::NoVolume(inode.node_class))?;
        let extents = volume.allocate(blocks - have)?;
        let mut logical = have;
        let segments: Vec<BlockSegment> = extents
            .into_iter()
            .map(|(physical_start, count)| {
                let seg = BlockSegment {
                    logical_start: logical,
                    physical_start,
                    count,
                };
                logical += count;
                seg
            })
            .collect();
        inode.append_segments(&segments);
        if inode.volume_id.is_empty() {
            inode.set_volume_id(volume.id());
        }
        Ok(())
    }
}

/// Byte-moving backend addressed by (volume, physical block).
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn write_block(
        &self,
        volume_id: &str,
        physical_block: u64,
        offset_in_block: u64,
        data: &[u8],
    ) -> Result<u64, Status>;

    async fn read_block(
        &self,
        volume_id: &str,
        physical_block: u64,
        offset_in_block: u64,
        len: u64,
    ) -> Result<Vec<u8>, Status>;
}

/// File I/O over the segment map: logical byte ranges are split on block
/// boundaries, mapped to physical blocks and handed to the gateway.
pub struct VolumeManager {
    allocator: VolumeAllocator,
    gateway: Arc<dyn StorageGateway>,
}

impl VolumeManager {
    pub fn new(registry: Arc<VolumeRegistry>, gateway: Arc<dyn StorageGateway>) -> Self {
        VolumeManager {
            allocator: VolumeAllocator::new(registry),
            gateway,
        }
    }

    pub fn allocator(&self) -> &VolumeAllocator {
        &self.allocator
    }

    /// Writes `data` at `offset`, extending the reservation on writes past
    /// the mapped range. Returns bytes written; the mutated inode carries
    /// any newly appended segments and the refreshed size.
    pub async fn write_file(
        &self,
        inode: &mut Inode,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, MdsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        self.allocator
            .extend_to(inode, end.div_ceil(VOLUME_BLOCK_BYTES))?;

        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let logical_block = pos / VOLUME_BLOCK_BYTES;
            let in_block = pos % VOLUME_BLOCK_BYTES;
            let chunk = ((VOLUME_BLOCK_BYTES - in_block) as usize).min(data.len() - written);
            let physical = inode
                .find_physical_block(logical_block)
                .ok_or_else(|| MdsError::NoSpace(inode.volume_id.clone()))?;
            self.gateway
                .write_block(
                    &inode.volume_id,
                    physical,
                    in_block,
                    &data[written..written + chunk],
                )
                .await
                .map_err(MdsError::Gateway)?;
            pos += chunk as u64;
            written += chunk;
        }
        if end > inode.size_bytes() {
            inode.set_size_bytes(end);
        }
        Ok(written as u64)
    }

    /// Reads up to `len` bytes at `offset`, clamped to the file size.
    pub async fn read_file(
        &self,
        inode: &Inode,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, MdsError> {
        let size = inode.size_bytes();
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        while (out.len() as u64) < len {
            let logical_block = pos / VOLUME_BLOCK_BYTES;
            let in_block = pos % VOLUME_BLOCK_BYTES;
            let chunk = (VOLUME_BLOCK_BYTES - in_block).min(len - out.len() as u64);
            let physical = inode
                .find_physical_block(logical_block)
                .ok_or_else(|| MdsError::NoSpace(inode.volume_id.clone()))?;
            let bytes = self
                .gateway
                .read_block(&inode.volume_id, physical, in_block, chunk)
                .await
                .map_err(MdsError::Gateway)?;
            out.extend_from_slice(&bytes);
            pos += chunk;
        }
        Ok(out)
    }

    /// Frees every block segment. Returns true when something was bound.
    pub fn release_inode_blocks(&self, inode: &mut Inode) -> bool {
        let had = !inode.segments.is_empty() || !inode.volume_id.is_empty();
        self.allocator.free_blocks_for_inode(inode);
        had
    }
}

/// In-memory gateway used by tests and single-process setups.
#[derive(Default)]
pub struct MemoryGateway {
    blocks: tokio::sync::RwLock<HashMap<(String, u64), Vec<u8>>>,
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    async fn write_block(
        &self,
        volume_id: &str,
        physical_block: u64,
        offset_in_block: u64,
        data: &[u8],
    ) -> Result<u64, Status> {
        let mut blocks = self.blocks.write().await;
        let block = blocks
            .entry((volume_id.to_string(), physical_block))
            .or_default();
        let end = (offset_in_block as usize) + data.len();
        if block.len() < end {
            block.resize(end, 0);
        }
        block[offset_in_block as usize..end].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    async fn read_block(
        &self,
        volume_id: &str,
        physical_block: u64,
        offset_in_block: u64,
        len: u64,
    ) -> Result<Vec<u8>, Status> {
        let blocks = self.blocks.read().await;
        let mut out = vec![0u8; len as usize];
        if let Some(block) = blocks.get(&(volume_id.to_string(), physical_block)) {
            let start = offset_in_block as usize;
            let end = (start + len as usize).min(block.len());
            if end > start {
                out[..end - start].copy_from_slice(&block[start..end]);
            }
        }
        Ok(out)
    }
}
