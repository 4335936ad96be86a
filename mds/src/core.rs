//! Namespace engine: ties the inode store, allocator, directory pages,
//! lock table, path index and volume bookkeeping into the metadata API.

use crate::alloc::InodeAllocator;
use crate::dirlock::{DirLockTable, LockMode};
use crate::dirstore::{DirEntry, DirStore};
use crate::error::MdsError;
use crate::pathkv::PathKv;
use crate::store::InodeStore;
use crate::volume::{Volume, VolumeAllocator, VolumeRegistry, VOLUME_BLOCK_BYTES};
use common::inode::{FileKind, Inode, InodeTimestamp, NodeClass, INO_NONE};
use common::wire::NodeKind;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{info, warn};

/// Capability handed to the VFS front end so open handles can be
/// force-closed when their file goes away. Notifications are at-least-once
/// (a restart may replay one), so implementations must be idempotent.
pub trait HandleObserver: Send + Sync {
    fn close_handles(&self, ino: u64);
}

#[derive(Clone, Debug)]
pub struct MdsOptions {
    pub data_dir: PathBuf,
    pub create_new: bool,
    pub enable_pathkv: bool,
}

impl MdsOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        MdsOptions {
            data_dir: data_dir.into(),
            create_new: false,
            enable_pathkv: true,
        }
    }
}

/// Node record pushed down from the cluster manager.
#[derive(Clone, Debug)]
pub struct RegisteredNode {
    pub node_id: String,
    pub ip: String,
    pub port: u32,
    pub kind: NodeKind,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
}

/// Bit set over inode slots produced by the cold scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColdBitmap {
    pub total_slots: u64,
    pub bits: Vec<u8>,
}

impl ColdBitmap {
    fn new(total_slots: u64) -> Self {
        ColdBitmap {
            total_slots,
            bits: vec![0u8; total_slots.div_ceil(8) as usize],
        }
    }

    fn set(&mut self, ino: u64) {
        if ino < self.total_slots {
            self.bits[ino as usize / 8] |= 1 << (ino % 8);
        }
    }

    pub fn is_set(&self, ino: u64) -> bool {
        ino < self.total_slots && self.bits[ino as usize / 8] & (1 << (ino % 8)) != 0
    }

    pub fn count(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }
}

pub struct MdsCore {
    store: Arc<InodeStore>,
    alloc: Arc<InodeAllocator>,
    dirs: DirStore,
    dir_locks: DirLockTable,
    pathkv: Option<PathKv>,
    path_table: RwLock<HashMap<String, u64>>,
    volume_registry: Arc<VolumeRegistry>,
    volume_alloc: VolumeAllocator,
    observer: Mutex<Weak<dyn HandleObserver>>,
    nodes: RwLock<HashMap<String, RegisteredNode>>,
}

struct NullObserver;
impl HandleObserver for NullObserver {
    fn close_handles(&self, _ino: u64) {}
}

impl MdsCore {
    pub fn open(options: MdsOptions) -> Result<Arc<Self>, MdsError> {
        std::fs::create_dir_all(&options.data_dir)?;
        let store = Arc::new(InodeStore::open(
            options.data_dir.join("inodes.dat"),
            options.create_new,
        )?);
        let alloc = Arc::new(InodeAllocator::open(
            options.data_dir.join("inode_bitmap.dat"),
            store.clone(),
            options.create_new,
        )?);
        let dirs = DirStore::open(options.data_dir.join("dirs"))?;
        let pathkv = if options.enable_pathkv {
            Some(PathKv::open(options.data_dir.join("paths.log"))?)
        } else {
            None
        };
        let volume_registry = Arc::new(VolumeRegistry::default());

        let core = Arc::new(MdsCore {
            store,
            alloc,
            dirs,
            dir_locks: DirLockTable::default(),
            pathkv,
            path_table: RwLock::new(HashMap::new()),
            volume_alloc: VolumeAllocator::new(volume_registry.clone()),
            volume_registry,
            observer: Mutex::new(Weak::<NullObserver>::new() as Weak<dyn HandleObserver>),
            nodes: RwLock::new(HashMap::new()),
        });
        if !options.create_new {
            core.rebuild_inode_table()?;
        }
        Ok(core)
    }

    pub fn set_handle_observer(&self, observer: Weak<dyn HandleObserver>) {
        *self.observer.lock().expect("observer slot poisoned") = observer;
    }

    fn notify_handle_observer(&self, ino: u64) {
        let observer = self.observer.lock().expect("observer slot poisoned").upgrade();
        if let Some(observer) = observer {
            observer.close_handles(ino);
        }
    }

    // ----- path resolution -----

    fn split_path(path: &str) -> Result<(String, String), MdsError> {
        if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
            return Err(MdsError::InvalidPath(path.to_string()));
        }
        let cut = path.rfind('/').expect("checked above");
        let name = path[cut + 1..].to_string();
        let parent = if cut == 0 {
            "/".to_string()
        } else {
            path[..cut].to_string()
        };
        Ok((parent, name))
    }

    /// Cache, then PathKV, then nothing. A PathKV hit is validated against
    /// the allocator before it is trusted and promoted into the cache.
    fn resolve(&self, path: &str) -> Option<u64> {
        {
            let table = self.path_table.read().expect("path table poisoned");
            if let Some(&ino) = table.get(path) {
                return Some(ino);
            }
        }
        let kv = self.pathkv.as_ref()?;
        let ino = kv.get(path)?;
        if !self.alloc.is_allocated(ino) {
            return None;
        }
        self.path_table
            .write()
            .expect("path table poisoned")
            .insert(path.to_string(), ino);
        Some(ino)
    }

    /// Returns the inode number bound to `path`, or the -1 sentinel.
    pub fn lookup_ino(&self, path: &str) -> i64 {
        match self.resolve(path) {
            Some(ino) => ino as i64,
            None => INO_NONE,
        }
    }

    pub fn find_inode_by_path(&self, path: &str) -> Result<Option<Inode>, MdsError> {
        match self.resolve(path) {
            Some(ino) => Ok(Some(self.store.read(ino)?)),
            None => Ok(None),
        }
    }

    fn bind_path(&self, path: &str, ino: u64) -> Result<(), MdsError> {
        if let Some(kv) = &self.pathkv {
            kv.put(path, ino)?;
        }
        self.path_table
            .write()
            .expect("path table poisoned")
            .insert(path.to_string(), ino);
        Ok(())
    }

    fn unbind_path(&self, path: &str) -> Result<(), MdsError> {
        if let Some(kv) = &self.pathkv {
            kv.delete(path)?;
        }
        self.path_table
            .write()
            .expect("path table poisoned")
            .remove(path);
        Ok(())
    }

    // ----- namespace operations -----

    /// Idempotent root creation: allocates the root directory inode and
    /// seeds its page with `.` and `..`.
    pub async fn create_root(&self) -> Result<u64, MdsError> {
        if let Some(ino) = self.resolve("/") {
            return Ok(ino);
        }

        let mut inode = Inode {
            kind: FileKind::Directory,
            ..Inode::default()
        };
        inode.set_filename("/")?;
        inode.set_perm(0o755);
        let now = InodeTimestamp::now();
        inode.fm_time = now;
        inode.fa_time = now;
        inode.fc_time = now;

        let ino = self.alloc.allocate()?;
        inode.ino = ino;

        let _guard = self.dir_locks.lock(ino, LockMode::Exclusive).await;
        self.dirs
            .add(ino, &DirEntry::new(".", ino, FileKind::Directory))?;
        self.dirs
            .add(ino, &DirEntry::new("..", ino, FileKind::Directory))?;
        self.store.write(ino, &inode)?;
        self.bind_path("/", ino)?;
        Ok(ino)
    }

    pub async fn mkdir(&self, path: &str, mode: u16) -> Result<u64, MdsError> {
        let (parent_path, name) = Self::split_path(path)?;
        let parent_ino = self
            .resolve(&parent_path)
            .ok_or_else(|| MdsError::NotFound(parent_path.clone()))?;
        if self.resolve(path).is_some() {
            return Err(MdsError::AlreadyExists(path.to_string()));
        }

        let parent_inode = self.store.read(parent_ino)?;
        if parent_inode.kind != FileKind::Directory {
            return Err(MdsError::NotDirectory(parent_path));
        }

        let _guard = self.dir_locks.lock(parent_ino, LockMode::Exclusive).await;
        // Re-check under the parent lock; a sibling mkdir may have won.
        if self.resolve(path).is_some() {
            return Err(MdsError::AlreadyExists(path.to_string()));
        }

        let mut inode = Inode {
            kind: FileKind::Directory,
            ..Inode::default()
        };
        inode.set_filename(path)?;
        inode.set_perm(mode & 0o777);
        let now = InodeTimestamp::now();
        inode.fm_time = now;
        inode.fa_time = now;
        inode.fc_time = now;

        let ino = self.alloc.allocate()?;
        inode.ino = ino;

        let seeded = self
            .dirs
            .add(ino, &DirEntry::new(".", ino, FileKind::Directory))
            .and_then(|_| {
                self.dirs
                    .add(ino, &DirEntry::new("..", parent_ino, FileKind::Directory))
            })
            .and_then(|_| {
                self.dirs
                    .add(parent_ino, &DirEntry::new(&name, ino, FileKind::Directory))
            })
            .and_then(|_| self.store.write(ino, &inode));
        if let Err(err) = seeded {
            // Roll the half-made directory back out of persistent state.
            let _ = self.dirs.reset(ino);
            let _ = self.dirs.remove(parent_ino, &name);
            let _ = self.alloc.free(ino);
            return Err(err);
        }

        self.bind_path(path, ino)?;
        Ok(ino)
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), MdsError> {
        let ino = self
            .resolve(path)
            .ok_or_else(|| MdsError::NotFound(path.to_string()))?;
        let (parent_path, name) = Self::split_path(path)?;
        let parent_ino = self
            .resolve(&parent_path)
            .ok_or_else(|| MdsError::NotFound(parent_path.clone()))?;

        let target = self.store.read(ino)?;
        if target.kind != FileKind::Directory {
            return Err(MdsError::NotDirectory(path.to_string()));
        }

        // Parent and target exclusively, in ascending inode order.
        let _guards = self
            .dir_locks
            .lock_many(&[
                (parent_ino, LockMode::Exclusive),
                (ino, LockMode::Exclusive),
            ])
            .await;

        let entries = self.dirs.read(ino)?;
        if entries.iter().any(|e| e.name != "." && e.name != "..") {
            return Err(MdsError::DirectoryNotEmpty(path.to_string()));
        }

        self.dirs.remove(parent_ino, &name)?;
        self.dirs.reset(ino)?;
        self.unbind_path(path)?;
        self.alloc.free(ino)?;
        Ok(())
    }

    pub async fn create_file(&self, path: &str, mode: u16) -> Result<u64, MdsError> {
        if self.resolve(path).is_some() {
            return Err(MdsError::AlreadyExists(path.to_string()));
        }
        let (parent_path, name) = Self::split_path(path)?;
        let parent_ino = self
            .resolve(&parent_path)
            .ok_or_else(|| MdsError::NotFound(parent_path.clone()))?;

        let parent_inode = self.store.read(parent_ino)?;
        if parent_inode.kind != FileKind::Directory {
            return Err(MdsError::NotDirectory(parent_path));
        }

        let _guard = self.dir_locks.lock(parent_ino, LockMode::Exclusive).await;
        if self.resolve(path).is_some() {
            return Err(MdsError::AlreadyExists(path.to_string()));
        }

        let mut inode = Inode {
            kind: FileKind::Regular,
            ..Inode::default()
        };
        inode.set_filename(path)?;
        inode.set_perm(mode & 0x0FFF);
        let now = InodeTimestamp::now();
        inode.fm_time = now;
        inode.fa_time = now;
        inode.fc_time = now;

        let ino = self.alloc.allocate()?;
        inode.ino = ino;

        // Bind a volume when any are registered; a failed binding leaves
        // the file unbound rather than failing the create, matching the
        // metadata-first flow.
        if !self.volume_registry.is_empty() {
            if let Err(err) = self.volume_alloc.allocate_for_inode(&mut inode) {
                warn!(path, "volume allocation failed: {err}");
            }
        }

        let persisted = self
            .dirs
            .add(parent_ino, &DirEntry::new(&name, ino, FileKind::Regular))
            .and_then(|_| self.store.write(ino, &inode));
        if let Err(err) = persisted {
            let _ = self.dirs.remove(parent_ino, &name);
            self.volume_alloc.free_blocks_for_inode(&mut inode);
            let _ = self.alloc.free(ino);
            return Err(err);
        }

        self.bind_path(path, ino)?;
        Ok(ino)
    }

    /// Unlinks a file and returns the detached inode number so the
    /// gateway can force-close open handles.
    pub async fn remove_file(&self, path: &str) -> Result<u64, MdsError> {
        let ino = self
            .resolve(path)
            .ok_or_else(|| MdsError::NotFound(path.to_string()))?;
        let (parent_path, name) = Self::split_path(path)?;
        let parent_ino = self
            .resolve(&parent_path)
            .ok_or_else(|| MdsError::NotFound(parent_path.clone()))?;

        let _guard = self.dir_locks.lock(parent_ino, LockMode::Exclusive).await;

        let mut inode = self.store.read(ino)?;
        self.dirs.remove(parent_ino, &name)?;
        self.volume_alloc.free_blocks_for_inode(&mut inode);
        self.notify_handle_observer(ino);
        self.unbind_path(path)?;
        self.alloc.free(ino)?;
        Ok(ino)
    }

    /// Drops every block segment, zeroes the size and refreshes the
    /// timestamps. Returns the refreshed inode.
    pub async fn truncate_file(&self, path: &str) -> Result<Inode, MdsError> {
        let mut inode = self
            .find_inode_by_path(path)?
            .ok_or_else(|| MdsError::NotFound(path.to_string()))?;

        self.volume_alloc.free_blocks_for_inode(&mut inode);
        inode.set_size_bytes(0);
        let now = InodeTimestamp::now();
        inode.fm_time = now;
        inode.fa_time = now;
        inode.fc_time = now;

        self.notify_handle_observer(inode.ino);
        self.store.write(inode.ino, &inode)?;
        Ok(inode)
    }

    /// Re-encodes `size_bytes` into the packed (unit, value) pair and
    /// stamps fm_time. The stored size is the smallest representable
    /// value >= `size_bytes`.
    pub fn update_file_size(&self, ino: u64, size_bytes: u64) -> Result<Inode, MdsError> {
        if !self.alloc.is_allocated(ino) {
            return Err(MdsError::NotFound(format!("inode {ino}")));
        }
        let mut inode = self.store.read(ino)?;
        inode.set_size_bytes(size_bytes);
        inode.fm_time = InodeTimestamp::now();
        self.store.write(ino, &inode)?;
        Ok(inode)
    }

    pub async fn ls(&self, path: &str) -> Result<Vec<DirEntry>, MdsError> {
        let ino = self
            .resolve(path)
            .ok_or_else(|| MdsError::NotFound(path.to_string()))?;
        let inode = self.store.read(ino)?;
        if inode.kind != FileKind::Directory {
            return Err(MdsError::NotDirectory(path.to_string()));
        }
        let _guard = self.dir_locks.lock(ino, LockMode::Shared).await;
        self.dirs.read(ino)
    }

    /// Rebuilds the path table (and PathKV, when enabled) from a full slot
    /// scan. Slot content is authoritative; stale index entries are
    /// discarded.
    pub fn rebuild_inode_table(&self) -> Result<usize, MdsError> {
        let mut rebuilt = HashMap::new();
        for ino in 0..self.alloc.total_inodes() {
            if !self.alloc.is_allocated(ino) {
                continue;
            }
            let inode = match self.store.read(ino) {
                Ok(inode) => inode,
                Err(err) => {
                    warn!(ino, "skipping unreadable slot during rebuild: {err}");
                    continue;
                }
            };
            if inode.filename.is_empty() {
                continue;
            }
            rebuilt.insert(inode.filename.clone(), inode.ino);
        }
        let count = rebuilt.len();
        if let Some(kv) = &self.pathkv {
            kv.rebuild(&rebuilt)?;
        }
        *self.path_table.write().expect("path table poisoned") = rebuilt;
        info!(files = count, "inode table rebuilt from slot scan");
        Ok(count)
    }

    pub fn clear_inode_table(&self) {
        self.path_table
            .write()
            .expect("path table poisoned")
            .clear();
    }

    // ----- raw slot access -----

    pub fn read_inode(&self, ino: u64) -> Result<Inode, MdsError> {
        self.store.read(ino)
    }

    pub fn write_inode(&self, ino: u64, inode: &Inode) -> Result<(), MdsError> {
        self.store.write(ino, inode)
    }

    pub fn is_allocated(&self, ino: u64) -> bool {
        self.alloc.is_allocated(ino)
    }

    pub fn total_inodes(&self) -> u64 {
        self.alloc.total_inodes()
    }

    // ----- cold scans -----

    /// Point-in-time scan of allocated slots, sorted by the fa_time key.
    /// Takes no directory locks; concurrent updates can make the sample
    /// stale but never wrong-shaped.
    fn scan_atime_keys(&self) -> Vec<(u64, u32)> {
        let total = self.alloc.total_inodes();
        let mut keys = Vec::with_capacity(1024);
        for ino in 0..total {
            if !self.alloc.is_allocated(ino) {
                continue;
            }
            let Ok(inode) = self.store.read(ino) else {
                continue;
            };
            keys.push((ino, inode.fa_time.sort_key()));
        }
        // Stable sort: equal keys stay in ascending slot order.
        keys.sort_by_key(|&(_, key)| key);
        keys
    }

    pub fn collect_cold_inodes(&self, max_candidates: usize, _min_age_windows: u64) -> Vec<u64> {
        let keys = self.scan_atime_keys();
        keys.into_iter()
            .take(max_candidates)
            .map(|(ino, _)| ino)
            .collect()
    }

    /// The coldest ceil(percent% · allocated) slots, at least one when
    /// percent > 0 and anything is allocated.
    pub fn collect_cold_inodes_by_atime_percent(&self, percent: f64) -> Vec<u64> {
        if percent <= 0.0 {
            return Vec::new();
        }
        let keys = self.scan_atime_keys();
        if keys.is_empty() {
            return Vec::new();
        }
        let mut pick = ((percent / 100.0) * keys.len() as f64).ceil() as usize;
        pick = pick.clamp(1, keys.len());
        keys.into_iter().take(pick).map(|(ino, _)| ino).collect()
    }

    /// Bit set of size `total_inodes()` marking the cold slots. The
    /// selection percentage scales with the age window count.
    pub fn collect_cold_inodes_bitmap(&self, age_windows: u64) -> ColdBitmap {
        let mut bitmap = ColdBitmap::new(self.alloc.total_inodes());
        let percent = (age_windows as f64 * 20.0).clamp(0.0, 100.0);
        for ino in self.collect_cold_inodes_by_atime_percent(percent) {
            bitmap.set(ino);
        }
        bitmap
    }

    // ----- cluster bookkeeping -----

    pub fn register_node(&self, node: RegisteredNode) {
        let mut nodes = self.nodes.write().expect("node table poisoned");
        nodes.insert(node.node_id.clone(), node);
    }

    pub fn registered_nodes(&self) -> Vec<RegisteredNode> {
        let nodes = self.nodes.read().expect("node table poisoned");
        nodes.values().cloned().collect()
    }

    pub fn register_volume(
        &self,
        volume_id: &str,
        class: NodeClass,
        capacity_bytes: u64,
    ) -> usize {
        let blocks = capacity_bytes / VOLUME_BLOCK_BYTES;
        self.volume_registry
            .register(Arc::new(Volume::new(volume_id, class, blocks)))
    }

    pub fn volume_registry(&self) -> &Arc<VolumeRegistry> {
        &self.volume_registry
    }

    /// Node id and volume id bound to an inode, for FindInode replies.
    /// Virtual fleets use the `node_<class>_<index>` naming convention, so
    /// the packed location resolves directly; otherwise no node is named.
    pub fn locate(&self, inode: &Inode) -> (String, String) {
        let class = match inode.node_class {
            NodeClass::Ssd => "ssd",
            NodeClass::Hdd => "hdd",
            NodeClass::Mix => "mix",
        };
        let candidate = format!("node_{class}_{}", inode.node_index);
        let nodes = self.nodes.read().expect("node table poisoned");
        let node_id = if nodes.contains_key(&candidate) {
            candidate
        } else {
            String::new()
        };
        (node_id, inode.volume_id.clone())
    }
}
