//! Persistent inode allocator: one bit per slot in a bitmap file.

use crate::error::MdsError;
use crate::store::InodeStore;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Slots added when the bitmap runs out of clear bits.
const GROWTH_SLOTS: usize = 1024;

struct AllocState {
    bits: Vec<u8>,
    file: File,
}

/// Bitmap allocator over the inode store's slots. Bit `i` set means slot
/// `i` is live. Growth extends both the bitmap file and the slot file; the
/// new bits stay clear until an allocation commits, so a crash mid-growth
/// leaves no phantom inodes.
pub struct InodeAllocator {
    state: Mutex<AllocState>,
    store: Arc<InodeStore>,
}

impl InodeAllocator {
    pub fn open(
        path: impl AsRef<Path>,
        store: Arc<InodeStore>,
        create_new: bool,
    ) -> Result<Self, MdsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(create_new)
            .open(path.as_ref())?;
        let mut bits = Vec::new();
        file.read_to_end(&mut bits)?;

        let alloc = InodeAllocator {
            state: Mutex::new(AllocState { bits, file }),
            store,
        };
        {
            let mut state = alloc.state.lock().expect("allocator lock poisoned");
            if state.bits.is_empty() {
                alloc.grow_locked(&mut state)?;
            } else {
                // Keep the slot file at least as large as the bitmap claims.
                alloc.store.expand((state.bits.len() * 8) as u64)?;
            }
        }
        Ok(alloc)
    }

    /// First-fit allocation. Sets the bit, persists the touched bitmap
    /// byte and returns the slot index; grows when the map is full.
    pub fn allocate(&self) -> Result<u64, MdsError> {
        let mut state = self.state.lock().expect("allocator lock poisoned");
        loop {
            if let Some(ino) = Self::find_clear(&state.bits) {
                let byte = ino as usize / 8;
                state.bits[byte] |= 1 << (ino % 8);
                let value = [state.bits[byte]];
                state.file.write_all_at(&value, byte as u64)?;
                return Ok(ino);
            }
            self.grow_locked(&mut state)?;
        }
    }

    /// Clears the bit and persists the touched byte. Freeing a clear bit
    /// is a no-op.
    pub fn free(&self, ino: u64) -> Result<(), MdsError> {
        let mut state = self.state.lock().expect("allocator lock poisoned");
        let byte = ino as usize / 8;
        if byte >= state.bits.len() {
            return Ok(());
        }
        state.bits[byte] &= !(1 << (ino % 8));
        let value = [state.bits[byte]];
        state.file.write_all_at(&value, byte as u64)?;
        Ok(())
    }

    pub fn is_allocated(&self, ino: u64) -> bool {
        let state = self.state.lock().expect("allocator lock poisoned");
        let byte = ino as usize / 8;
        byte < state.bits.len() && state.bits[byte] & (1 << (ino % 8)) != 0
    }

    /// Current capacity in slots (bitmap bits).
    pub fn total_inodes(&self) -> u64 {
        let state = self.state.lock().expect("allocator lock poisoned");
        (state.bits.len() * 8) as u64
    }

    pub fn allocated_count(&self) -> u64 {
        let state = self.state.lock().expect("allocator lock poisoned");
        state.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    fn find_clear(bits: &[u8]) -> Option<u64> {
        for (i, byte) in bits.iter().enumerate() {
            if *byte != 0xFF {
                let bit = byte.trailing_ones() as u64;
                return Some(i as u64 * 8 + bit);
            }
        }
        None
    }

    fn grow_locked(&self, state: &mut AllocState) -> Result<(), MdsError> {
        let old_bytes = state.bits.len();
        let new_bytes = old_bytes + GROWTH_SLOTS / 8;
        state.bits.resize(new_bytes, 0);
        state
            .file
            .write_all_at(&state.bits[old_bytes..], old_bytes as u64)?;
        self.store.expand((new_bytes * 8) as u64)?;
        Ok(())
    }
}
