//! Stable-address allocator
//!
//! An `Arena` hands out zero-filled memory whose address never changes while
//! the allocation is live, addressed by a caller-chosen key. Callers free by
//! key; the arena owns the memory and callers only ever hold views.
//!
//! # Memory Safety
//!
//! - Every reservation is made with an explicit `Layout` and released with
//!   the same layout
//! - A key names at most one live allocation, so two live buffers never
//!   alias one key
//! - Dereferencing a view after `free` is undefined behavior; the arena
//!   cannot detect it
//! - Dropping the arena releases everything still live

use crate::buffer::{ByteBuffer, StableView};
use crate::error::{FfiError, FfiResult};
use crate::events::{EventLogger, FfiEvent, NullEventLogger};
use parking_lot::Mutex;
use std::alloc::{self, Layout};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle state of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationState {
    Allocated,
    Freed,
}

/// Snapshot of one allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord<K> {
    pub key: K,
    /// Base address fixed at allocation time
    pub address: usize,
    pub size: usize,
    pub alignment: usize,
    pub state: AllocationState,
}

/// One live reservation
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    size: usize,
}

// Safety: a block is only reachable through the arena's lock.
unsafe impl Send for Block {}

impl Block {
    fn view(&self) -> StableView {
        StableView::new(self.ptr, self.size)
    }

    fn record<K>(&self, key: K, state: AllocationState) -> AllocationRecord<K> {
        AllocationRecord {
            key,
            address: self.ptr.as_ptr() as usize,
            size: self.size,
            alignment: self.layout.align(),
            state,
        }
    }

    /// # Safety
    ///
    /// Must be called exactly once, with no live views dereferenced afterwards.
    unsafe fn release(self) {
        alloc::dealloc(self.ptr.as_ptr(), self.layout);
    }
}

struct ArenaTable<K> {
    live: HashMap<K, Block>,
    live_bytes: usize,
}

/// Keyed allocator of stable-address memory
///
/// # Example
///
/// ```
/// # use atlas_ffi::Arena;
/// let arena = Arena::new();
/// let buf = arena.allocate("out", 16, 8).unwrap();
/// assert!(buf.is_stable());
/// assert_eq!(buf.address() % 8, 0);
/// assert_eq!(arena.address_of_key(&"out"), Some(buf.address()));
///
/// arena.free(&"out");
/// arena.free(&"out"); // no-op
/// assert!(!arena.contains(&"out"));
/// ```
pub struct Arena<K> {
    table: Mutex<ArenaTable<K>>,
    max_live_bytes: Option<usize>,
    events: Arc<dyn EventLogger>,
}

impl<K> Arena<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an arena with no live-bytes budget
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ArenaTable {
                live: HashMap::new(),
                live_bytes: 0,
            }),
            max_live_bytes: None,
            events: Arc::new(NullEventLogger),
        }
    }

    /// Cap the total bytes live at once
    pub fn with_limit(mut self, max_live_bytes: Option<usize>) -> Self {
        self.max_live_bytes = max_live_bytes;
        self
    }

    /// Record allocation events to `events`
    pub fn with_logger(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    pub fn max_live_bytes(&self) -> Option<usize> {
        self.max_live_bytes
    }

    /// Reserve `size` zeroed bytes aligned to `alignment` under `key`
    ///
    /// A zero-byte request still gets a unique aligned address, backed by a
    /// one-byte reservation; the returned view has length 0.
    pub fn allocate(&self, key: K, size: usize, alignment: usize) -> FfiResult<ByteBuffer> {
        match self.try_allocate(&key, size, alignment) {
            Ok(view) => {
                debug!(key = ?key, address = view.address(), size, alignment, "allocated");
                self.events.log(FfiEvent::Allocated {
                    key: format!("{:?}", key),
                    address: view.address(),
                    size,
                    alignment,
                });
                Ok(ByteBuffer::from(view))
            }
            Err(e) => {
                warn!(key = ?key, size, alignment, error = %e, "allocation rejected");
                self.events.log(FfiEvent::AllocationRejected {
                    key: format!("{:?}", key),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn try_allocate(&self, key: &K, size: usize, alignment: usize) -> FfiResult<StableView> {
        if !alignment.is_power_of_two() {
            return Err(FfiError::InvalidAlignment(alignment));
        }

        let mut table = self.table.lock();
        if table.live.contains_key(key) {
            return Err(FfiError::DuplicateKey(format!("{:?}", key)));
        }
        if let Some(limit) = self.max_live_bytes {
            if table.live_bytes.saturating_add(size) > limit {
                return Err(FfiError::ArenaExhausted {
                    requested: size,
                    live: table.live_bytes,
                    limit,
                });
            }
        }

        let failed = FfiError::AllocationFailed { size, alignment };
        let layout = Layout::from_size_align(size.max(1), alignment).map_err(|_| failed.clone())?;
        // Safety: the layout has nonzero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(failed)?;

        let block = Block { ptr, layout, size };
        let view = block.view();
        table.live.insert(key.clone(), block);
        table.live_bytes += size;
        Ok(view)
    }

    /// Release the allocation under `key`
    ///
    /// Unknown or already-freed keys are a no-op and return `None`. Views
    /// obtained earlier must not be dereferenced after this returns.
    pub fn free<Q>(&self, key: &Q) -> Option<AllocationRecord<K>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let entry = {
            let mut table = self.table.lock();
            let entry = table.live.remove_entry(key);
            if let Some((_, block)) = &entry {
                table.live_bytes -= block.size;
            }
            entry
        };

        let Some((key, block)) = entry else {
            debug!(key = ?key, "free of unknown key ignored");
            self.events.log(FfiEvent::FreeIgnored {
                key: format!("{:?}", key),
            });
            return None;
        };

        let record = block.record(key, AllocationState::Freed);
        // Safety: the block was just removed from the table, so this is its only release.
        unsafe { block.release() };

        debug!(key = ?record.key, address = record.address, size = record.size, "freed");
        self.events.log(FfiEvent::Freed {
            key: format!("{:?}", record.key),
            address: record.address,
            size: record.size,
        });
        Some(record)
    }

    /// Fresh view of a live allocation
    pub fn view<Q>(&self, key: &Q) -> Option<StableView>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.lock().live.get(key).map(Block::view)
    }

    /// Base address of a live allocation
    pub fn address_of_key<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.view(key).map(|view| view.address())
    }

    /// Snapshot of a live allocation
    pub fn record<Q>(&self, key: &Q) -> Option<AllocationRecord<K>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table
            .lock()
            .live
            .get_key_value(key)
            .map(|(key, block)| block.record(key.clone(), AllocationState::Allocated))
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.lock().live.contains_key(key)
    }

    /// Number of live allocations
    pub fn live_count(&self) -> usize {
        self.table.lock().live.len()
    }

    /// Sum of requested sizes over live allocations
    pub fn live_bytes(&self) -> usize {
        self.table.lock().live_bytes
    }
}

impl<K> Default for Arena<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debug for Arena<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("Arena")
            .field("live_count", &table.live.len())
            .field("live_bytes", &table.live_bytes)
            .field("max_live_bytes", &self.max_live_bytes)
            .finish()
    }
}

impl<K> Drop for Arena<K> {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        let count = table.live.len();
        for (_, block) in table.live.drain() {
            // Safety: each block leaves the table exactly once here.
            unsafe { block.release() };
        }
        table.live_bytes = 0;
        if count > 0 {
            debug!(count, "arena dropped with live allocations");
        }
    }
}

/// Address of a buffer
///
/// Stable buffers report the address fixed at allocation time on every call.
/// For ephemeral buffers the result is implementation-defined and may differ
/// between calls.
pub fn address_of(buffer: &ByteBuffer) -> usize {
    buffer.address()
}
