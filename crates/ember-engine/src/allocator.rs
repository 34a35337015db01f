use crate::{ElementType, EngineError, Location, Result};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Alignment of every buffer, enough for any element type and for SIMD loads
pub const ALIGNMENT: usize = 64;

/// Name under which the host allocator is registered
pub const HOST_ALLOCATOR: &str = "cpu";

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Line([u8; ALIGNMENT]);

// SAFETY: a byte array with no padding, every bit pattern is valid
unsafe impl Zeroable for Line {}
unsafe impl Pod for Line {}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

static ALLOCATORS: OnceLock<Mutex<HashMap<(String, Location), Arc<Allocator>>>> = OnceLock::new();

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
    pub allocation_count: u64,
    pub live_buffers: usize,
    pub limit: Option<usize>,
}

/// Thread-safe allocator for one (provider, location) pair
///
/// Allocators are shared process-wide through [`Allocator::global`] and
/// outlive every session that uses them.
pub struct Allocator {
    name: String,
    location: Location,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
    live: AtomicUsize,
    // 0 means unlimited
    limit: AtomicUsize,
}

impl Allocator {
    /// Create a standalone allocator that is not shared through the process registry
    pub fn new(name: impl Into<String>, location: Location) -> Arc<Allocator> {
        Arc::new(Allocator {
            name: name.into(),
            location,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
        })
    }

    /// Process-wide allocator for a provider name and location
    pub fn global(name: &str, location: Location) -> Arc<Allocator> {
        let registry = ALLOCATORS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .entry((name.to_string(), location))
            .or_insert_with(|| Allocator::new(name, location))
            .clone()
    }

    /// Process-wide host allocator
    pub fn host() -> Arc<Allocator> {
        Allocator::global(HOST_ALLOCATOR, Location::Host)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Cap the bytes this allocator may hand out, `None` removes the cap
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit.store(limit.unwrap_or(0), Ordering::SeqCst);
    }

    pub fn stats(&self) -> AllocatorStats {
        let limit = self.limit.load(Ordering::SeqCst);
        AllocatorStats {
            bytes_in_use: self.in_use.load(Ordering::SeqCst),
            peak_bytes: self.peak.load(Ordering::SeqCst),
            allocation_count: self.allocations.load(Ordering::SeqCst),
            live_buffers: self.live.load(Ordering::SeqCst),
            limit: (limit != 0).then_some(limit),
        }
    }

    /// Allocate a zeroed buffer of `size` bytes
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an alignment that is not a power of two
    /// or exceeds [`ALIGNMENT`], and `AllocationFailure` when the limit would
    /// be exceeded or the memory cannot be obtained.
    pub fn allocate(self: &Arc<Self>, size: usize, alignment: usize) -> Result<Buffer> {
        if !alignment.is_power_of_two() || alignment > ALIGNMENT {
            return Err(EngineError::invalid_argument(format!(
                "unsupported alignment {} (must be a power of two up to {})",
                alignment, ALIGNMENT
            )));
        }

        let lines = size.div_ceil(ALIGNMENT);
        let capacity = match lines.checked_mul(ALIGNMENT) {
            Some(capacity) if capacity <= isize::MAX as usize => capacity,
            _ => {
                return Err(EngineError::AllocationFailure {
                    requested: size,
                    allocator: self.describe(),
                    reason: "size exceeds the addressable range".to_string(),
                });
            }
        };
        self.reserve(capacity)?;

        let mut storage: Vec<Line> = Vec::new();
        if let Err(e) = storage.try_reserve_exact(lines) {
            self.release(capacity);
            return Err(EngineError::AllocationFailure {
                requested: size,
                allocator: self.describe(),
                reason: e.to_string(),
            });
        }
        storage.resize(lines, Line::zeroed());

        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Buffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            lines: storage,
            len: size,
            allocator: Arc::clone(self),
        })
    }

    /// Return a buffer to this allocator
    pub fn free(&self, buffer: Buffer) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&buffer.allocator)));
        drop(buffer);
    }

    /// Failure for a tensor whose byte size can't be represented
    pub(crate) fn oversized(&self, element_type: ElementType, shape: &[usize]) -> EngineError {
        EngineError::AllocationFailure {
            requested: usize::MAX,
            allocator: self.describe(),
            reason: format!(
                "{} tensor of shape {:?} overflows the addressable size",
                element_type, shape
            ),
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let limit = self.limit.load(Ordering::SeqCst);
        let mut current = self.in_use.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(bytes);
            if limit != 0 && next > limit {
                return Err(EngineError::AllocationFailure {
                    requested: bytes,
                    allocator: self.describe(),
                    reason: format!("limit of {} bytes reached ({} in use)", limit, current),
                });
            }
            match self
                .in_use
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::SeqCst);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.name, self.location)
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Contiguous 64-byte aligned memory region owned by one allocator
///
/// The region is returned to its allocator when the buffer is dropped.
pub struct Buffer {
    id: u64,
    lines: Vec<Line>,
    len: usize,
    allocator: Arc<Allocator>,
}

impl Buffer {
    /// Identity of the allocation, stable for the buffer's lifetime
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.lines.len() * ALIGNMENT
    }

    pub fn location(&self) -> Location {
        self.allocator.location
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Line, u8>(&self.lines)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<Line, u8>(&mut self.lines)[..len]
    }

    /// Reinterpret the buffer for a new payload size without reallocating
    pub(crate) fn resize_within(&mut self, len: usize) -> bool {
        if len <= self.capacity() {
            self.len = len;
            true
        } else {
            false
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.allocator.release(self.lines.len() * ALIGNMENT);
        self.allocator.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("location", &self.location())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_aligned_and_zeroed() {
        let alloc = Allocator::new("test", Location::Host);
        let buffer = alloc.allocate(100, 16).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 128);
        assert_eq!(buffer.as_bytes().as_ptr() as usize % ALIGNMENT, 0);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resize_within_capacity() {
        let alloc = Allocator::new("test", Location::Host);
        let mut buffer = alloc.allocate(10, 8).unwrap();
        assert!(buffer.resize_within(64));
        assert_eq!(buffer.as_bytes().len(), 64);
        assert!(!buffer.resize_within(65));
    }

    #[test]
    fn test_zero_size_allocation() {
        let alloc = Allocator::new("test", Location::Host);
        let buffer = alloc.allocate(0, 1).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(alloc.stats().bytes_in_use, 0);
        assert_eq!(alloc.stats().live_buffers, 1);
    }

    #[test]
    fn test_unaddressable_size_fails_cleanly() {
        let alloc = Allocator::new("test", Location::Host);
        let err = alloc.allocate(usize::MAX, 8).unwrap_err();
        assert!(matches!(err, EngineError::AllocationFailure { .. }));
        assert_eq!(alloc.stats().bytes_in_use, 0);
        assert_eq!(alloc.stats().live_buffers, 0);
    }
}
