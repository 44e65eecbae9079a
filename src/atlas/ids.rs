//! Id allocation shared by the maps of one atlas.
//!
//! Each entity kind has its own monotonically increasing counter. The
//! registry is owned by the atlas and passed into every
//! [`Map`](crate::atlas::map::Map).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::map::{KeyFrameId, MapId, MapLineId, MapPointId};

/// Lock-free monotonically increasing id counter.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Hand out the next id. Never returns the same value twice unless the
    /// allocator is explicitly [`reset`](Self::reset).
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Make sure `id` is never handed out again.
    ///
    /// Used after loading persisted entities whose ids were allocated by a
    /// previous process.
    pub fn advance_past(&self, id: u64) {
        self.next.fetch_max(id.saturating_add(1), Ordering::SeqCst);
    }

    pub fn reset(&self, start: u64) {
        self.next.store(start, Ordering::SeqCst);
    }
}

/// One allocator per entity kind.
#[derive(Debug, Default)]
pub struct IdRegistry {
    pub maps: IdAllocator,
    pub keyframes: IdAllocator,
    pub map_points: IdAllocator,
    pub map_lines: IdAllocator,
}

impl IdRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn next_map_id(&self) -> MapId {
        MapId::new(self.maps.allocate())
    }

    pub fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.keyframes.allocate())
    }

    pub fn next_map_point_id(&self) -> MapPointId {
        MapPointId::new(self.map_points.allocate())
    }

    pub fn next_map_line_id(&self) -> MapLineId {
        MapLineId::new(self.map_lines.allocate())
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.maps.reset(0);
        self.keyframes.reset(0);
        self.map_points.reset(0);
        self.map_lines.reset(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocate_sequential() {
        let alloc = IdAllocator::new(5);
        assert_eq!(alloc.allocate(), 5);
        assert_eq!(alloc.allocate(), 6);
        assert_eq!(alloc.peek(), 7);
    }

    #[test]
    fn test_advance_past_never_goes_back() {
        let alloc = IdAllocator::new(10);
        alloc.advance_past(3);
        assert_eq!(alloc.peek(), 10);
        alloc.advance_past(20);
        assert_eq!(alloc.peek(), 21);
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        let registry = IdRegistry::new();
        let ids: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let registry = &registry;
                    s.spawn(move || {
                        (0..500)
                            .map(|_| registry.next_map_point_id().0)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("allocator thread panicked"))
                .collect()
        });

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(registry.map_points.peek(), 4000);
    }

    #[test]
    fn test_reset() {
        let registry = IdRegistry::new();
        registry.next_keyframe_id();
        registry.next_map_line_id();
        registry.reset();
        assert_eq!(registry.next_keyframe_id(), KeyFrameId::new(0));
        assert_eq!(registry.next_map_line_id(), MapLineId::new(0));
    }
}
