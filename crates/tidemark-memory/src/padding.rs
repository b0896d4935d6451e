//! Filler allocations that make usage look higher than it is.
//!
//! The host reports a threshold crossing at a fixed usage level. Holding a
//! reserve of filler segments moves real usage closer to that level so the
//! crossing fires earlier and more predictably, and releasing the filler
//! right before eviction hands that memory back for cleanup work.

use crate::settings::MB;

pub const MAX_SEGMENTS: usize = 100;
pub const MAX_SEGMENT_SIZE: u64 = 32 * MB;
pub const MAX_PADDING_SIZE: u64 = MAX_SEGMENTS as u64 * MAX_SEGMENT_SIZE;

pub(crate) struct Padding {
    segment_size: usize,
    max_growth_percent: u8,
    segments: Vec<Option<Box<[u8]>>>,
}

impl Padding {
    pub(crate) fn new(segment_size: u64, max_growth_percent: u8) -> Self {
        Self {
            segment_size: segment_size.min(MAX_SEGMENT_SIZE) as usize,
            max_growth_percent,
            segments: (0..MAX_SEGMENTS).map(|_| None).collect(),
        }
    }

    /// Segment size giving `margin_percent` of `max_memory` across all slots.
    pub(crate) fn segment_size_for(max_memory: u64, margin_percent: u8) -> u64 {
        let margin = (max_memory as u128) * (margin_percent as u128) / 100;
        ((margin / MAX_SEGMENTS as u128) as u64).min(MAX_SEGMENT_SIZE)
    }

    pub(crate) fn segment_size(&self) -> u64 {
        self.segment_size as u64
    }

    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.segment_size() * MAX_SEGMENTS as u64
    }

    pub(crate) fn pinned(&self) -> usize {
        self.segments.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.pinned() as u64 * self.segment_size()
    }

    /// Segments that may be pinned or released in one cycle.
    pub(crate) fn max_step(&self) -> usize {
        (MAX_SEGMENTS * self.max_growth_percent as usize / 100).max(1)
    }

    /// Drop every segment at once; returns the bytes released.
    pub(crate) fn release_all(&mut self) -> u64 {
        let released = self.bytes();
        self.segments.iter_mut().for_each(|segment| *segment = None);
        released
    }

    /// Move the pinned reserve towards `desired_bytes`, bounded by
    /// [`Padding::max_step`]. Returns the number of segments now pinned.
    pub(crate) fn adjust(&mut self, desired_bytes: u64) -> usize {
        if self.segment_size == 0 {
            return 0;
        }
        let desired = desired_bytes
            .div_ceil(self.segment_size())
            .min(MAX_SEGMENTS as u64) as usize;
        let current = self.pinned();
        let target = next_pinned(current, desired, self.max_step());

        if target > current {
            for slot in self.segments.iter_mut().filter(|s| s.is_none()).take(target - current) {
                match allocate_segment(self.segment_size) {
                    Some(segment) => *slot = Some(segment),
                    None => {
                        tracing::debug!(
                            target: "tidemark.memory",
                            segment_size = self.segment_size,
                            "padding segment allocation failed; leaving reserve short"
                        );
                        break;
                    }
                }
            }
        } else if target < current {
            for slot in self
                .segments
                .iter_mut()
                .rev()
                .filter(|s| s.is_some())
                .take(current - target)
            {
                *slot = None;
            }
        }

        self.pinned()
    }
}

/// One bounded step from `current` towards `desired`.
pub(crate) fn next_pinned(current: usize, desired: usize, max_step: usize) -> usize {
    if desired > current {
        current + (desired - current).min(max_step)
    } else {
        current - (current - desired).min(max_step)
    }
}

fn allocate_segment(size: usize) -> Option<Box<[u8]>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).ok()?;
    // Filling (rather than relying on zeroed pages) makes the segment resident.
    buffer.resize(size, 0xA5);
    Some(buffer.into_boxed_slice())
}

impl std::fmt::Debug for Padding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Padding")
            .field("segment_size", &self.segment_size)
            .field("pinned", &self.pinned())
            .finish()
    }
}
