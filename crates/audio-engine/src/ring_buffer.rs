//! Multi-channel circular frame store shared by the decode producer and the
//! real-time render consumer.
//!
//! Frames are addressed by absolute 64-bit positions. At any instant the valid
//! positions form the half-open interval `[start, end)` with
//! `end - start <= capacity`; anything outside is reported as a typed error.
//!
//! ## Synchronization
//! - Storage lives behind a [`parking_lot::RwLock`]. The producer takes shared
//!   access, [`RingBuffer::allocate`] takes exclusive access, and
//!   [`RingBuffer::fetch`] only ever calls `try_read`, so the render thread never
//!   waits.
//! - Bytes are stored as relaxed atomics. Bounds are published with release
//!   stores after the data, and the reader re-checks the bounds (and a restart
//!   epoch) after copying, seqlock style, to catch frames overwritten mid-copy.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};

use parking_lot::RwLock;

use crate::error::RingBufferError;

/// Largest capacity accepted by [`RingBuffer::allocate`], in frames.
pub const MAX_CAPACITY_FRAMES: u32 = 1 << 24;

pub struct RingBuffer {
    storage: RwLock<Storage>,
    start: AtomicU64,
    end: AtomicU64,
    read_pos: AtomicU64,
    epoch: AtomicU64,
}

struct Storage {
    buffers: Vec<Box<[AtomicU8]>>,
    bytes_per_frame: usize,
    capacity: u64,
}

impl Storage {
    fn empty() -> Self {
        Self {
            buffers: Vec::new(),
            bytes_per_frame: 0,
            capacity: 0,
        }
    }

    fn is_allocated(&self) -> bool {
        self.capacity > 0
    }

    fn check_lengths<I>(&self, lens: I, frames: u64) -> Result<(), RingBufferError>
    where
        I: ExactSizeIterator<Item = usize>,
    {
        if lens.len() != self.buffers.len() {
            return Err(RingBufferError::LayoutMismatch);
        }
        let needed = frames as usize * self.bytes_per_frame;
        for len in lens {
            if len < needed {
                return Err(RingBufferError::LayoutMismatch);
            }
        }
        Ok(())
    }

    /// Ring byte ranges covering `frames` frames starting at `pos`: the run up to
    /// the physical end of storage and the wrapped remainder.
    fn spans(&self, pos: u64, frames: u64) -> (usize, usize, usize) {
        let offset = (pos & (self.capacity - 1)) as usize * self.bytes_per_frame;
        let total = frames as usize * self.bytes_per_frame;
        let ring_len = self.capacity as usize * self.bytes_per_frame;
        let first = total.min(ring_len - offset);
        (offset, first, total - first)
    }

    /// Copy frames into the ring; `None` writes silence.
    fn write_from<B: AsRef<[u8]>>(&self, src: Option<&[B]>, pos: u64, frames: u64) {
        let (offset, first, wrapped) = self.spans(pos, frames);
        for (index, ring) in self.buffers.iter().enumerate() {
            let bytes = src.map(|s| &s[index].as_ref()[..first + wrapped]);
            for i in 0..first {
                ring[offset + i].store(bytes.map_or(0, |b| b[i]), Ordering::Relaxed);
            }
            for i in 0..wrapped {
                ring[i].store(bytes.map_or(0, |b| b[first + i]), Ordering::Relaxed);
            }
        }
    }

    /// Copy frames out of the ring into `dst` starting `dst_frame` frames in.
    fn read_into<B: AsMut<[u8]>>(&self, dst: &mut [B], dst_frame: usize, pos: u64, frames: u64) {
        let (offset, first, wrapped) = self.spans(pos, frames);
        let base = dst_frame * self.bytes_per_frame;
        for (ring, out) in self.buffers.iter().zip(dst.iter_mut()) {
            let out = &mut out.as_mut()[base..base + first + wrapped];
            for i in 0..first {
                out[i] = ring[offset + i].load(Ordering::Relaxed);
            }
            for i in 0..wrapped {
                out[first + i] = ring[i].load(Ordering::Relaxed);
            }
        }
    }
}

fn zero_frames<B: AsMut<[u8]>>(dst: &mut [B], bytes_per_frame: usize, frames: Range<u64>) {
    let range = frames.start as usize * bytes_per_frame..frames.end as usize * bytes_per_frame;
    for out in dst.iter_mut() {
        let out = out.as_mut();
        let end = range.end.min(out.len());
        if range.start < end {
            out[range.start..end].fill(0);
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// An unallocated ring; every store/fetch fails with `NotAllocated`.
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(Storage::empty()),
            start: AtomicU64::new(0),
            end: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// (Re)size storage for `buffer_count` buffers of `bytes_per_frame` bytes.
    ///
    /// `capacity_frames` is rounded up to a power of two. All previously valid
    /// positions are discarded. Waits for an in-flight store to finish.
    pub fn allocate(
        &self,
        buffer_count: u32,
        bytes_per_frame: u32,
        capacity_frames: u32,
    ) -> Result<(), RingBufferError> {
        if buffer_count == 0 {
            return Err(RingBufferError::InvalidAllocation("buffer count is zero"));
        }
        if bytes_per_frame == 0 {
            return Err(RingBufferError::InvalidAllocation("bytes per frame is zero"));
        }
        if capacity_frames == 0 || capacity_frames > MAX_CAPACITY_FRAMES {
            return Err(RingBufferError::InvalidAllocation(
                "capacity must be between 1 and 2^24 frames",
            ));
        }

        let capacity = capacity_frames.next_power_of_two() as u64;
        let bytes = capacity as usize * bytes_per_frame as usize;

        let mut storage = self.storage.write();
        storage.buffers = (0..buffer_count)
            .map(|_| (0..bytes).map(|_| AtomicU8::new(0)).collect())
            .collect();
        storage.bytes_per_frame = bytes_per_frame as usize;
        storage.capacity = capacity;

        self.epoch.fetch_add(1, Ordering::Relaxed);
        self.start.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Capacity in frames, 0 when unallocated.
    pub fn capacity_frames(&self) -> u64 {
        self.storage.read().capacity
    }

    pub fn buffer_count(&self) -> usize {
        self.storage.read().buffers.len()
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.storage.read().bytes_per_frame
    }

    /// Drop every stored frame but keep the allocation.
    pub fn clear(&self) {
        self.restart_at(0);
    }

    /// Currently fetchable positions.
    pub fn valid_range(&self) -> Range<u64> {
        let end = self.end.load(Ordering::Acquire);
        let start = self.start.load(Ordering::Acquire);
        start..end
    }

    /// Copy `frames` frames from `buffers` to absolute position `start_pos`.
    ///
    /// Appending at the current write position is the normal case. A forward gap
    /// shorter than the capacity is filled with silence; a backward write, a
    /// larger gap, or the first write after `allocate` restarts the valid
    /// interval at `start_pos`.
    ///
    /// `Err(Overrun)` means the data *was* written but frames the reader had not
    /// fetched yet were overwritten.
    pub fn store<B: AsRef<[u8]>>(
        &self,
        buffers: &[B],
        frames: u32,
        start_pos: u64,
    ) -> Result<(), RingBufferError> {
        let storage = self.storage.read();
        if !storage.is_allocated() {
            return Err(RingBufferError::NotAllocated);
        }
        let frames = frames as u64;
        if frames == 0 {
            return Ok(());
        }
        if frames > storage.capacity {
            return Err(RingBufferError::TooMuch {
                requested: frames,
                capacity: storage.capacity,
            });
        }
        storage.check_lengths(buffers.iter().map(|b| b.as_ref().len()), frames)?;
        if start_pos.checked_add(frames).is_none() {
            return Err(RingBufferError::TooMuch {
                requested: frames,
                capacity: u64::MAX - start_pos,
            });
        }

        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);

        if start == end || start_pos < end || start_pos - end >= storage.capacity {
            self.restart_at(start_pos);
        } else if start_pos > end {
            self.append::<B>(&storage, None, end, start_pos - end);
        }

        let before = self.start.load(Ordering::Relaxed);
        self.append(&storage, Some(buffers), start_pos, frames);
        let after = self.start.load(Ordering::Relaxed);

        let consumed = self.read_pos.load(Ordering::Relaxed).max(before);
        let lost = after.saturating_sub(consumed);
        if lost > 0 {
            return Err(RingBufferError::Overrun { lost });
        }
        Ok(())
    }

    fn restart_at(&self, pos: u64) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        self.start.store(pos, Ordering::Relaxed);
        self.end.store(pos, Ordering::Relaxed);
        self.read_pos.store(pos, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    fn append<B: AsRef<[u8]>>(&self, storage: &Storage, src: Option<&[B]>, pos: u64, frames: u64) {
        let new_end = pos + frames;
        let old_start = self.start.load(Ordering::Relaxed);
        let new_start = old_start.max(new_end.saturating_sub(storage.capacity));
        if new_start != old_start {
            self.start.store(new_start, Ordering::Relaxed);
        }
        // Readers that observe any byte below must also observe the new start.
        fence(Ordering::Release);
        storage.write_from(src, pos, frames);
        self.end.store(new_end, Ordering::Release);
    }

    /// Copy `frames` frames starting at absolute position `start_pos` into `buffers`.
    ///
    /// Never blocks and never allocates. When any requested frame is outside the
    /// valid interval:
    /// - `allow_partial == false`: fails with `Underrun` and zero-fills the first
    ///   `frames` frames of every output buffer.
    /// - `allow_partial == true`: copies the valid intersection, zero-fills the
    ///   rest, and returns how many frames were copied.
    pub fn fetch<B: AsMut<[u8]>>(
        &self,
        buffers: &mut [B],
        frames: u32,
        start_pos: u64,
        allow_partial: bool,
    ) -> Result<u32, RingBufferError> {
        let Some(storage) = self.storage.try_read() else {
            return Err(RingBufferError::Reallocating);
        };
        if !storage.is_allocated() {
            return Err(RingBufferError::NotAllocated);
        }
        let frames = frames as u64;
        if frames == 0 {
            return Ok(0);
        }
        if frames > storage.capacity {
            return Err(RingBufferError::TooMuch {
                requested: frames,
                capacity: storage.capacity,
            });
        }
        storage.check_lengths(buffers.iter_mut().map(|b| b.as_mut().len()), frames)?;

        let epoch = self.epoch.load(Ordering::Acquire);
        let valid_end = self.end.load(Ordering::Acquire);
        let valid_start = self.start.load(Ordering::Acquire);
        let Some(req_end) = start_pos.checked_add(frames) else {
            zero_frames(buffers, storage.bytes_per_frame, 0..frames);
            if allow_partial {
                return Ok(0);
            }
            return Err(RingBufferError::Underrun {
                start: start_pos,
                end: u64::MAX,
                valid_start,
                valid_end,
            });
        };

        let copy_start = start_pos.max(valid_start);
        let copy_end = req_end.min(valid_end);
        let complete = copy_start == start_pos && copy_end == req_end;

        let underrun = RingBufferError::Underrun {
            start: start_pos,
            end: req_end,
            valid_start,
            valid_end,
        };

        if !complete && (!allow_partial || copy_start >= copy_end) {
            zero_frames(buffers, storage.bytes_per_frame, 0..frames);
            return if allow_partial { Ok(0) } else { Err(underrun) };
        }

        let dst_frame = (copy_start - start_pos) as usize;
        storage.read_into(buffers, dst_frame, copy_start, copy_end - copy_start);

        fence(Ordering::Acquire);
        let overwritten = self.epoch.load(Ordering::Relaxed) != epoch
            || self.start.load(Ordering::Relaxed) > copy_start;
        if overwritten {
            zero_frames(buffers, storage.bytes_per_frame, 0..frames);
            return Err(underrun);
        }

        if !complete {
            zero_frames(buffers, storage.bytes_per_frame, 0..copy_start - start_pos);
            zero_frames(
                buffers,
                storage.bytes_per_frame,
                copy_end - start_pos..frames,
            );
        }

        self.read_pos.fetch_max(copy_end, Ordering::Relaxed);
        Ok((copy_end - copy_start) as u32)
    }
}
