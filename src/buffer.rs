//! Fixed frame-buffer pool and the lease handed to consumers.
//!
//! Every buffer is owned by exactly one party at a time. The engine fills an
//! engine-owned buffer, then moves it into a [`FrameLease`]; the bytes are
//! never copied on the way to the consumer. Dropping or releasing the lease
//! moves the buffer back to the engine and wakes the capture thread.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::engine::Shared;
use crate::format::ActualFormat;
use crate::traits::{Frame, FrameMetadata};

/// Who currently owns a pool buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Free for, or being filled by, the capture thread.
    Engine,
    /// Delivered and not yet released.
    Consumer,
}

#[derive(Debug)]
struct Slot {
    owner: Owner,
    // `None` while the engine is filling it or a consumer holds it.
    data: Option<Vec<u8>>,
}

/// Snapshot of buffer ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of buffers in the pool.
    pub size: usize,
    /// Buffers owned by the capture engine.
    pub engine_owned: usize,
    /// Buffers held by the consumer.
    pub consumer_owned: usize,
}

/// Fixed set of frame buffers, allocated once per open camera.
#[derive(Debug)]
pub struct FramePool {
    slots: Vec<Slot>,
    buffer_bytes: usize,
}

impl FramePool {
    /// Allocate `count` buffers of `buffer_bytes` each.
    pub fn new(count: usize, buffer_bytes: usize) -> Self {
        let slots = (0..count.max(1))
            .map(|_| Slot {
                owner: Owner::Engine,
                data: Some(vec![0; buffer_bytes]),
            })
            .collect();
        Self {
            slots,
            buffer_bytes,
        }
    }

    /// Number of buffers.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Capacity of each buffer in bytes.
    pub const fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Engine-owned buffers that are ready to be filled.
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner == Owner::Engine && slot.data.is_some())
            .count()
    }

    /// Current ownership split.
    pub fn status(&self) -> PoolStatus {
        let consumer_owned = self
            .slots
            .iter()
            .filter(|slot| slot.owner == Owner::Consumer)
            .count();
        PoolStatus {
            size: self.slots.len(),
            engine_owned: self.slots.len() - consumer_owned,
            consumer_owned,
        }
    }

    /// Grow buffers to hold at least `bytes`. Buffers held by a consumer are
    /// grown when they come back.
    pub fn ensure_capacity(&mut self, bytes: usize) {
        if bytes <= self.buffer_bytes {
            return;
        }
        log::debug!("growing frame buffers {} -> {bytes} bytes", self.buffer_bytes);
        self.buffer_bytes = bytes;
        for data in self.slots.iter_mut().filter_map(|slot| slot.data.as_mut()) {
            data.resize(bytes, 0);
        }
    }

    /// Take a free buffer for filling. It stays engine-owned.
    pub fn checkout(&mut self) -> Option<(usize, Vec<u8>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.owner == Owner::Engine && slot.data.is_some())
            .and_then(|(index, slot)| slot.data.take().map(|data| (index, data)))
    }

    /// Return a checked-out buffer that was not delivered.
    pub fn checkin(&mut self, index: usize, data: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.data = Some(data);
        }
    }

    /// Transfer a checked-out buffer to the consumer.
    pub fn deliver(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.owner = Owner::Consumer;
        }
    }

    /// Take a buffer back from the consumer.
    pub fn release(&mut self, index: usize, mut data: Vec<u8>) {
        if data.len() < self.buffer_bytes {
            data.resize(self.buffer_bytes, 0);
        }
        if let Some(slot) = self.slots.get_mut(index) {
            slot.owner = Owner::Engine;
            slot.data = Some(data);
        }
    }
}

/// A delivered frame. The buffer belongs to the consumer until this lease is
/// released or dropped; the capture engine will not reuse it before then.
pub struct FrameLease {
    shared: Arc<Shared>,
    slot: usize,
    data: Option<Vec<u8>>,
    format: ActualFormat,
    metadata: FrameMetadata,
}

impl FrameLease {
    pub(crate) const fn new(
        shared: Arc<Shared>,
        slot: usize,
        data: Vec<u8>,
        format: ActualFormat,
        metadata: FrameMetadata,
    ) -> Self {
        Self {
            shared,
            slot,
            data: Some(data),
            format,
            metadata,
        }
    }

    /// Image bytes (only the part the backend filled).
    pub fn data(&self) -> &[u8] {
        let data = self.data.as_deref().unwrap_or_default();
        data.get(..self.metadata.bytes_used).unwrap_or(data)
    }

    /// Number of image bytes.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Geometry of this frame.
    pub const fn format(&self) -> &ActualFormat {
        &self.format
    }

    /// Sequence number, timestamp and size.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Copy the frame out so the buffer can be released straight away.
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: self.data().to_vec(),
            format: self.format,
            metadata: self.metadata,
        }
    }

    /// Hand the buffer back to the capture engine.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for FrameLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.shared.release(self.slot, data);
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("slot", &self.slot)
            .field("format", &self.format)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
