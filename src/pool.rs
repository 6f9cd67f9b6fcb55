use crate::config::Direction;
use crate::error::{Error, Result};
use std::collections::VecDeque;

/// Valid sub-range of a buffer payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: u32,
}

/// Metadata stamped on captured buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub seq: u64,
    pub pts: u64,
    pub dts_offset: i64,
}

/// One host-provided buffer descriptor. `out` is set while the host owns it.
#[derive(Debug)]
pub struct Buffer {
    pub id: u32,
    data: Vec<u8>,
    pub chunk: Chunk,
    pub header: Header,
    out: bool,
}

impl Buffer {
    pub fn new(id: u32, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0; capacity],
            chunk: Chunk::default(),
            header: Header::default(),
            out: false,
        }
    }

    pub fn with_data(id: u32, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            chunk: Chunk::default(),
            header: Header::default(),
            out: false,
        }
    }

    pub fn maxsize(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_out(&self) -> bool {
        self.out
    }
}

/// Fixed descriptor set partitioned into `free`, `ready` and host-owned.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
    free: VecDeque<u32>,
    ready: VecDeque<u32>,
}

impl BufferPool {
    /// Install a new descriptor set and reset ownership for `direction`.
    /// Ids must be unique.
    pub fn attach(&mut self, buffers: Vec<Buffer>, direction: Direction) -> Result<()> {
        for (i, b) in buffers.iter().enumerate() {
            if buffers[..i].iter().any(|o| o.id == b.id) {
                return Err(Error::invalid(format!("duplicate buffer id {}", b.id)));
            }
        }
        self.buffers = buffers;
        self.reset(direction);
        Ok(())
    }

    /// Playback starts with every descriptor in the host's hands; capture
    /// starts with every descriptor free for filling.
    pub fn reset(&mut self, direction: Direction) {
        self.free.clear();
        self.ready.clear();
        for b in &mut self.buffers {
            match direction {
                Direction::Playback => b.out = true,
                Direction::Capture => {
                    b.out = false;
                    self.free.push_back(b.id);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.free.clear();
        self.ready.clear();
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        self.buffers.iter().position(|b| b.id == id)
    }

    pub fn buffer(&self, id: u32) -> Option<&Buffer> {
        self.index_of(id).map(|i| &self.buffers[i])
    }

    pub fn buffer_mut(&mut self, id: u32) -> Option<&mut Buffer> {
        self.index_of(id).map(move |i| &mut self.buffers[i])
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn front_ready(&mut self) -> Option<&mut Buffer> {
        let id = *self.ready.front()?;
        self.buffer_mut(id)
    }

    /// Drop the head of `ready` and hand it back to the host side.
    pub fn remove_front_ready(&mut self) -> Option<u32> {
        let id = self.ready.pop_front()?;
        if let Some(b) = self.buffer_mut(id) {
            b.out = true;
        }
        Some(id)
    }

    /// Pop a free descriptor for capture filling.
    pub fn take_free(&mut self) -> Result<u32> {
        self.free.pop_front().ok_or(Error::NoSpace)
    }

    pub fn take_ready(&mut self) -> Result<u32> {
        let id = *self.ready.front().ok_or(Error::NoData)?;
        self.ready.pop_front();
        Ok(id)
    }

    pub fn push_ready(&mut self, id: u32) {
        self.ready.push_back(id);
    }

    pub fn mark_out(&mut self, id: u32) {
        if let Some(b) = self.buffer_mut(id) {
            b.out = true;
        }
    }

    /// Host returns a descriptor. Playback buffers arrive with fresh data for
    /// `ready`; capture buffers come back empty onto `free`.
    pub fn submit(&mut self, id: u32, chunk: Chunk, direction: Direction) -> Result<()> {
        if self.free.contains(&id) || self.ready.contains(&id) {
            return Err(Error::invalid(format!("buffer {id} already queued")));
        }
        let b = self
            .buffer_mut(id)
            .ok_or_else(|| Error::invalid(format!("unknown buffer id {id}")))?;
        if chunk.size as usize > b.maxsize() {
            return Err(Error::invalid(format!(
                "chunk size {} exceeds buffer capacity {}",
                chunk.size,
                b.maxsize()
            )));
        }
        b.chunk = chunk;
        b.out = false;
        match direction {
            Direction::Playback => self.ready.push_back(id),
            Direction::Capture => self.free.push_back(id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u32, direction: Direction) -> BufferPool {
        let mut p = BufferPool::default();
        let buffers = (0..n).map(|id| Buffer::new(id, 4096)).collect();
        p.attach(buffers, direction).unwrap();
        p
    }

    fn assert_partitioned(p: &BufferPool, n: u32) {
        for id in 0..n {
            let b = p.buffer(id).unwrap();
            let in_free = p.free.contains(&id);
            let in_ready = p.ready.contains(&id);
            let states = [b.is_out(), in_free, in_ready];
            assert_eq!(
                states.iter().filter(|s| **s).count(),
                1,
                "buffer {id} must be in exactly one place"
            );
        }
    }

    #[test]
    fn playback_reset_hands_everything_to_the_host() {
        let p = pool(3, Direction::Playback);
        assert_eq!(p.ready_len(), 0);
        assert_eq!(p.free_len(), 0);
        assert_partitioned(&p, 3);
    }

    #[test]
    fn capture_reset_frees_everything() {
        let p = pool(3, Direction::Capture);
        assert_eq!(p.free_len(), 3);
        assert_partitioned(&p, 3);
    }

    #[test]
    fn take_from_empty_queues_reports_handshake_errors() {
        let mut p = pool(1, Direction::Playback);
        assert!(matches!(p.take_ready(), Err(Error::NoData)));
        assert!(matches!(p.take_free(), Err(Error::NoSpace)));
    }

    #[test]
    fn submit_take_cycle_keeps_the_partition() {
        let mut p = pool(2, Direction::Playback);
        let chunk = Chunk { offset: 0, size: 1024, stride: 4 };
        p.submit(0, chunk, Direction::Playback).unwrap();
        assert_partitioned(&p, 2);
        assert_eq!(p.ready_len(), 1);

        let id = p.remove_front_ready().unwrap();
        assert_eq!(id, 0);
        assert!(p.buffer(0).unwrap().is_out());
        assert_partitioned(&p, 2);
    }

    #[test]
    fn submit_rejects_unknown_ids_and_oversized_chunks() {
        let mut p = pool(1, Direction::Playback);
        assert!(p.submit(7, Chunk::default(), Direction::Playback).is_err());
        let big = Chunk { offset: 0, size: 1 << 20, stride: 4 };
        assert!(p.submit(0, big, Direction::Playback).is_err());
    }

    #[test]
    fn attach_rejects_duplicate_ids() {
        let mut p = BufferPool::default();
        let res = p.attach(
            vec![Buffer::new(1, 64), Buffer::new(1, 64)],
            Direction::Playback,
        );
        assert!(res.is_err());
    }
}
