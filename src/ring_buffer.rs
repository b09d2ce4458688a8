//! Lock-free single-producer/single-consumer ring buffer.
//!
//! `write`/the producer side is only ever called from the fill thread;
//! `read`/`peek`/`skip`/the consumer side only from the RT callback thread.
//! The buffer itself does not enforce this — callers uphold the discipline,
//! same as every other SPSC ring buffer in the pack (see e.g. the
//! `AudioRingBuffer` design this one is grounded on).

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity SPSC queue of `T`. One extra slot is reserved so a full
/// buffer (`write_space() == 0`) is distinguishable from an empty one
/// (`read_space() == 0`) using only the two index atomics.
pub struct RingBuffer<T> {
    storage: Box<[T]>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Creates a buffer able to hold `capacity` items before `write_space()`
    /// hits zero.
    pub fn new(capacity: usize) -> Self {
        let storage_len = (capacity + 1).max(2);
        Self {
            storage: vec![T::default(); storage_len].into_boxed_slice(),
            capacity: storage_len,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    /// Frames available to `read`/`peek` right now.
    #[inline]
    pub fn read_space(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Relaxed);
        w.wrapping_sub(r)
    }

    /// Frames that can be `write`-ten right now without overrunning the
    /// reader.
    #[inline]
    pub fn write_space(&self) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        self.capacity - 1 - (w.wrapping_sub(r))
    }

    /// Writer side. Copies as many of `src` as fit, returns the count
    /// actually written.
    pub fn write(&self, src: &[T]) -> usize {
        let available = self.write_space();
        let n = src.len().min(available);
        if n == 0 {
            return 0;
        }

        let w = self.write_pos.load(Ordering::Relaxed);
        for (i, &item) in src[..n].iter().enumerate() {
            let idx = (w.wrapping_add(i)) % self.capacity;
            // SAFETY: only the single producer ever writes; the slot at
            // `idx` cannot be concurrently read because write_space()
            // already accounted for the reader's position.
            unsafe {
                let ptr = self.storage.as_ptr().add(idx) as *mut T;
                ptr.write(item);
            }
        }
        self.write_pos.store(w.wrapping_add(n), Ordering::Release);
        n
    }

    /// Copies up to `dst.len()` items into `dst` without advancing the read
    /// pointer. Returns the count actually copied.
    pub fn peek(&self, dst: &mut [T]) -> usize {
        let available = self.read_space();
        let n = dst.len().min(available);
        if n == 0 {
            return 0;
        }
        let r = self.read_pos.load(Ordering::Relaxed);
        for (i, slot) in dst[..n].iter_mut().enumerate() {
            let idx = (r.wrapping_add(i)) % self.capacity;
            *slot = self.storage[idx];
        }
        n
    }

    /// Reader side. Equivalent to `peek` followed by `skip` of the same
    /// count.
    pub fn read(&self, dst: &mut [T]) -> usize {
        let n = self.peek(dst);
        if n > 0 {
            self.skip(n);
        }
        n
    }

    /// Advances the read pointer by `n`, clamped to `read_space()`. Used
    /// after a `peek` or to discard samples outright (e.g. on `stop`).
    pub fn skip(&self, n: usize) -> usize {
        let n = n.min(self.read_space());
        let r = self.read_pos.load(Ordering::Relaxed);
        self.read_pos.store(r.wrapping_add(n), Ordering::Release);
        n
    }

    /// Drops all buffered data. Only safe to call when the other side isn't
    /// concurrently producing/consuming (i.e. under the play-source mutex,
    /// during a reconfigure or `play()`/`stop()`, never from the RT path
    /// racing the fill thread).
    pub fn reset(&self) {
        let w = self.write_pos.load(Ordering::Relaxed);
        self.read_pos.store(w, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity - 1
    }
}

// SAFETY: the single producer only touches `write_pos` (and writes through
// shared references into disjoint, reader-unreachable slots); the single
// consumer only touches `read_pos`. This is the standard SPSC ring buffer
// safety argument used throughout the pack's hand-rolled ring buffers.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

/// An ordered sequence of per-channel ring buffers, one per source channel.
/// Two logical instances coexist during a channel-count or size transition:
/// the write-side (current production target) and read-side (current
/// consumption source) — in this implementation they are simply two `Arc`
/// clones of the very same `RingBufferVector`, since the underlying
/// `RingBuffer`s already separate producer/consumer access by construction.
pub struct RingBufferVector {
    channels: Vec<RingBuffer<f32>>,
}

impl RingBufferVector {
    pub fn new(channel_count: u16, size: usize) -> Self {
        Self { channels: (0..channel_count).map(|_| RingBuffer::new(size)).collect() }
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    pub fn channel(&self, index: usize) -> &RingBuffer<f32> {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[RingBuffer<f32>] {
        &self.channels
    }

    /// The minimum write space across all channels — how many frames can be
    /// produced this cycle without any channel overrunning.
    pub fn min_write_space(&self) -> usize {
        self.channels.iter().map(|c| c.write_space()).min().unwrap_or(0)
    }

    /// The minimum read space across all channels — how many frames are
    /// safely available for the callback to consume.
    pub fn min_read_space(&self) -> usize {
        self.channels.iter().map(|c| c.read_space()).min().unwrap_or(0)
    }

    pub fn reset(&self) {
        for c in &self.channels {
            c.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_in_order() {
        let rb = RingBuffer::<f32>::new(8);
        let src = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(rb.write(&src), 4);
        assert_eq!(rb.read_space(), 4);

        let mut dst = [0.0; 4];
        assert_eq!(rb.read(&mut dst), 4);
        assert_eq!(dst, src);
        assert_eq!(rb.read_space(), 0);
    }

    #[test]
    fn read_space_plus_write_space_is_capacity_minus_one() {
        let rb = RingBuffer::<f32>::new(16);
        let cap = rb.capacity();
        for n in [0usize, 3, 7, 16, 20] {
            let chunk = vec![1.0f32; n];
            rb.write(&chunk);
            assert_eq!(rb.read_space() + rb.write_space(), cap);
            let mut sink = vec![0.0f32; rb.read_space()];
            rb.read(&mut sink);
        }
    }

    #[test]
    fn peek_does_not_advance_read_pointer() {
        let rb = RingBuffer::<f32>::new(8);
        rb.write(&[1.0, 2.0, 3.0]);
        let mut dst = [0.0; 3];
        assert_eq!(rb.peek(&mut dst), 3);
        assert_eq!(rb.read_space(), 3);
        rb.skip(3);
        assert_eq!(rb.read_space(), 0);
    }

    #[test]
    fn write_wraps_around_capacity() {
        let rb = RingBuffer::<f32>::new(4);
        rb.write(&[1.0, 2.0, 3.0]);
        let mut dst = [0.0; 2];
        rb.read(&mut dst);
        assert_eq!(dst, [1.0, 2.0]);
        // Wrap the underlying storage.
        assert_eq!(rb.write(&[4.0, 5.0, 6.0]), 3);
        let mut rest = [0.0; 4];
        assert_eq!(rb.read(&mut rest), 4);
        assert_eq!(rest, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn reset_drops_buffered_data() {
        let rb = RingBuffer::<f32>::new(8);
        rb.write(&[1.0, 2.0, 3.0]);
        rb.reset();
        assert_eq!(rb.read_space(), 0);
        assert_eq!(rb.write_space(), rb.capacity());
    }

    #[test]
    fn ring_buffer_vector_reports_minimum_across_channels() {
        let v = RingBufferVector::new(2, 8);
        v.channel(0).write(&[1.0, 2.0, 3.0]);
        v.channel(1).write(&[1.0]);
        assert_eq!(v.min_read_space(), 1);
        assert_eq!(v.min_write_space(), v.channel(0).write_space());
    }
}
