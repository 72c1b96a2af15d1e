//! A fixed-capacity ring buffer over a borrowed slice.
//!
//! Serves as the software staging queue in byte-stream drivers: the
//! interrupt path enqueues elements as they arrive and the completion path
//! drains them. Single-owner, no interior mutability; the owner wraps it in
//! a cell type if it must be shared with an interrupt handler.

pub struct RingBuffer<'a, T: Copy> {
    ring: &'a mut [T],
    head: usize,
    tail: usize,
}

impl<'a, T: Copy> RingBuffer<'a, T> {
    /// One slot of `ring` is sacrificed to distinguish full from empty, so
    /// the usable capacity is `ring.len() - 1`.
    pub fn new(ring: &'a mut [T]) -> RingBuffer<'a, T> {
        RingBuffer {
            ring,
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.head == (self.tail + 1) % self.ring.len()
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.ring.len() - self.head + self.tail
        }
    }

    /// Remaining free slots.
    pub fn available_len(&self) -> usize {
        self.ring.len().saturating_sub(1 + self.len())
    }

    /// Append `value`. Returns `false`, dropping the value, if full.
    pub fn enqueue(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.ring[self.tail] = value;
        self.tail = (self.tail + 1) % self.ring.len();
        true
    }

    /// Remove and return the oldest element.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.ring[self.head];
        self.head = (self.head + 1) % self.ring.len();
        Some(value)
    }

    /// Discard all queued elements.
    pub fn empty(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_across_wrap() {
        let mut storage = [0u8; 5];
        let mut rb = RingBuffer::new(&mut storage);
        assert_eq!(rb.available_len(), 4);

        for b in 1..=4u8 {
            assert!(rb.enqueue(b));
        }
        assert!(rb.is_full());
        assert!(!rb.enqueue(5));

        assert_eq!(rb.dequeue(), Some(1));
        assert_eq!(rb.dequeue(), Some(2));
        // The next writes wrap past the end of the backing slice.
        assert!(rb.enqueue(5));
        assert!(rb.enqueue(6));
        let drained: std::vec::Vec<u8> = core::iter::from_fn(|| rb.dequeue()).collect();
        assert_eq!(drained, [3, 4, 5, 6]);
        assert!(rb.is_empty());
    }
}
