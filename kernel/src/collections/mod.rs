//! Fixed-capacity collections built over borrowed storage.

pub mod ring_buffer;

pub use ring_buffer::RingBuffer;
