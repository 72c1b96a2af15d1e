//! Traits at the chip boundary.

pub mod chip;

pub use chip::{ClockInterface, InterruptService};
