//! Hardware interface layer: traits chip peripherals implement and
//! clients consume.

pub mod uart;
