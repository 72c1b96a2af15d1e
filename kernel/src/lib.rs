//! Support layer shared by the chip crates.
//!
//! Provides the register-interface re-export, the interior-mutability cell
//! types drivers use for client and buffer slots, fixed-capacity
//! collections, the common error code type, and the hardware interface
//! (`hil`) traits chip peripherals implement.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod collections;
pub mod errorcode;
pub mod hil;
pub mod platform;
pub mod utilities;

pub use errorcode::ErrorCode;
