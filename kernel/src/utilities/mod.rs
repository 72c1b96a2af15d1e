//! Utility types provided by the kernel crate.

pub mod cells;

mod static_ref;
pub use self::static_ref::StaticRef;

/// Re-export of the register interface crate.
///
/// Chip crates access memory-mapped registers exclusively through these
/// types and macros.
pub mod registers {
    pub use tock_registers::fields::{Field, FieldValue};
    pub use tock_registers::interfaces;
    pub use tock_registers::registers::{
        Aliased, InMemoryRegister, ReadOnly, ReadWrite, WriteOnly,
    };
    pub use tock_registers::{register_bitfields, register_structs};
    pub use tock_registers::{LocalRegisterCopy, RegisterLongName};
}
