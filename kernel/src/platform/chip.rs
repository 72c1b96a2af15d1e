//! Interfaces implemented by chip crates.

/// Control for the clock gate of one peripheral clock domain.
///
/// This is raw gate control; chips that reference-count their domains
/// expose acquire/release on top of it.
pub trait ClockInterface {
    fn is_enabled(&self) -> bool;
    fn enable(&self);
    fn disable(&self);
}

/// Routes a hardware interrupt number to the peripheral that services it.
///
/// Implemented by a chip's peripherals struct; the board's vector handlers
/// call into this with the active interrupt number. Exactly one peripheral
/// owns each vector.
pub trait InterruptService {
    /// Service `interrupt`, if this struct owns a driver for it.
    ///
    /// Returns `false` if the interrupt number is not recognized.
    ///
    /// # Safety
    ///
    /// Must only be called for interrupts the caller knows are pending and
    /// safe to service in the current context.
    unsafe fn service_interrupt(&self, interrupt: u32) -> bool;
}
