//! SysTick driven millisecond tick counter.
//!
//! The blocking UART paths need a monotonic deadline source. SysTick is
//! configured for a 1 kHz interrupt and a free-running millisecond count;
//! comparisons use wrapping arithmetic so the counter may roll over.

use core::sync::atomic::{AtomicU32, Ordering};

use kernel::utilities::registers::interfaces::{ReadWriteable, Writeable};
use kernel::utilities::registers::{register_bitfields, ReadOnly, ReadWrite};
use kernel::utilities::StaticRef;

#[repr(C)]
pub struct SysTickRegisters {
    /// control and status register
    csr: ReadWrite<u32, CSR::Register>,
    /// reload value register
    rvr: ReadWrite<u32>,
    /// current value register
    cvr: ReadWrite<u32>,
    /// calibration value register
    calib: ReadOnly<u32>,
}

register_bitfields![u32,
    CSR [
        /// counter reached zero since last read
        COUNTFLAG OFFSET(16) NUMBITS(1) [],
        /// clock source, 1 = processor clock
        CLKSOURCE OFFSET(2) NUMBITS(1) [],
        /// exception request on reaching zero
        TICKINT OFFSET(1) NUMBITS(1) [],
        /// counter enable
        ENABLE OFFSET(0) NUMBITS(1) []
    ]
];

pub const SYSTICK_BASE: StaticRef<SysTickRegisters> =
    unsafe { StaticRef::new(0xE000_E010 as *const SysTickRegisters) };

/// Tick rate of the counter maintained by [`SysTick::handle_interrupt`].
pub const TICK_HZ: u32 = 1000;

pub struct SysTick {
    registers: StaticRef<SysTickRegisters>,
    ticks: AtomicU32,
}

impl SysTick {
    pub const fn new(registers: StaticRef<SysTickRegisters>) -> SysTick {
        SysTick {
            registers,
            ticks: AtomicU32::new(0),
        }
    }

    /// Start the 1 kHz tick off the processor clock running at `hclk_hz`.
    pub fn start(&self, hclk_hz: u32) {
        // 24-bit down counter; reload of N gives a period of N + 1 cycles.
        let reload = (hclk_hz / TICK_HZ).saturating_sub(1) & 0x00FF_FFFF;
        self.registers.rvr.set(reload);
        self.registers.cvr.set(0);
        self.registers
            .csr
            .modify(CSR::CLKSOURCE::SET + CSR::TICKINT::SET + CSR::ENABLE::SET);
    }

    pub fn stop(&self) {
        self.registers.csr.modify(CSR::ENABLE::CLEAR + CSR::TICKINT::CLEAR);
    }

    /// Exception body; one call per millisecond once started.
    pub fn handle_interrupt(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Milliseconds since start, wrapping at 2^32.
    pub fn now(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Milliseconds elapsed since `start`, correct across counter
    /// rollover.
    pub fn elapsed(&self, start: u32) -> u32 {
        self.now().wrapping_sub(start)
    }
}
