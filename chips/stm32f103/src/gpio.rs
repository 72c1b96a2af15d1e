//! GPIO ports and pins.
//!
//! Pin modes on this family are a 4-bit CNF/MODE nibble per pin, packed
//! 8 pins per configuration register (CRL for pins 0-7, CRH for 8-15).
//! Each port is one clock-gated domain; pins borrow their port and rely
//! on it being enabled.

use kernel::utilities::registers::interfaces::{Readable, Writeable};
use kernel::utilities::registers::{ReadOnly, ReadWrite, WriteOnly};
use kernel::utilities::StaticRef;

use crate::rcc;

/// General purpose I/O port
#[repr(C)]
pub struct GpioRegisters {
    /// configuration register low, pins 0-7
    crl: ReadWrite<u32>,
    /// configuration register high, pins 8-15
    crh: ReadWrite<u32>,
    /// input data register
    idr: ReadOnly<u32>,
    /// output data register
    odr: ReadWrite<u32>,
    /// bit set/reset register
    bsrr: WriteOnly<u32>,
    /// bit reset register
    brr: WriteOnly<u32>,
    /// configuration lock register
    lckr: ReadWrite<u32>,
}

const GPIOA_BASE: StaticRef<GpioRegisters> =
    unsafe { StaticRef::new(0x4001_0800 as *const GpioRegisters) };
const GPIOB_BASE: StaticRef<GpioRegisters> =
    unsafe { StaticRef::new(0x4001_0C00 as *const GpioRegisters) };
const GPIOC_BASE: StaticRef<GpioRegisters> =
    unsafe { StaticRef::new(0x4001_1000 as *const GpioRegisters) };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortId {
    A,
    B,
    C,
}

/// Pin mode as the CNF/MODE nibble the configuration registers take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    AnalogInput = 0b0000,
    FloatingInput = 0b0100,
    PulledInput = 0b1000,
    OutputPushPull = 0b0001,
    OutputOpenDrain = 0b0101,
    AlternatePushPull = 0b1001,
    AlternateOpenDrain = 0b1101,
}

pub struct Port<'a> {
    registers: StaticRef<GpioRegisters>,
    clock: rcc::PeripheralClock<'a>,
}

impl<'a> Port<'a> {
    pub const fn new(port: PortId, rcc: &'a rcc::Rcc) -> Port<'a> {
        let (registers, clock) = match port {
            PortId::A => (GPIOA_BASE, rcc::PCLK2::GPIOA),
            PortId::B => (GPIOB_BASE, rcc::PCLK2::GPIOB),
            PortId::C => (GPIOC_BASE, rcc::PCLK2::GPIOC),
        };
        Port {
            registers,
            clock: rcc::PeripheralClock::new(rcc::PeripheralClockType::APB2(clock), rcc),
        }
    }

    pub fn enable(&self) {
        self.clock.acquire();
    }

    pub fn disable(&self) {
        self.clock.release();
    }

    pub fn pin(&'a self, pin: u8) -> Pin<'a> {
        Pin { port: self, pin }
    }
}

pub struct Pin<'a> {
    port: &'a Port<'a>,
    pin: u8,
}

impl Pin<'_> {
    /// Program the pin's CNF/MODE nibble.
    pub fn set_mode(&self, mode: Mode) {
        let regs = &*self.port.registers;
        let shift = (self.pin as usize % 8) * 4;
        let config = if self.pin < 8 { &regs.crl } else { &regs.crh };
        let nibble = (mode as u32) << shift;
        config.set((config.get() & !(0xF << shift)) | nibble);
        // Pulled inputs select pull direction through ODR; default down.
        if mode == Mode::PulledInput {
            regs.odr.set(regs.odr.get() & !(1 << self.pin));
        }
    }

    pub fn set(&self) {
        self.port.registers.bsrr.set(1 << self.pin);
    }

    pub fn clear(&self) {
        self.port.registers.brr.set(1 << self.pin);
    }

    pub fn read(&self) -> bool {
        self.port.registers.idr.get() & (1 << self.pin) != 0
    }

    pub fn is_set(&self) -> bool {
        self.port.registers.odr.get() & (1 << self.pin) != 0
    }

    pub fn toggle(&self) {
        let regs = &*self.port.registers;
        regs.odr.set(regs.odr.get() ^ (1 << self.pin));
    }
}
