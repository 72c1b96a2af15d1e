//! DMA1 channel transfer engine.
//!
//! Seven channels share one register block: per-channel CCR/CNDTR/CPAR/
//! CMAR plus a combined status register (ISR) and write-1-to-clear flag
//! register (IFCR), four flag bits per channel. Peripheral request routing
//! is fixed in hardware; [`DmaPeripheral`] captures the assignments this
//! chip crate uses.
//!
//! A transfer takes the buffer into the channel for its duration. On
//! completion the channel disarms (unless circular) and reports to its
//! client; the client recovers the buffer with [`Channel::take_buffer`] or
//! [`Channel::abort`].

use core::cell::Cell;

use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, ReadOnly, ReadWrite, WriteOnly};
use kernel::utilities::StaticRef;
use kernel::ErrorCode;

use crate::rcc;

#[repr(C)]
struct ChannelRegisters {
    /// channel configuration register
    ccr: ReadWrite<u32, CCR::Register>,
    /// number of data register
    cndtr: ReadWrite<u32, CNDTR::Register>,
    /// peripheral address register
    cpar: ReadWrite<u32>,
    /// memory address register
    cmar: ReadWrite<u32>,
    _reserved: u32,
}

/// DMA controller
#[repr(C)]
pub struct Dma1Registers {
    /// interrupt status register
    isr: ReadOnly<u32>,
    /// interrupt flag clear register
    ifcr: WriteOnly<u32>,
    channel: [ChannelRegisters; 7],
}

register_bitfields![u32,
    CCR [
        /// memory to memory mode
        MEM2MEM OFFSET(14) NUMBITS(1) [],
        /// channel priority level
        PL OFFSET(12) NUMBITS(2) [],
        /// memory size
        MSIZE OFFSET(10) NUMBITS(2) [],
        /// peripheral size
        PSIZE OFFSET(8) NUMBITS(2) [],
        /// memory increment mode
        MINC OFFSET(7) NUMBITS(1) [],
        /// peripheral increment mode
        PINC OFFSET(6) NUMBITS(1) [],
        /// circular mode
        CIRC OFFSET(5) NUMBITS(1) [],
        /// data transfer direction, 1 = read from memory
        DIR OFFSET(4) NUMBITS(1) [],
        /// transfer error interrupt enable
        TEIE OFFSET(3) NUMBITS(1) [],
        /// half transfer interrupt enable
        HTIE OFFSET(2) NUMBITS(1) [],
        /// transfer complete interrupt enable
        TCIE OFFSET(1) NUMBITS(1) [],
        /// channel enable
        EN OFFSET(0) NUMBITS(1) []
    ],
    CNDTR [
        /// number of data to transfer
        NDT OFFSET(0) NUMBITS(16) []
    ]
];

// Per-channel flag bits in ISR/IFCR, shifted left 4 bits per channel
// index.
const FLAG_GIF: u32 = 0b0001;
const FLAG_TCIF: u32 = 0b0010;
const FLAG_HTIF: u32 = 0b0100;
const FLAG_TEIF: u32 = 0b1000;

pub const DMA1_BASE: StaticRef<Dma1Registers> =
    unsafe { StaticRef::new(0x4002_0000 as *const Dma1Registers) };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelId {
    Channel1 = 0,
    Channel2 = 1,
    Channel3 = 2,
    Channel4 = 3,
    Channel5 = 4,
    Channel6 = 5,
    Channel7 = 6,
}

/// Peripheral DMA requests and their hardwired channel assignments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaPeripheral {
    Usart1Tx,
    Usart1Rx,
    Usart2Tx,
    Usart2Rx,
    Usart3Tx,
    Usart3Rx,
}

impl DmaPeripheral {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            DmaPeripheral::Usart3Tx => ChannelId::Channel2,
            DmaPeripheral::Usart3Rx => ChannelId::Channel3,
            DmaPeripheral::Usart1Tx => ChannelId::Channel4,
            DmaPeripheral::Usart1Rx => ChannelId::Channel5,
            DmaPeripheral::Usart2Rx => ChannelId::Channel6,
            DmaPeripheral::Usart2Tx => ChannelId::Channel7,
        }
    }

    // Address of the peripheral's data register, the fixed side of every
    // transfer this crate issues.
    fn data_register_address(&self) -> u32 {
        match self {
            DmaPeripheral::Usart1Tx | DmaPeripheral::Usart1Rx => 0x4001_3804,
            DmaPeripheral::Usart2Tx | DmaPeripheral::Usart2Rx => 0x4000_4404,
            DmaPeripheral::Usart3Tx | DmaPeripheral::Usart3Rx => 0x4000_4804,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    PeripheralToMemory = 0,
    MemoryToPeripheral = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    /// One shot; the channel disarms on completion.
    Normal,
    /// The channel rearms at the buffer start after reaching its end.
    Circular,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferSize {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    VeryHigh = 3,
}

#[derive(Clone, Copy, Debug)]
pub struct ChannelConfiguration {
    pub direction: Direction,
    pub peripheral_increment: bool,
    pub memory_increment: bool,
    pub peripheral_size: TransferSize,
    pub memory_size: TransferSize,
    pub mode: TransferMode,
    pub priority: Priority,
}

pub trait DmaClient {
    /// The channel finished moving all programmed elements. In circular
    /// mode this fires on every lap.
    fn transfer_complete(&self, peripheral: DmaPeripheral);

    /// The channel passed the midpoint of the programmed count. Only
    /// delivered when requested via [`Channel::listen_half_transfer`].
    fn half_transfer(&self, _peripheral: DmaPeripheral) {}

    /// A bus fault aborted the transfer; the channel is disarmed and must
    /// be restarted explicitly.
    fn transfer_error(&self, peripheral: DmaPeripheral);
}

pub struct Channel<'a> {
    registers: StaticRef<Dma1Registers>,
    id: ChannelId,
    clock: rcc::PeripheralClock<'a>,
    client: OptionalCell<&'a dyn DmaClient>,
    peripheral: OptionalCell<DmaPeripheral>,
    buffer: TakeCell<'static, [u8]>,
    circular: Cell<bool>,
    half_transfer_wanted: Cell<bool>,
}

impl<'a> Channel<'a> {
    pub const fn new(
        registers: StaticRef<Dma1Registers>,
        id: ChannelId,
        rcc: &'a rcc::Rcc,
    ) -> Channel<'a> {
        Channel {
            registers,
            id,
            clock: rcc::PeripheralClock::new(
                rcc::PeripheralClockType::AHB(rcc::HCLK::DMA1),
                rcc,
            ),
            client: OptionalCell::empty(),
            peripheral: OptionalCell::empty(),
            buffer: TakeCell::empty(),
            circular: Cell::new(false),
            half_transfer_wanted: Cell::new(false),
        }
    }

    /// Take a reference on the controller clock. Channels share the DMA1
    /// domain; the count in [`rcc::Rcc`] keeps it up while any channel is
    /// in use.
    pub fn enable(&self) {
        self.clock.acquire();
    }

    pub fn disable(&self) {
        self.clock.release();
    }

    pub fn set_client(&self, client: &'a dyn DmaClient, peripheral: DmaPeripheral) {
        self.client.set(client);
        self.peripheral.set(peripheral);
    }

    /// Request half-transfer callbacks on subsequent transfers.
    pub fn listen_half_transfer(&self, listen: bool) {
        self.half_transfer_wanted.set(listen);
    }

    fn channel_registers(&self) -> &ChannelRegisters {
        &self.registers.channel[self.id as usize]
    }

    fn flags(&self) -> u32 {
        (self.registers.isr.get() >> (4 * self.id as usize)) & 0xF
    }

    fn clear_flags(&self, flags: u32) {
        self.registers.ifcr.set(flags << (4 * self.id as usize));
    }

    /// Program the transfer shape. The channel must be disarmed.
    pub fn configure(&self, config: &ChannelConfiguration) {
        let ch = self.channel_registers();
        ch.ccr.modify(CCR::EN::CLEAR);
        ch.ccr.modify(
            CCR::MEM2MEM::CLEAR
                + CCR::DIR.val(config.direction as u32)
                + CCR::PINC.val(config.peripheral_increment as u32)
                + CCR::MINC.val(config.memory_increment as u32)
                + CCR::PSIZE.val(config.peripheral_size as u32)
                + CCR::MSIZE.val(config.memory_size as u32)
                + CCR::CIRC.val(matches!(config.mode, TransferMode::Circular) as u32)
                + CCR::PL.val(config.priority as u32),
        );
        self.circular.set(matches!(config.mode, TransferMode::Circular));
    }

    /// Arm the channel over `len` bytes of `buffer`.
    ///
    /// Clears stale flags, programs count and addresses per the configured
    /// direction, enables the half-transfer interrupt only when a listener
    /// asked for it, and enables the complete and error interrupts
    /// unconditionally.
    pub fn start(
        &self,
        buffer: &'static mut [u8],
        len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if len == 0 || len > buffer.len() {
            return Err((ErrorCode::SIZE, buffer));
        }
        if self.buffer.is_some() {
            return Err((ErrorCode::BUSY, buffer));
        }
        let peripheral_address = match self.peripheral.map(|p| p.data_register_address()) {
            Some(address) => address,
            None => return Err((ErrorCode::OFF, buffer)),
        };

        let ch = self.channel_registers();
        ch.ccr.modify(CCR::EN::CLEAR);
        self.clear_flags(FLAG_GIF | FLAG_TCIF | FLAG_HTIF | FLAG_TEIF);
        ch.cndtr.write(CNDTR::NDT.val(len as u32));
        ch.cpar.set(peripheral_address);
        ch.cmar.set(buffer.as_ptr() as u32);

        if self.half_transfer_wanted.get() {
            ch.ccr.modify(CCR::HTIE::SET);
        } else {
            ch.ccr.modify(CCR::HTIE::CLEAR);
        }
        ch.ccr.modify(CCR::TCIE::SET + CCR::TEIE::SET);

        self.buffer.replace(buffer);
        ch.ccr.modify(CCR::EN::SET);
        Ok(())
    }

    /// Disarm and return the in-flight buffer with the remaining element
    /// count. Safe to call at any time, including when nothing is armed.
    pub fn abort(&self) -> (Option<&'static mut [u8]>, u16) {
        let ch = self.channel_registers();
        ch.ccr
            .modify(CCR::HTIE::CLEAR + CCR::TCIE::CLEAR + CCR::TEIE::CLEAR);
        ch.ccr.modify(CCR::EN::CLEAR);
        self.clear_flags(FLAG_GIF | FLAG_TCIF | FLAG_HTIF | FLAG_TEIF);
        (self.buffer.take(), self.data_counter())
    }

    /// Remaining element count. Counts down while running; in circular
    /// mode it reloads at each lap.
    pub fn data_counter(&self) -> u16 {
        self.channel_registers().cndtr.read(CNDTR::NDT) as u16
    }

    /// Only meaningful while disarmed; the hardware ignores writes to an
    /// armed channel.
    pub fn set_data_counter(&self, count: u16) {
        self.channel_registers().cndtr.write(CNDTR::NDT.val(count as u32));
    }

    pub fn is_armed(&self) -> bool {
        self.channel_registers().ccr.is_set(CCR::EN)
    }

    /// Reclaim the buffer after a completion callback.
    pub fn take_buffer(&self) -> Option<&'static mut [u8]> {
        self.buffer.take()
    }

    /// In-place access to the owned transfer buffer. The circular receive
    /// flush reads new bytes through this while the channel stays armed.
    pub fn map_buffer<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        self.buffer.map(f)
    }

    /// Vector body. Flag checks run in fixed priority order, each branch
    /// clearing only its own flag so a sibling flag set while a callback
    /// runs is picked up by the next interrupt.
    pub fn handle_interrupt(&self) {
        let ch = self.channel_registers();
        let flags = self.flags();

        if flags & FLAG_HTIF != 0 && ch.ccr.is_set(CCR::HTIE) {
            if !self.circular.get() {
                ch.ccr.modify(CCR::HTIE::CLEAR);
            }
            self.clear_flags(FLAG_HTIF);
            self.peripheral.map(|peripheral| {
                self.client.map(|client| client.half_transfer(peripheral));
            });
        } else if flags & FLAG_TCIF != 0 && ch.ccr.is_set(CCR::TCIE) {
            self.clear_flags(FLAG_TCIF);
            if !self.circular.get() {
                ch.ccr.modify(CCR::TCIE::CLEAR + CCR::TEIE::CLEAR);
                ch.ccr.modify(CCR::EN::CLEAR);
            }
            self.peripheral.map(|peripheral| {
                self.client.map(|client| client.transfer_complete(peripheral));
            });
        } else if flags & FLAG_TEIF != 0 && ch.ccr.is_set(CCR::TEIE) {
            self.clear_flags(FLAG_GIF | FLAG_TCIF | FLAG_HTIF | FLAG_TEIF);
            ch.ccr
                .modify(CCR::HTIE::CLEAR + CCR::TCIE::CLEAR + CCR::TEIE::CLEAR);
            ch.ccr.modify(CCR::EN::CLEAR);
            self.peripheral.map(|peripheral| {
                self.client.map(|client| client.transfer_error(peripheral));
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::cell::Cell as StdCell;

    fn fake_channel(id: ChannelId) -> &'static Channel<'static> {
        let registers = unsafe {
            StaticRef::new(Box::leak(Box::new(core::mem::zeroed::<Dma1Registers>())) as *const _)
        };
        let rcc = Box::leak(Box::new(rcc::Rcc::new(unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<rcc::RccRegisters>())) as *const _,
            )
        })));
        Box::leak(Box::new(Channel::new(registers, id, rcc)))
    }

    // Plants status flags in the fake ISR the way hardware would.
    // The register block is a leaked Box, so the allocation is mutable
    // even though we only hold a shared reference to it here.
    #[allow(invalid_reference_casting)]
    fn plant_flags(channel: &Channel<'static>, flags: u32) {
        let isr = &*channel.registers as *const Dma1Registers as *mut u32;
        unsafe {
            core::ptr::write_volatile(isr, flags << (4 * channel.id as usize));
        }
    }

    struct CompleteCounter {
        channel: &'static Channel<'static>,
        completions: StdCell<usize>,
        errors: StdCell<usize>,
        reclaimed: StdCell<Option<&'static mut [u8]>>,
    }

    impl DmaClient for CompleteCounter {
        fn transfer_complete(&self, _peripheral: DmaPeripheral) {
            self.completions.set(self.completions.get() + 1);
            self.reclaimed.set(self.channel.take_buffer());
        }

        fn transfer_error(&self, _peripheral: DmaPeripheral) {
            self.errors.set(self.errors.get() + 1);
        }
    }

    const CONFIG: ChannelConfiguration = ChannelConfiguration {
        direction: Direction::PeripheralToMemory,
        peripheral_increment: false,
        memory_increment: true,
        peripheral_size: TransferSize::Byte,
        memory_size: TransferSize::Byte,
        mode: TransferMode::Normal,
        priority: Priority::Medium,
    };

    #[test]
    fn start_rejects_bad_lengths() {
        let channel = fake_channel(ChannelId::Channel5);
        channel.set_client(
            Box::leak(Box::new(CompleteCounter {
                channel,
                completions: StdCell::new(0),
                errors: StdCell::new(0),
                reclaimed: StdCell::new(None),
            })),
            DmaPeripheral::Usart1Rx,
        );
        channel.configure(&CONFIG);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 8]));
        let (code, buffer) = channel.start(buffer, 0).unwrap_err();
        assert_eq!(code, ErrorCode::SIZE);
        let (code, _) = channel.start(buffer, 9).unwrap_err();
        assert_eq!(code, ErrorCode::SIZE);
    }

    #[test]
    fn normal_transfer_completes_once_and_restarts() {
        let channel = fake_channel(ChannelId::Channel5);
        let client = Box::leak(Box::new(CompleteCounter {
            channel,
            completions: StdCell::new(0),
            errors: StdCell::new(0),
            reclaimed: StdCell::new(None),
        }));
        channel.set_client(client, DmaPeripheral::Usart1Rx);
        channel.configure(&CONFIG);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 8]));
        assert!(channel.start(buffer, 8).is_ok());
        assert!(channel.is_armed());
        assert_eq!(channel.data_counter(), 8);

        plant_flags(channel, FLAG_TCIF);
        channel.handle_interrupt();
        assert_eq!(client.completions.get(), 1);
        assert!(!channel.is_armed());

        // Complete interrupt is now disabled; a stale flag must not
        // re-fire the callback.
        channel.handle_interrupt();
        assert_eq!(client.completions.get(), 1);

        // Restart with a different length, no explicit reset needed.
        let buffer = client.reclaimed.take().unwrap();
        assert!(channel.start(buffer, 4).is_ok());
        assert_eq!(channel.data_counter(), 4);
        assert!(channel.is_armed());
    }

    #[test]
    fn error_disarms_and_reports() {
        let channel = fake_channel(ChannelId::Channel2);
        let client = Box::leak(Box::new(CompleteCounter {
            channel,
            completions: StdCell::new(0),
            errors: StdCell::new(0),
            reclaimed: StdCell::new(None),
        }));
        channel.set_client(client, DmaPeripheral::Usart3Tx);
        channel.configure(&CONFIG);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 4]));
        assert!(channel.start(buffer, 4).is_ok());
        plant_flags(channel, FLAG_TEIF);
        channel.handle_interrupt();
        assert_eq!(client.errors.get(), 1);
        assert_eq!(client.completions.get(), 0);
        assert!(!channel.is_armed());
    }

    #[test]
    fn abort_returns_buffer_and_remaining_count() {
        let channel = fake_channel(ChannelId::Channel7);
        channel.set_client(
            Box::leak(Box::new(CompleteCounter {
                channel,
                completions: StdCell::new(0),
                errors: StdCell::new(0),
                reclaimed: StdCell::new(None),
            })),
            DmaPeripheral::Usart2Tx,
        );
        channel.configure(&CONFIG);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 16]));
        assert!(channel.start(buffer, 16).is_ok());
        let (buffer, remaining) = channel.abort();
        assert!(buffer.is_some());
        assert_eq!(remaining, 16);
        assert!(!channel.is_armed());
        // Idempotent.
        let (buffer, _) = channel.abort();
        assert!(buffer.is_none());
    }

    #[test]
    fn half_transfer_only_when_requested() {
        let channel = fake_channel(ChannelId::Channel3);
        let client = Box::leak(Box::new(CompleteCounter {
            channel,
            completions: StdCell::new(0),
            errors: StdCell::new(0),
            reclaimed: StdCell::new(None),
        }));
        channel.set_client(client, DmaPeripheral::Usart3Rx);
        channel.configure(&CONFIG);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 8]));
        assert!(channel.start(buffer, 8).is_ok());
        // No listener requested: HTIF set must fall through to nothing.
        plant_flags(channel, FLAG_HTIF);
        channel.handle_interrupt();
        assert_eq!(client.completions.get(), 0);
        assert_eq!(client.errors.get(), 0);

        let (buffer, _) = channel.abort();
        channel.listen_half_transfer(true);
        assert!(channel.start(buffer.unwrap(), 8).is_ok());
        assert!(channel.channel_registers().ccr.is_set(CCR::HTIE));
    }
}
