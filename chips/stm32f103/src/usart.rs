//! USART driver: blocking, interrupt and DMA transfer modes.
//!
//! Transmit and receive run independently. Each direction supports a
//! polled path with a millisecond deadline, an interrupt-per-byte path,
//! and a DMA path. Receive additionally offers an idle-line mode built on
//! a circular DMA channel: the DMA engine fills a ring the driver never
//! stops, and the line-idle interrupt flushes whatever arrived since the
//! previous flush, so message boundaries fall out of inter-frame gaps
//! without per-byte interrupts.
//!
//! Buffer custody follows the `hil::uart` contract: an accepted buffer is
//! returned through the matching client callback exactly once; a refused
//! buffer is handed back in the error.

use core::cell::Cell;

use kernel::collections::ring_buffer::RingBuffer;
use kernel::hil::uart;
use kernel::platform::chip::ClockInterface;
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, Field, ReadWrite};
use kernel::utilities::StaticRef;
use kernel::ErrorCode;

use crate::dma;
use crate::rcc;
use crate::systick::SysTick;

/// Universal synchronous asynchronous receiver transmitter
#[repr(C)]
struct UsartRegisters {
    /// status register
    sr: ReadWrite<u32, SR::Register>,
    /// data register
    dr: ReadWrite<u32>,
    /// baud rate register
    brr: ReadWrite<u32, BRR::Register>,
    /// control register 1
    cr1: ReadWrite<u32, CR1::Register>,
    /// control register 2
    cr2: ReadWrite<u32, CR2::Register>,
    /// control register 3
    cr3: ReadWrite<u32, CR3::Register>,
    /// guard time and prescaler register
    gtpr: ReadWrite<u32>,
}

register_bitfields![u32,
    SR [
        /// CTS flag
        CTS OFFSET(9) NUMBITS(1) [],
        /// LIN break detection flag
        LBD OFFSET(8) NUMBITS(1) [],
        /// transmit data register empty
        TXE OFFSET(7) NUMBITS(1) [],
        /// transmission complete
        TC OFFSET(6) NUMBITS(1) [],
        /// read data register not empty
        RXNE OFFSET(5) NUMBITS(1) [],
        /// IDLE line detected
        IDLE OFFSET(4) NUMBITS(1) [],
        /// overrun error
        ORE OFFSET(3) NUMBITS(1) [],
        /// noise error flag
        NE OFFSET(2) NUMBITS(1) [],
        /// framing error
        FE OFFSET(1) NUMBITS(1) [],
        /// parity error
        PE OFFSET(0) NUMBITS(1) []
    ],
    BRR [
        /// mantissa of USARTDIV
        DIV_MANTISSA OFFSET(4) NUMBITS(12) [],
        /// fraction of USARTDIV
        DIV_FRACTION OFFSET(0) NUMBITS(4) []
    ],
    CR1 [
        /// USART enable
        UE OFFSET(13) NUMBITS(1) [],
        /// word length
        M OFFSET(12) NUMBITS(1) [],
        /// wakeup method
        WAKE OFFSET(11) NUMBITS(1) [],
        /// parity control enable
        PCE OFFSET(10) NUMBITS(1) [],
        /// parity selection, 1 = odd
        PS OFFSET(9) NUMBITS(1) [],
        /// PE interrupt enable
        PEIE OFFSET(8) NUMBITS(1) [],
        /// TXE interrupt enable
        TXEIE OFFSET(7) NUMBITS(1) [],
        /// transmission complete interrupt enable
        TCIE OFFSET(6) NUMBITS(1) [],
        /// RXNE interrupt enable
        RXNEIE OFFSET(5) NUMBITS(1) [],
        /// IDLE interrupt enable
        IDLEIE OFFSET(4) NUMBITS(1) [],
        /// transmitter enable
        TE OFFSET(3) NUMBITS(1) [],
        /// receiver enable
        RE OFFSET(2) NUMBITS(1) [],
        /// receiver wakeup
        RWU OFFSET(1) NUMBITS(1) [],
        /// send break
        SBK OFFSET(0) NUMBITS(1) []
    ],
    CR2 [
        /// stop bits
        STOP OFFSET(12) NUMBITS(2) [
            One = 0b00,
            Two = 0b10
        ]
    ],
    CR3 [
        /// CTS enable
        CTSE OFFSET(9) NUMBITS(1) [],
        /// RTS enable
        RTSE OFFSET(8) NUMBITS(1) [],
        /// DMA enable transmitter
        DMAT OFFSET(7) NUMBITS(1) [],
        /// DMA enable receiver
        DMAR OFFSET(6) NUMBITS(1) [],
        /// error interrupt enable
        EIE OFFSET(0) NUMBITS(1) []
    ]
];

const USART1_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x4001_3800 as *const UsartRegisters) };
const USART2_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x4000_4400 as *const UsartRegisters) };
const USART3_BASE: StaticRef<UsartRegisters> =
    unsafe { StaticRef::new(0x4000_4800 as *const UsartRegisters) };

const TX_DMA_CONFIGURATION: dma::ChannelConfiguration = dma::ChannelConfiguration {
    direction: dma::Direction::MemoryToPeripheral,
    peripheral_increment: false,
    memory_increment: true,
    peripheral_size: dma::TransferSize::Byte,
    memory_size: dma::TransferSize::Byte,
    mode: dma::TransferMode::Normal,
    priority: dma::Priority::Medium,
};

const RX_DMA_CONFIGURATION: dma::ChannelConfiguration = dma::ChannelConfiguration {
    direction: dma::Direction::PeripheralToMemory,
    peripheral_increment: false,
    memory_increment: true,
    peripheral_size: dma::TransferSize::Byte,
    memory_size: dma::TransferSize::Byte,
    mode: dma::TransferMode::Normal,
    priority: dma::Priority::Medium,
};

// The ring must win bus arbitration against everything else or bytes are
// dropped silently.
const RX_CIRCULAR_DMA_CONFIGURATION: dma::ChannelConfiguration = dma::ChannelConfiguration {
    direction: dma::Direction::PeripheralToMemory,
    peripheral_increment: false,
    memory_increment: true,
    peripheral_size: dma::TransferSize::Byte,
    memory_size: dma::TransferSize::Byte,
    mode: dma::TransferMode::Circular,
    priority: dma::Priority::High,
};

#[derive(Copy, Clone, PartialEq)]
enum UsartStateTx {
    Idle,
    Transmitting,
    TransmittingDma,
}

#[derive(Copy, Clone, PartialEq)]
enum UsartStateRx {
    Idle,
    Receiving,
    ReceivingDma,
    ReceivingAutomatic,
}

pub struct Usart<'a> {
    registers: StaticRef<UsartRegisters>,
    clock: rcc::PeripheralClock<'a>,
    tick: &'a SysTick,

    tx_client: OptionalCell<&'a dyn uart::TransmitClient>,
    rx_client: OptionalCell<&'a dyn uart::ReceiveClient>,
    stream_client: OptionalCell<&'a dyn uart::StreamClient>,

    tx_status: Cell<UsartStateTx>,
    rx_status: Cell<UsartStateRx>,

    tx_buffer: TakeCell<'static, [u8]>,
    tx_position: Cell<usize>,
    tx_len: Cell<usize>,

    rx_buffer: TakeCell<'static, [u8]>,
    rx_position: Cell<usize>,
    rx_len: Cell<usize>,

    tx_dma: OptionalCell<&'a dma::Channel<'a>>,
    tx_dma_peripheral: OptionalCell<dma::DmaPeripheral>,
    rx_dma: OptionalCell<&'a dma::Channel<'a>>,
    rx_dma_peripheral: OptionalCell<dma::DmaPeripheral>,

    // Ring the circular channel writes into, parked here while disarmed.
    rx_dma_buffer: TakeCell<'static, [u8]>,
    circular_capacity: Cell<usize>,
    // Ring offset up to which bytes have already been flushed.
    last_position: Cell<usize>,

    // Software staging between an idle-line flush and the next client
    // buffer.
    rx_queue: TakeCell<'static, RingBuffer<'static, u8>>,
}

impl<'a> Usart<'a> {
    fn new(
        registers: StaticRef<UsartRegisters>,
        clock: rcc::PeripheralClockType,
        rcc: &'a rcc::Rcc,
        tick: &'a SysTick,
    ) -> Usart<'a> {
        Usart {
            registers,
            clock: rcc::PeripheralClock::new(clock, rcc),
            tick,
            tx_client: OptionalCell::empty(),
            rx_client: OptionalCell::empty(),
            stream_client: OptionalCell::empty(),
            tx_status: Cell::new(UsartStateTx::Idle),
            rx_status: Cell::new(UsartStateRx::Idle),
            tx_buffer: TakeCell::empty(),
            tx_position: Cell::new(0),
            tx_len: Cell::new(0),
            rx_buffer: TakeCell::empty(),
            rx_position: Cell::new(0),
            rx_len: Cell::new(0),
            tx_dma: OptionalCell::empty(),
            tx_dma_peripheral: OptionalCell::empty(),
            rx_dma: OptionalCell::empty(),
            rx_dma_peripheral: OptionalCell::empty(),
            rx_dma_buffer: TakeCell::empty(),
            circular_capacity: Cell::new(0),
            last_position: Cell::new(0),
            rx_queue: TakeCell::empty(),
        }
    }

    pub fn new_usart1(rcc: &'a rcc::Rcc, tick: &'a SysTick) -> Usart<'a> {
        Usart::new(
            USART1_BASE,
            rcc::PeripheralClockType::APB2(rcc::PCLK2::USART1),
            rcc,
            tick,
        )
    }

    pub fn new_usart2(rcc: &'a rcc::Rcc, tick: &'a SysTick) -> Usart<'a> {
        Usart::new(
            USART2_BASE,
            rcc::PeripheralClockType::APB1(rcc::PCLK1::USART2),
            rcc,
            tick,
        )
    }

    pub fn new_usart3(rcc: &'a rcc::Rcc, tick: &'a SysTick) -> Usart<'a> {
        Usart::new(
            USART3_BASE,
            rcc::PeripheralClockType::APB1(rcc::PCLK1::USART3),
            rcc,
            tick,
        )
    }

    /// Take a clock reference and turn the peripheral on.
    pub fn enable(&self) {
        self.clock.acquire();
        self.registers.cr1.modify(CR1::UE::SET);
    }

    /// Turn the peripheral off and drop the clock reference. On the last
    /// holder this resets the peripheral, so all register state is lost.
    pub fn disable(&self) {
        self.registers.cr1.modify(CR1::UE::CLEAR);
        self.clock.release();
    }

    pub fn is_enabled(&self) -> bool {
        self.clock.is_enabled()
    }

    /// Bind the software staging queue used by idle-line receive.
    pub fn set_rx_queue(&self, queue: &'static mut RingBuffer<'static, u8>) {
        self.rx_queue.replace(queue);
    }

    /// Bind a per-byte stream client; while bound, interrupt-mode receive
    /// bytes go to it instead of being staged.
    pub fn set_stream_client(&self, client: &'a dyn uart::StreamClient) {
        self.stream_client.set(client);
    }

    /// Attach the transmit DMA channel. `peripheral` must name this
    /// USART's TX request.
    pub fn set_tx_dma_channel(
        &'a self,
        channel: &'a dma::Channel<'a>,
        peripheral: dma::DmaPeripheral,
    ) {
        channel.enable();
        channel.set_client(self, peripheral);
        self.tx_dma.set(channel);
        self.tx_dma_peripheral.set(peripheral);
    }

    /// Attach the receive DMA channel together with the ring the circular
    /// idle-line mode fills. `receive_buffer` uses the same channel in
    /// one-shot mode.
    pub fn set_rx_dma_channel(
        &'a self,
        channel: &'a dma::Channel<'a>,
        peripheral: dma::DmaPeripheral,
        circular_buffer: &'static mut [u8],
    ) {
        channel.enable();
        channel.set_client(self, peripheral);
        self.circular_capacity.set(circular_buffer.len());
        self.rx_dma_buffer.replace(circular_buffer);
        self.rx_dma.set(channel);
        self.rx_dma_peripheral.set(peripheral);
    }

    fn set_baud_rate(&self, baud_rate: u32) -> Result<(), ErrorCode> {
        if baud_rate == 0 {
            return Err(ErrorCode::INVAL);
        }
        // USARTDIV = pclk / (16 * baud), fixed point with a 4-bit
        // fraction. Computed at x100 so the fraction rounds instead of
        // truncating; pclk tops out at 72 MHz so pclk * 25 fits in u32.
        let pclk = self.clock.frequency();
        let divider_x100 = (pclk * 25) / (baud_rate * 4);
        let mut mantissa = divider_x100 / 100;
        let mut fraction = ((divider_x100 - mantissa * 100) * 16 + 50) / 100;
        if fraction == 16 {
            mantissa += 1;
            fraction = 0;
        }
        if mantissa == 0 || mantissa > 0xFFF {
            return Err(ErrorCode::INVAL);
        }
        self.registers
            .brr
            .write(BRR::DIV_MANTISSA.val(mantissa) + BRR::DIV_FRACTION.val(fraction));
        Ok(())
    }

    // Spins on `flag` until set or the deadline passes. Granularity is one
    // tick, so the wait may overshoot by up to one tick period.
    fn wait_for_flag(&self, flag: Field<u32, SR::Register>, start: u32, timeout_ms: u32) -> bool {
        while !self.registers.sr.is_set(flag) {
            if self.tick.elapsed(start) >= timeout_ms {
                return false;
            }
        }
        true
    }

    /// Polled transmit with a millisecond deadline over the whole buffer.
    ///
    /// On timeout the transmitter enable is restored to its prior state
    /// and `TIMEOUT` is returned; bytes already shifted out stay sent.
    pub fn transmit_blocking(&self, data: &[u8], timeout_ms: u32) -> Result<usize, ErrorCode> {
        if data.is_empty() {
            return Err(ErrorCode::SIZE);
        }
        if self.tx_status.get() != UsartStateTx::Idle {
            return Err(ErrorCode::BUSY);
        }
        let te_was_set = self.registers.cr1.is_set(CR1::TE);
        self.registers.cr1.modify(CR1::TE::SET);
        let start = self.tick.now();
        for &byte in data {
            if !self.wait_for_flag(SR::TXE, start, timeout_ms) {
                if !te_was_set {
                    self.registers.cr1.modify(CR1::TE::CLEAR);
                }
                return Err(ErrorCode::TIMEOUT);
            }
            self.registers.dr.set(byte as u32);
        }
        if !self.wait_for_flag(SR::TC, start, timeout_ms) {
            if !te_was_set {
                self.registers.cr1.modify(CR1::TE::CLEAR);
            }
            return Err(ErrorCode::TIMEOUT);
        }
        if !te_was_set {
            self.registers.cr1.modify(CR1::TE::CLEAR);
        }
        Ok(data.len())
    }

    /// Polled receive of exactly `buffer.len()` bytes with a millisecond
    /// deadline over the whole buffer.
    pub fn receive_blocking(&self, buffer: &mut [u8], timeout_ms: u32) -> Result<usize, ErrorCode> {
        if buffer.is_empty() {
            return Err(ErrorCode::SIZE);
        }
        if self.rx_status.get() != UsartStateRx::Idle {
            return Err(ErrorCode::BUSY);
        }
        let re_was_set = self.registers.cr1.is_set(CR1::RE);
        self.registers.cr1.modify(CR1::RE::SET);
        let start = self.tick.now();
        for slot in buffer.iter_mut() {
            if !self.wait_for_flag(SR::RXNE, start, timeout_ms) {
                if !re_was_set {
                    self.registers.cr1.modify(CR1::RE::CLEAR);
                }
                return Err(ErrorCode::TIMEOUT);
            }
            *slot = self.registers.dr.get() as u8;
        }
        if !re_was_set {
            self.registers.cr1.modify(CR1::RE::CLEAR);
        }
        Ok(buffer.len())
    }

    /// Vector body. Flag checks run in a fixed order: receive data first
    /// so it cannot be overrun by later work, then idle-line, then error
    /// conditions, then transmit housekeeping.
    pub fn handle_interrupt(&self) {
        let regs = &*self.registers;

        if regs.sr.is_set(SR::RXNE) && regs.cr1.is_set(CR1::RXNEIE) {
            let byte = regs.dr.get() as u8;
            if self.stream_client.is_some() {
                self.stream_client.map(|client| client.received_byte(byte));
            } else if self.rx_status.get() == UsartStateRx::Receiving {
                let position = self.rx_position.get();
                self.rx_buffer.map(|buffer| {
                    buffer[position] = byte;
                });
                self.rx_position.set(position + 1);
                if position + 1 >= self.rx_len.get() {
                    regs.cr1.modify(CR1::RXNEIE::CLEAR + CR1::PEIE::CLEAR);
                    self.rx_status.set(UsartStateRx::Idle);
                    let len = self.rx_len.get();
                    self.rx_buffer.take().map(|buffer| {
                        self.rx_client.map(|client| {
                            client.received_buffer(buffer, len, Ok(()), uart::Error::None)
                        });
                    });
                }
            } else {
                self.rx_queue.map(|queue| {
                    queue.enqueue(byte);
                });
            }
        }

        if regs.sr.is_set(SR::IDLE) && regs.cr1.is_set(CR1::IDLEIE) {
            // IDLE is cleared by this SR read followed by a DR read.
            let _ = regs.dr.get();
            if self.rx_status.get() == UsartStateRx::ReceivingAutomatic {
                self.handle_idle_line();
            }
        }

        if self.rx_status.get() != UsartStateRx::Idle {
            let error = if regs.sr.is_set(SR::ORE) {
                Some(uart::Error::OverrunError)
            } else if regs.sr.is_set(SR::PE) {
                Some(uart::Error::ParityError)
            } else if regs.sr.is_set(SR::FE) {
                Some(uart::Error::FramingError)
            } else if regs.sr.is_set(SR::NE) {
                Some(uart::Error::NoiseError)
            } else {
                None
            };
            if let Some(error) = error {
                // Sticky error flags clear on SR read then DR read.
                let _ = regs.dr.get();
                if self.rx_status.get() == UsartStateRx::Receiving {
                    regs.cr1.modify(CR1::RXNEIE::CLEAR + CR1::PEIE::CLEAR);
                    self.rx_status.set(UsartStateRx::Idle);
                    let count = self.rx_position.get();
                    self.rx_buffer.take().map(|buffer| {
                        self.rx_client.map(|client| {
                            client.received_buffer(buffer, count, Err(ErrorCode::FAIL), error)
                        });
                    });
                }
            }
        }

        if regs.sr.is_set(SR::TXE) && regs.cr1.is_set(CR1::TXEIE) {
            let position = self.tx_position.get();
            let len = self.tx_len.get();
            if position < len {
                self.tx_buffer.map(|buffer| {
                    regs.dr.set(buffer[position] as u32);
                });
                self.tx_position.set(position + 1);
            }
            if self.tx_position.get() >= len {
                // Last byte handed to the shifter; wait for it to drain.
                regs.cr1.modify(CR1::TXEIE::CLEAR);
                regs.sr.modify(SR::TC::CLEAR);
                regs.cr1.modify(CR1::TCIE::SET);
            }
        }

        if regs.sr.is_set(SR::TC) && regs.cr1.is_set(CR1::TCIE) {
            regs.sr.modify(SR::TC::CLEAR);
            regs.cr1.modify(CR1::TCIE::CLEAR);
            match self.tx_status.get() {
                UsartStateTx::Transmitting => {
                    self.tx_status.set(UsartStateTx::Idle);
                    let len = self.tx_len.get();
                    self.tx_buffer.take().map(|buffer| {
                        self.tx_client
                            .map(|client| client.transmitted_buffer(buffer, len, Ok(())));
                    });
                }
                UsartStateTx::TransmittingDma => {
                    self.tx_status.set(UsartStateTx::Idle);
                    let len = self.tx_len.get();
                    if let Some(channel) = self.tx_dma.get() {
                        if let Some(buffer) = channel.take_buffer() {
                            self.tx_client
                                .map(|client| client.transmitted_buffer(buffer, len, Ok(())));
                        }
                    }
                }
                UsartStateTx::Idle => {}
            }
        }
    }

    // Flush ring bytes that arrived since the previous flush.
    //
    // The DMA counter counts down from the ring capacity and reloads, so
    // the current write offset is capacity - remaining. Between two
    // flushes the writer may have wrapped at most once; more than one lap
    // means silent loss the counter cannot express, which is why the ring
    // is sized for the longest expected message.
    fn handle_idle_line(&self) {
        let capacity = self.circular_capacity.get();
        let remaining = self.rx_dma.map_or(0, |channel| channel.data_counter() as usize);
        let current = capacity - remaining.min(capacity);
        let last = self.last_position.get();
        if current == last {
            return;
        }

        self.rx_dma.map(|channel| {
            channel.map_buffer(|ring| {
                self.rx_queue.map(|queue| {
                    if current > last {
                        for &byte in &ring[last..current] {
                            queue.enqueue(byte);
                        }
                    } else {
                        for &byte in &ring[last..capacity] {
                            queue.enqueue(byte);
                        }
                        for &byte in &ring[..current] {
                            queue.enqueue(byte);
                        }
                    }
                });
            });
        });
        self.last_position.set(current);
        self.deliver_rx_chunk();
    }

    // Drain staged bytes into the pending client buffer, if both exist.
    fn deliver_rx_chunk(&self) {
        if let Some(buffer) = self.rx_buffer.take() {
            let max = self.rx_len.get().min(buffer.len());
            let count = self
                .rx_queue
                .map_or(0, |queue| {
                    let mut count = 0;
                    while count < max {
                        match queue.dequeue() {
                            Some(byte) => {
                                buffer[count] = byte;
                                count += 1;
                            }
                            None => break,
                        }
                    }
                    count
                });
            if count > 0 {
                self.rx_client.map(|client| {
                    client.received_buffer(buffer, count, Ok(()), uart::Error::None)
                });
            } else {
                self.rx_buffer.replace(buffer);
            }
        }
    }
}

impl uart::Configure for Usart<'_> {
    fn configure(&self, params: uart::Parameters) -> Result<(), ErrorCode> {
        if !self.is_enabled() {
            return Err(ErrorCode::OFF);
        }
        if params.width != uart::Width::Eight {
            return Err(ErrorCode::NOSUPPORT);
        }

        match params.parity {
            // With parity on, the 9th frame bit carries it; M = 1 keeps 8
            // data bits.
            uart::Parity::None => {
                self.registers.cr1.modify(CR1::PCE::CLEAR + CR1::M::CLEAR);
            }
            uart::Parity::Odd => {
                self.registers
                    .cr1
                    .modify(CR1::PCE::SET + CR1::PS::SET + CR1::M::SET);
            }
            uart::Parity::Even => {
                self.registers
                    .cr1
                    .modify(CR1::PCE::SET + CR1::PS::CLEAR + CR1::M::SET);
            }
        }

        match params.stop_bits {
            uart::StopBits::One => self.registers.cr2.modify(CR2::STOP::One),
            uart::StopBits::Two => self.registers.cr2.modify(CR2::STOP::Two),
        }

        if params.hw_flow_control {
            self.registers.cr3.modify(CR3::CTSE::SET + CR3::RTSE::SET);
        } else {
            self.registers.cr3.modify(CR3::CTSE::CLEAR + CR3::RTSE::CLEAR);
        }

        self.set_baud_rate(params.baud_rate)
    }
}

impl<'a> uart::Transmit<'a> for Usart<'a> {
    fn set_transmit_client(&self, client: &'a dyn uart::TransmitClient) {
        self.tx_client.set(client);
    }

    fn transmit_buffer(
        &self,
        tx_buffer: &'static mut [u8],
        tx_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if self.tx_status.get() != UsartStateTx::Idle {
            return Err((ErrorCode::BUSY, tx_buffer));
        }
        if tx_len == 0 || tx_len > tx_buffer.len() {
            return Err((ErrorCode::SIZE, tx_buffer));
        }

        if let Some(channel) = self.tx_dma.get() {
            channel.configure(&TX_DMA_CONFIGURATION);
            self.registers.cr3.modify(CR3::DMAT::SET);
            self.registers.cr1.modify(CR1::TE::SET);
            match channel.start(tx_buffer, tx_len) {
                Ok(()) => {
                    self.tx_status.set(UsartStateTx::TransmittingDma);
                    self.tx_len.set(tx_len);
                    Ok(())
                }
                Err((code, buffer)) => {
                    self.registers.cr3.modify(CR3::DMAT::CLEAR);
                    Err((code, buffer))
                }
            }
        } else {
            self.tx_status.set(UsartStateTx::Transmitting);
            self.tx_position.set(0);
            self.tx_len.set(tx_len);
            self.tx_buffer.replace(tx_buffer);
            self.registers.cr1.modify(CR1::TE::SET + CR1::TXEIE::SET);
            Ok(())
        }
    }

    fn transmit_word(&self, _word: u32) -> Result<(), ErrorCode> {
        Err(ErrorCode::NOSUPPORT)
    }

    fn transmit_abort(&self) -> Result<(), ErrorCode> {
        match self.tx_status.get() {
            UsartStateTx::Idle => Ok(()),
            UsartStateTx::Transmitting => {
                self.registers
                    .cr1
                    .modify(CR1::TXEIE::CLEAR + CR1::TCIE::CLEAR);
                self.tx_status.set(UsartStateTx::Idle);
                let sent = self.tx_position.get();
                self.tx_buffer.take().map(|buffer| {
                    self.tx_client.map(|client| {
                        client.transmitted_buffer(buffer, sent, Err(ErrorCode::CANCEL))
                    });
                });
                Err(ErrorCode::BUSY)
            }
            UsartStateTx::TransmittingDma => {
                self.registers.cr3.modify(CR3::DMAT::CLEAR);
                self.tx_status.set(UsartStateTx::Idle);
                if let Some(channel) = self.tx_dma.get() {
                    let (buffer, remaining) = channel.abort();
                    let sent = self.tx_len.get().saturating_sub(remaining as usize);
                    if let Some(buffer) = buffer {
                        self.tx_client.map(|client| {
                            client.transmitted_buffer(buffer, sent, Err(ErrorCode::CANCEL))
                        });
                    }
                }
                Err(ErrorCode::BUSY)
            }
        }
    }
}

impl<'a> uart::Receive<'a> for Usart<'a> {
    fn set_receive_client(&self, client: &'a dyn uart::ReceiveClient) {
        self.rx_client.set(client);
    }

    fn receive_buffer(
        &self,
        rx_buffer: &'static mut [u8],
        rx_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if self.rx_status.get() != UsartStateRx::Idle {
            return Err((ErrorCode::BUSY, rx_buffer));
        }
        if rx_len == 0 || rx_len > rx_buffer.len() {
            return Err((ErrorCode::SIZE, rx_buffer));
        }

        if let Some(channel) = self.rx_dma.get() {
            channel.configure(&RX_DMA_CONFIGURATION);
            self.registers.cr3.modify(CR3::DMAR::SET);
            self.registers.cr1.modify(CR1::RE::SET);
            match channel.start(rx_buffer, rx_len) {
                Ok(()) => {
                    self.rx_status.set(UsartStateRx::ReceivingDma);
                    self.rx_len.set(rx_len);
                    Ok(())
                }
                Err((code, buffer)) => {
                    self.registers.cr3.modify(CR3::DMAR::CLEAR);
                    Err((code, buffer))
                }
            }
        } else {
            self.rx_status.set(UsartStateRx::Receiving);
            self.rx_position.set(0);
            self.rx_len.set(rx_len);
            self.rx_buffer.replace(rx_buffer);
            self.registers
                .cr1
                .modify(CR1::RE::SET + CR1::RXNEIE::SET + CR1::PEIE::SET);
            Ok(())
        }
    }

    fn receive_word(&self) -> Result<(), ErrorCode> {
        Err(ErrorCode::NOSUPPORT)
    }

    fn receive_abort(&self) -> Result<(), ErrorCode> {
        match self.rx_status.get() {
            UsartStateRx::Idle => Ok(()),
            UsartStateRx::Receiving => {
                self.registers
                    .cr1
                    .modify(CR1::RXNEIE::CLEAR + CR1::PEIE::CLEAR);
                self.rx_status.set(UsartStateRx::Idle);
                let count = self.rx_position.get();
                self.rx_buffer.take().map(|buffer| {
                    self.rx_client.map(|client| {
                        client.received_buffer(
                            buffer,
                            count,
                            Err(ErrorCode::CANCEL),
                            uart::Error::Aborted,
                        )
                    });
                });
                Err(ErrorCode::BUSY)
            }
            UsartStateRx::ReceivingDma => {
                self.registers.cr3.modify(CR3::DMAR::CLEAR);
                self.rx_status.set(UsartStateRx::Idle);
                if let Some(channel) = self.rx_dma.get() {
                    let (buffer, remaining) = channel.abort();
                    let received = self.rx_len.get().saturating_sub(remaining as usize);
                    if let Some(buffer) = buffer {
                        self.rx_client.map(|client| {
                            client.received_buffer(
                                buffer,
                                received,
                                Err(ErrorCode::CANCEL),
                                uart::Error::Aborted,
                            )
                        });
                    }
                }
                Err(ErrorCode::BUSY)
            }
            UsartStateRx::ReceivingAutomatic => {
                self.registers.cr1.modify(CR1::IDLEIE::CLEAR);
                self.registers.cr3.modify(CR3::DMAR::CLEAR);
                self.rx_status.set(UsartStateRx::Idle);
                self.last_position.set(0);
                self.rx_queue.map(|queue| queue.empty());
                if let Some(channel) = self.rx_dma.get() {
                    let (ring, _) = channel.abort();
                    self.rx_dma_buffer.put(ring);
                }
                match self.rx_buffer.take() {
                    Some(buffer) => {
                        self.rx_client.map(|client| {
                            client.received_buffer(
                                buffer,
                                0,
                                Err(ErrorCode::CANCEL),
                                uart::Error::Aborted,
                            )
                        });
                        Err(ErrorCode::BUSY)
                    }
                    None => Ok(()),
                }
            }
        }
    }
}

impl<'a> uart::ReceiveAdvanced<'a> for Usart<'a> {
    fn receive_automatic(
        &self,
        rx_buffer: &'static mut [u8],
        rx_len: usize,
        _interbyte_timeout: u8,
    ) -> Result<(), (ErrorCode, &'static mut [u8])> {
        if rx_len == 0 || rx_len > rx_buffer.len() {
            return Err((ErrorCode::SIZE, rx_buffer));
        }
        match self.rx_status.get() {
            UsartStateRx::Receiving | UsartStateRx::ReceivingDma => {
                return Err((ErrorCode::BUSY, rx_buffer));
            }
            UsartStateRx::ReceivingAutomatic => {
                if self.rx_buffer.is_some() {
                    return Err((ErrorCode::BUSY, rx_buffer));
                }
            }
            UsartStateRx::Idle => {
                // First call: arm the circular channel over the ring. It
                // stays armed across completions; later calls only supply
                // a fresh client buffer.
                let channel = match self.rx_dma.get() {
                    Some(channel) => channel,
                    None => return Err((ErrorCode::OFF, rx_buffer)),
                };
                let ring = match self.rx_dma_buffer.take() {
                    Some(ring) => ring,
                    None => return Err((ErrorCode::OFF, rx_buffer)),
                };
                let capacity = ring.len();
                channel.configure(&RX_CIRCULAR_DMA_CONFIGURATION);
                if let Err((code, ring)) = channel.start(ring, capacity) {
                    self.rx_dma_buffer.replace(ring);
                    return Err((code, rx_buffer));
                }
                self.registers.cr3.modify(CR3::DMAR::SET);
                self.registers.cr1.modify(CR1::RE::SET + CR1::IDLEIE::SET);
                self.last_position.set(0);
                self.rx_status.set(UsartStateRx::ReceivingAutomatic);
            }
        }

        self.rx_len.set(rx_len);
        self.rx_buffer.replace(rx_buffer);
        // Bytes that arrived between the previous completion and this
        // call are already staged; hand them over right away.
        if self.rx_queue.map_or(false, |queue| !queue.is_empty()) {
            self.deliver_rx_chunk();
        }
        Ok(())
    }
}

impl dma::DmaClient for Usart<'_> {
    fn transfer_complete(&self, peripheral: dma::DmaPeripheral) {
        if self.tx_dma_peripheral.contains(&peripheral) {
            // All bytes are in the data register path; let the TC
            // interrupt report once the shifter drains.
            self.registers.cr3.modify(CR3::DMAT::CLEAR);
            self.registers.sr.modify(SR::TC::CLEAR);
            self.registers.cr1.modify(CR1::TCIE::SET);
        } else if self.rx_dma_peripheral.contains(&peripheral) {
            match self.rx_status.get() {
                UsartStateRx::ReceivingDma => {
                    self.registers.cr3.modify(CR3::DMAR::CLEAR);
                    self.rx_status.set(UsartStateRx::Idle);
                    let len = self.rx_len.get();
                    if let Some(channel) = self.rx_dma.get() {
                        if let Some(buffer) = channel.take_buffer() {
                            self.rx_client.map(|client| {
                                client.received_buffer(buffer, len, Ok(()), uart::Error::None)
                            });
                        }
                    }
                }
                // Circular lap wrap; the idle-line flush tracks the write
                // position itself.
                UsartStateRx::ReceivingAutomatic => {}
                _ => {}
            }
        }
    }

    fn transfer_error(&self, peripheral: dma::DmaPeripheral) {
        if self.tx_dma_peripheral.contains(&peripheral) {
            self.registers.cr3.modify(CR3::DMAT::CLEAR);
            self.tx_status.set(UsartStateTx::Idle);
            if let Some(channel) = self.tx_dma.get() {
                let sent = self
                    .tx_len
                    .get()
                    .saturating_sub(channel.data_counter() as usize);
                if let Some(buffer) = channel.take_buffer() {
                    self.tx_client.map(|client| {
                        client.transmitted_buffer(buffer, sent, Err(ErrorCode::FAIL))
                    });
                }
            }
        } else if self.rx_dma_peripheral.contains(&peripheral) {
            self.registers.cr3.modify(CR3::DMAR::CLEAR);
            match self.rx_status.get() {
                UsartStateRx::ReceivingDma => {
                    self.rx_status.set(UsartStateRx::Idle);
                    if let Some(channel) = self.rx_dma.get() {
                        let received = self
                            .rx_len
                            .get()
                            .saturating_sub(channel.data_counter() as usize);
                        if let Some(buffer) = channel.take_buffer() {
                            self.rx_client.map(|client| {
                                client.received_buffer(
                                    buffer,
                                    received,
                                    Err(ErrorCode::FAIL),
                                    uart::Error::None,
                                )
                            });
                        }
                    }
                }
                UsartStateRx::ReceivingAutomatic => {
                    self.registers.cr1.modify(CR1::IDLEIE::CLEAR);
                    self.rx_status.set(UsartStateRx::Idle);
                    self.last_position.set(0);
                    if let Some(channel) = self.rx_dma.get() {
                        self.rx_dma_buffer.put(channel.take_buffer());
                    }
                    if let Some(buffer) = self.rx_buffer.take() {
                        self.rx_client.map(|client| {
                            client.received_buffer(
                                buffer,
                                0,
                                Err(ErrorCode::FAIL),
                                uart::Error::None,
                            )
                        });
                    }
                }
                UsartStateRx::Idle | UsartStateRx::Receiving => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::hil::uart::{Configure, Receive, ReceiveAdvanced, Transmit};
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::vec::Vec;

    fn fake_usart() -> &'static Usart<'static> {
        let registers = unsafe {
            StaticRef::new(Box::leak(Box::new(core::mem::zeroed::<UsartRegisters>())) as *const _)
        };
        let rcc = Box::leak(Box::new(rcc::Rcc::new(unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<rcc::RccRegisters>())) as *const _,
            )
        })));
        let tick = Box::leak(Box::new(SysTick::new(unsafe {
            StaticRef::new(Box::leak(Box::new(core::mem::zeroed::<
                crate::systick::SysTickRegisters,
            >())) as *const _)
        })));
        Box::leak(Box::new(Usart::new(
            registers,
            rcc::PeripheralClockType::APB2(rcc::PCLK2::USART1),
            rcc,
            tick,
        )))
    }

    fn fake_dma_channel(id: dma::ChannelId) -> &'static dma::Channel<'static> {
        let registers = unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<dma::Dma1Registers>())) as *const _,
            )
        };
        let rcc = Box::leak(Box::new(rcc::Rcc::new(unsafe {
            StaticRef::new(
                Box::leak(Box::new(core::mem::zeroed::<rcc::RccRegisters>())) as *const _,
            )
        })));
        Box::leak(Box::new(dma::Channel::new(registers, id, rcc)))
    }

    struct TxRecorder {
        completions: RefCell<Vec<(usize, Result<(), ErrorCode>)>>,
        buffer: RefCell<Option<&'static mut [u8]>>,
    }

    impl TxRecorder {
        fn new() -> TxRecorder {
            TxRecorder {
                completions: RefCell::new(Vec::new()),
                buffer: RefCell::new(None),
            }
        }
    }

    impl uart::TransmitClient for TxRecorder {
        fn transmitted_buffer(
            &self,
            tx_buffer: &'static mut [u8],
            tx_len: usize,
            rval: Result<(), ErrorCode>,
        ) {
            self.completions.borrow_mut().push((tx_len, rval));
            *self.buffer.borrow_mut() = Some(tx_buffer);
        }
    }

    struct RxRecorder {
        chunks: RefCell<Vec<Vec<u8>>>,
        buffer: RefCell<Option<&'static mut [u8]>>,
    }

    impl RxRecorder {
        fn new() -> RxRecorder {
            RxRecorder {
                chunks: RefCell::new(Vec::new()),
                buffer: RefCell::new(None),
            }
        }
    }

    impl uart::ReceiveClient for RxRecorder {
        fn received_buffer(
            &self,
            rx_buffer: &'static mut [u8],
            rx_len: usize,
            _rval: Result<(), ErrorCode>,
            _error: uart::Error,
        ) {
            self.chunks.borrow_mut().push(rx_buffer[..rx_len].to_vec());
            *self.buffer.borrow_mut() = Some(rx_buffer);
        }
    }

    #[test]
    fn second_transmit_while_busy_leaves_first_untouched() {
        let usart = fake_usart();
        usart.enable();
        let client = Box::leak(Box::new(TxRecorder::new()));
        usart.set_transmit_client(client);

        let first: &'static mut [u8] = Box::leak(Box::new([0xAA, 0xBB]));
        assert!(usart.transmit_buffer(first, 2).is_ok());

        let second: &'static mut [u8] = Box::leak(Box::new([0xCC]));
        let (code, returned) = usart.transmit_buffer(second, 1).unwrap_err();
        assert_eq!(code, ErrorCode::BUSY);
        assert_eq!(returned[0], 0xCC);

        // The in-flight transfer proceeds byte by byte, unaffected.
        usart.registers.sr.modify(SR::TXE::SET);
        usart.handle_interrupt();
        assert_eq!(usart.registers.dr.get(), 0xAA);
        usart.handle_interrupt();
        assert_eq!(usart.registers.dr.get(), 0xBB);
        assert!(!usart.registers.cr1.is_set(CR1::TXEIE));

        usart.registers.sr.modify(SR::TC::SET);
        usart.handle_interrupt();
        assert_eq!(*client.completions.borrow(), [(2, Ok(()))]);
    }

    #[test]
    fn interrupt_receive_collects_exact_count() {
        let usart = fake_usart();
        usart.enable();
        let client = Box::leak(Box::new(RxRecorder::new()));
        usart.set_receive_client(client);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 3]));
        assert!(usart.receive_buffer(buffer, 3).is_ok());
        for byte in [0x41u8, 0x42, 0x43] {
            usart.registers.dr.set(byte as u32);
            usart.registers.sr.modify(SR::RXNE::SET);
            usart.handle_interrupt();
        }
        assert_eq!(client.chunks.borrow().len(), 1);
        assert_eq!(client.chunks.borrow()[0], [0x41, 0x42, 0x43]);
        assert!(!usart.registers.cr1.is_set(CR1::RXNEIE));
    }

    #[test]
    fn idle_line_flushes_only_new_bytes_across_wrap() {
        let usart = fake_usart();
        usart.enable();
        let client = Box::leak(Box::new(RxRecorder::new()));
        usart.set_receive_client(client);

        let storage: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
        let queue = Box::leak(Box::new(RingBuffer::new(storage)));
        usart.set_rx_queue(queue);

        let ring: &'static mut [u8] =
            Box::leak(Box::new(core::array::from_fn::<u8, 16, _>(|i| i as u8)));
        let channel = fake_dma_channel(dma::ChannelId::Channel5);
        usart.set_rx_dma_channel(channel, dma::DmaPeripheral::Usart1Rx, ring);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 32]));
        assert!(usart.receive_automatic(buffer, 32, 0).is_ok());

        // 12 bytes landed in the ring: counter counted down 16 -> 4.
        channel.set_data_counter(4);
        usart.registers.sr.modify(SR::IDLE::SET);
        usart.handle_interrupt();
        assert_eq!(client.chunks.borrow().len(), 1);
        assert_eq!(
            client.chunks.borrow()[0],
            (0..12).collect::<Vec<u8>>()
        );

        // Next message wraps the ring: 7 more bytes, write position 3.
        let buffer = client.buffer.borrow_mut().take().unwrap();
        assert!(usart.receive_automatic(buffer, 32, 0).is_ok());
        channel.set_data_counter(13);
        usart.registers.sr.modify(SR::IDLE::SET);
        usart.handle_interrupt();
        assert_eq!(client.chunks.borrow().len(), 2);
        assert_eq!(client.chunks.borrow()[1], [12, 13, 14, 15, 0, 1, 2]);
    }

    #[test]
    fn idle_with_no_new_bytes_reports_nothing() {
        let usart = fake_usart();
        usart.enable();
        let client = Box::leak(Box::new(RxRecorder::new()));
        usart.set_receive_client(client);

        let storage: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
        usart.set_rx_queue(Box::leak(Box::new(RingBuffer::new(storage))));
        let ring: &'static mut [u8] = Box::leak(Box::new([0u8; 16]));
        let channel = fake_dma_channel(dma::ChannelId::Channel5);
        usart.set_rx_dma_channel(channel, dma::DmaPeripheral::Usart1Rx, ring);

        let buffer: &'static mut [u8] = Box::leak(Box::new([0u8; 8]));
        assert!(usart.receive_automatic(buffer, 8, 0).is_ok());
        // Counter untouched since arming: no bytes arrived.
        usart.registers.sr.modify(SR::IDLE::SET);
        usart.handle_interrupt();
        assert!(client.chunks.borrow().is_empty());
    }

    #[test]
    fn blocking_transmit_times_out_and_restores_state() {
        let usart = fake_usart();
        usart.enable();
        assert!(!usart.registers.cr1.is_set(CR1::TE));
        // TXE never comes up and the deadline is already expired.
        assert_eq!(
            usart.transmit_blocking(&[1, 2, 3], 0),
            Err(ErrorCode::TIMEOUT)
        );
        assert!(!usart.registers.cr1.is_set(CR1::TE));
    }

    #[test]
    fn dma_transmit_reports_after_shifter_drains() {
        let usart = fake_usart();
        usart.enable();
        let client = Box::leak(Box::new(TxRecorder::new()));
        usart.set_transmit_client(client);
        let channel = fake_dma_channel(dma::ChannelId::Channel4);
        usart.set_tx_dma_channel(channel, dma::DmaPeripheral::Usart1Tx);

        let buffer: &'static mut [u8] = Box::leak(Box::new([1u8, 2, 3, 4]));
        assert!(usart.transmit_buffer(buffer, 4).is_ok());
        assert!(usart.registers.cr3.is_set(CR3::DMAT));
        assert!(channel.is_armed());

        // Channel completion arms the TC interrupt but does not report.
        dma::DmaClient::transfer_complete(usart, dma::DmaPeripheral::Usart1Tx);
        assert!(client.completions.borrow().is_empty());
        assert!(!usart.registers.cr3.is_set(CR3::DMAT));
        assert!(usart.registers.cr1.is_set(CR1::TCIE));

        usart.registers.sr.modify(SR::TC::SET);
        usart.handle_interrupt();
        assert_eq!(*client.completions.borrow(), [(4, Ok(()))]);
    }

    #[test]
    fn configure_rejects_narrow_words_and_sets_baud() {
        let usart = fake_usart();
        usart.enable();
        let params = uart::Parameters {
            baud_rate: 115200,
            width: uart::Width::Eight,
            parity: uart::Parity::None,
            stop_bits: uart::StopBits::One,
            hw_flow_control: false,
        };
        assert!(usart.configure(params).is_ok());
        // 8 MHz / (16 * 115200) = 4.34: mantissa 4, fraction 5/16.
        assert_eq!(usart.registers.brr.get(), 0x45);

        let narrow = uart::Parameters {
            width: uart::Width::Seven,
            ..params
        };
        assert_eq!(usart.configure(narrow), Err(ErrorCode::NOSUPPORT));
    }
}
