//! Interface for UART communication.
//!
//! Transmit and receive are independent directions with independent
//! clients. Buffer-taking operations hand a `'static` buffer to the driver
//! and get it back through the matching client callback; on refusal the
//! buffer is returned in the error so the caller never loses it.

use crate::ErrorCode;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopBits {
    One = 1,
    Two = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    Six = 6,
    Seven = 7,
    Eight = 8,
}

/// Runtime line configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Parameters {
    /// Baud rate in bit/s.
    pub baud_rate: u32,
    pub width: Width,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// CTS/RTS hardware flow control.
    pub hw_flow_control: bool,
}

/// The type of error encountered during an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// No error occurred.
    None,
    /// Parity check failed on a received frame.
    ParityError,
    /// Stop bit sampled low.
    FramingError,
    /// A received byte overwrote one not yet read out.
    OverrunError,
    /// Noise detected on the line during a frame.
    NoiseError,
    /// The operation was aborted before completion.
    Aborted,
}

pub trait Configure {
    /// Apply `params` to the hardware.
    ///
    /// Returns `OFF` if the peripheral is not powered, `NOSUPPORT` if a
    /// requested option is not available on this hardware, `INVAL` for an
    /// unachievable baud rate.
    fn configure(&self, params: Parameters) -> Result<(), ErrorCode>;
}

pub trait Transmit<'a> {
    /// Set the client for transmit completion callbacks.
    fn set_transmit_client(&self, client: &'a dyn TransmitClient);

    /// Transmit `tx_len` bytes of `tx_buffer` asynchronously.
    ///
    /// On `Ok(())`, `transmitted_buffer` will be called exactly once when
    /// the transmission completes or fails. On `Err`, the buffer comes
    /// back immediately: `BUSY` if a transmission is already outstanding,
    /// `SIZE` if `tx_len` is zero or exceeds the buffer.
    fn transmit_buffer(
        &self,
        tx_buffer: &'static mut [u8],
        tx_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    /// Transmit a single word of data.
    fn transmit_word(&self, word: u32) -> Result<(), ErrorCode>;

    /// Abort an outstanding transmission.
    ///
    /// Returns `Ok(())` if there was nothing to abort; `Err(BUSY)` if a
    /// transmission was outstanding, in which case `transmitted_buffer`
    /// is called with `Err(CANCEL)` and the bytes sent so far.
    fn transmit_abort(&self) -> Result<(), ErrorCode>;
}

pub trait TransmitClient {
    /// A call to `transmit_buffer` has completed.
    ///
    /// `tx_len` is the number of bytes actually sent.
    fn transmitted_buffer(
        &self,
        tx_buffer: &'static mut [u8],
        tx_len: usize,
        rval: Result<(), ErrorCode>,
    );

    /// A call to `transmit_word` has completed.
    fn transmitted_word(&self, _rval: Result<(), ErrorCode>) {}
}

pub trait Receive<'a> {
    /// Set the client for receive completion callbacks.
    fn set_receive_client(&self, client: &'a dyn ReceiveClient);

    /// Receive exactly `rx_len` bytes into `rx_buffer` asynchronously.
    ///
    /// Error conventions mirror `transmit_buffer`.
    fn receive_buffer(
        &self,
        rx_buffer: &'static mut [u8],
        rx_len: usize,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;

    /// Receive a single word of data.
    fn receive_word(&self) -> Result<(), ErrorCode>;

    /// Abort an outstanding receive; conventions mirror `transmit_abort`.
    fn receive_abort(&self) -> Result<(), ErrorCode>;
}

pub trait ReceiveClient {
    /// A receive operation has completed.
    ///
    /// `rx_len` is the number of valid bytes at the front of `rx_buffer`.
    /// `error` carries the hardware line condition when `rval` is an
    /// error, `Error::None` otherwise.
    fn received_buffer(
        &self,
        rx_buffer: &'static mut [u8],
        rx_len: usize,
        rval: Result<(), ErrorCode>,
        error: Error,
    );

    /// A call to `receive_word` has completed.
    fn received_word(&self, _word: u32, _rval: Result<(), ErrorCode>, _error: Error) {}
}

/// Receive with automatic message framing.
pub trait ReceiveAdvanced<'a>: Receive<'a> {
    /// Receive until the line goes idle.
    ///
    /// Delivers `received_buffer` with whatever bytes (at most `rx_len`)
    /// arrived before the receiver detected an inter-message gap. The
    /// driver keeps collecting across calls, so bytes arriving between a
    /// completion and the next call are not lost. `interbyte_timeout` is
    /// a hint in bit times; hardware with fixed idle detection may ignore
    /// it.
    fn receive_automatic(
        &self,
        rx_buffer: &'static mut [u8],
        rx_len: usize,
        interbyte_timeout: u8,
    ) -> Result<(), (ErrorCode, &'static mut [u8])>;
}

/// Raw byte-stream client.
///
/// When bound on a driver that supports it, interrupt-mode receive
/// delivers each byte here as it arrives instead of staging it.
pub trait StreamClient {
    fn received_byte(&self, byte: u8);
}
