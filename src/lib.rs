//! STM32 UART/CAN Bootloader client.
//!
//! Base on AN3155 and AN3154, targeting a fixed command subset and flash
//! window. A [`Session`] owns one [`Transport`] (serial or CAN) and drives the
//! handshake and per-command exchanges, [`Flash`] layers chunked image
//! writes and read-back on top of it.

use core::fmt::{self, Debug};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod protocol;
use protocol::*;

pub mod transport;
pub use transport::{Medium, Transport, TransportError};

pub mod serial;
pub use serial::SerialTransport;

pub mod can;
pub use can::CanTransport;

pub mod flash;
pub use flash::Flash;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// No handshake yet, or the device reset since the last one
    Disconnected,
    Connected,
    /// The device was told to jump to application code
    Released,
}

/// What went wrong at a point where the bootloader's answer was checked
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fault {
    Nack,
    Unexpected { expected: u8, received: u8 },
    Timeout,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Nack => write!(f, "NACK received"),
            Fault::Unexpected { expected, received } => write!(
                f,
                "expected 0x{:02x}, received 0x{:02x}",
                expected, received
            ),
            Fault::Timeout => write!(f, "no response"),
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("transport error: {0:?}")]
    Transport(TransportError<E>),

    #[error("timed out awaiting bootloader response")]
    Timeout,

    #[error("bootloader handshake failed: {0}")]
    HandshakeFailed(Fault),

    #[error("command issued without a connected bootloader")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(Fault),

    #[error("bootloader did not come back after {attempts} attempt(s)")]
    ReconnectFailed { attempts: u32 },

    #[error("flash erase failed: {0}")]
    EraseFailed(Fault),

    #[error("write failed at 0x{address:08x}: {fault}")]
    WriteFailed { address: u32, fault: Fault },

    #[error("read failed at 0x{address:08x}: {fault}")]
    ReadFailed { address: u32, fault: Fault },

    #[error("verification failed at 0x{address:08x}")]
    VerifyFailed { address: u32 },

    #[error("device rejected: {0}")]
    Rejected(Identity),

    #[error("image i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl<E: Debug> From<TransportError<E>> for Error<E> {
    fn from(e: TransportError<E>) -> Self {
        match e {
            TransportError::Timeout => Self::Timeout,
            e => Self::Transport(e),
        }
    }
}

impl<E: Debug> Error<E> {
    /// Underlying fault for errors raised at an expect point
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Error::Timeout => Some(Fault::Timeout),
            Error::HandshakeFailed(f) | Error::Protocol(f) | Error::EraseFailed(f) => Some(*f),
            Error::WriteFailed { fault, .. } | Error::ReadFailed { fault, .. } => Some(*fault),
            _ => None,
        }
    }

    pub fn is_nack(&self) -> bool {
        self.fault() == Some(Fault::Nack)
    }

    /// Re-tag a protocol fault or timeout as the failure of a larger operation
    pub(crate) fn within<F>(self, wrap: F) -> Self
    where
        F: FnOnce(Fault) -> Self,
    {
        match self {
            Error::Protocol(f) => wrap(f),
            Error::Timeout => wrap(Fault::Timeout),
            e => e,
        }
    }
}

/// Parse a hexadecimal (`0x` prefixed) or decimal address
pub fn parse_address(s: &str) -> Result<u32, core::num::ParseIntError> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub response_timeout_ms: u32,

    /// Timeout used while draining stale input before the handshake
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub drain_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait after requesting a mass erase before awaiting completion
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub erase_delay_ms: u32,

    /// Timeout to wait for a mass erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20000"))]
    pub erase_timeout_ms: u32,

    /// Handshake attempts after write unprotect resets the device
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub reconnect_attempts: u32,

    /// Period to wait for the device to reset between reconnection attempts
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reconnect_delay_ms: u32,

    /// Flash base address, default for write, read and jump
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08006000", parse(try_from_str = parse_address))
    )]
    pub flash_base: u32,

    /// Flash end address, bounds full-range reads
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "0x08020000", parse(try_from_str = parse_address))
    )]
    pub flash_end: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            drain_timeout_ms: 1,
            poll_delay_ms: 1,
            erase_delay_ms: 10,
            erase_timeout_ms: 20_000,
            reconnect_attempts: 3,
            reconnect_delay_ms: 100,
            flash_base: FLASH_BASE,
            flash_end: FLASH_END,
        }
    }
}

impl Options {
    pub fn layout(&self) -> FlashLayout {
        FlashLayout {
            base: self.flash_base,
            end: self.flash_end,
            ..FlashLayout::default()
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<u8> for Version {
    fn from(v: u8) -> Self {
        Self {
            major: v >> 4,
            minor: v & 0x0F,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Bootloader version and chip ID reported by a device
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Identity {
    pub version: Version,
    pub chip_id: u16,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bootloader v{} chip 0x{:04x}", self.version, self.chip_id)
    }
}

/// Bootloader session over a single transport
pub struct Session<T, D> {
    state: State,
    options: Options,
    transport: T,
    delay: D,
}

impl<T, D> Session<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    /// Create a new, unconnected, session
    pub fn new(transport: T, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            options,
            transport,
            delay,
        }
    }

    /// Create a session and perform the initial handshake
    pub fn open(transport: T, delay: D, options: Options) -> Result<Self, Error<T::Error>> {
        let mut s = Self::new(transport, delay, options);
        s.connect()?;
        Ok(s)
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Close the session, returning the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Handshake with the bootloader.
    ///
    /// Drains any stale input (boot messages, earlier responses) then sends
    /// the synchronisation byte and awaits an ACK. Safe to repeat.
    pub fn connect(&mut self) -> Result<(), Error<T::Error>> {
        self.state = State::Disconnected;

        self.transport.set_timeout(self.options.drain_timeout_ms);
        let drained = self.transport.flush_input();
        self.transport.set_timeout(self.options.response_timeout_ms);

        let n = drained?;
        if n > 0 {
            debug!("Discarded {} stale byte(s)", n);
        }

        debug!("Sending discovery character");
        self.transport.write_byte(UART_DISC)?;

        debug!("Awaiting bootloader response");
        self.expect(UART_ACK)
            .map_err(|e| e.within(Error::HandshakeFailed))?;

        debug!("Bootloader connected over {:?}", self.transport.medium());
        self.state = State::Connected;

        Ok(())
    }

    /// Re-run the handshake after a device reset, trying up to
    /// `reconnect_attempts` times
    pub fn reconnect(&mut self) -> Result<(), Error<T::Error>> {
        let attempts = self.options.reconnect_attempts;

        for attempt in 1..=attempts {
            self.delay.delay_ms(self.options.reconnect_delay_ms);

            match self.connect() {
                Ok(()) => return Ok(()),
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => debug!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }

        error!("Bootloader did not return after reset");
        Err(Error::ReconnectFailed { attempts })
    }

    /// Fetch the bootloader version, discarding the option bytes that follow it
    pub fn get_version(&mut self) -> Result<Version, Error<T::Error>> {
        self.command(Command::GetVersion)?;

        let n = self.read_byte()?;
        let version = self.read_byte()?;
        for _ in 0..n {
            self.read_byte()?;
        }

        self.expect(UART_ACK)?;

        let v = Version::from(version);
        debug!("Bootloader version {}", v);

        Ok(v)
    }

    /// Fetch the 16-bit chip ID
    pub fn get_chip_id(&mut self) -> Result<u16, Error<T::Error>> {
        self.command(Command::GetChipId)?;

        self.expect(1)?;
        let h = self.read_byte()?;
        let l = self.read_byte()?;

        self.expect(UART_ACK)?;

        Ok(u16::from_be_bytes([h, l]))
    }

    pub fn identify(&mut self) -> Result<Identity, Error<T::Error>> {
        Ok(Identity {
            version: self.get_version()?,
            chip_id: self.get_chip_id()?,
        })
    }

    /// Identify the device and hand the result to a caller supplied check,
    /// failing with [`Error::Rejected`] if it is declined
    pub fn identify_with<F>(&mut self, accept: F) -> Result<Identity, Error<T::Error>>
    where
        F: FnOnce(&Identity) -> bool,
    {
        let id = self.identify()?;
        if !accept(&id) {
            return Err(Error::Rejected(id));
        }
        Ok(id)
    }

    /// Clear flash write protection.
    ///
    /// The device resets once protection is removed, leaving the session
    /// disconnected; call [`Session::reconnect`] (or `connect`) before issuing
    /// further commands.
    pub fn write_unprotect(&mut self) -> Result<(), Error<T::Error>> {
        self.command(Command::WriteUnprotect)?;

        // From here on the device may reset whether or not we see the second ACK
        self.state = State::Disconnected;
        self.expect(UART_ACK)?;

        debug!("Write protection cleared, device resetting");

        Ok(())
    }

    /// Mass erase the flash
    pub fn erase(&mut self) -> Result<(), Error<T::Error>> {
        self.command(Command::EraseFlash)
            .map_err(|e| e.within(Error::EraseFailed))?;

        self.transport.write_byte(MASS_ERASE)?;
        self.delay.delay_ms(self.options.erase_delay_ms);

        self.transport.set_timeout(self.options.erase_timeout_ms);
        let r = self.expect(UART_ACK);
        self.transport.set_timeout(self.options.response_timeout_ms);

        r.map_err(|e| e.within(Error::EraseFailed))?;
        debug!("Flash erased");

        Ok(())
    }

    /// Start the application at `address`, default the flash base.
    ///
    /// The bootloader is gone once this returns, the session is `Released`.
    pub fn jump(&mut self, address: Option<u32>) -> Result<(), Error<T::Error>> {
        let address = address.unwrap_or(self.options.flash_base);

        self.command(Command::Go)?;
        self.send_address(address)?;

        debug!("Jumped to 0x{:08x}", address);
        self.state = State::Released;

        Ok(())
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), Error<T::Error>> {
        match self.state {
            State::Connected => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    /// Send a command with its complement and await acceptance
    pub(crate) fn command(&mut self, command: Command) -> Result<(), Error<T::Error>> {
        self.ensure_connected()?;

        trace!("Sending command {:?}", command);
        self.transport.write_block(&frame_command(command))?;

        self.expect(UART_ACK)
    }

    pub(crate) fn send_address(&mut self, address: u32) -> Result<(), Error<T::Error>> {
        self.transport.write_block(&frame_address(address))?;
        self.expect(UART_ACK)
    }

    pub(crate) fn send_data(&mut self, data: &[u8]) -> Result<(), Error<T::Error>> {
        self.transport.write_block(&frame_data(data))?;
        self.expect(UART_ACK)
    }

    pub(crate) fn send_read_length(&mut self, len: usize) -> Result<(), Error<T::Error>> {
        let n = (len - 1) as u8;
        self.transport.write_block(&[n, checksum(&[n])])?;
        self.expect(UART_ACK)
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8, Error<T::Error>> {
        Ok(self.transport.read_byte()?)
    }

    fn expect(&mut self, expected: u8) -> Result<(), Error<T::Error>> {
        match self.read_byte()? {
            v if v == expected => Ok(()),
            UART_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Protocol(Fault::Nack))
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::Protocol(Fault::Unexpected {
                    expected,
                    received: v,
                }))
            }
        }
    }
}
