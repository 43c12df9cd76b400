//! Byte-level transport abstraction shared by the serial and CAN media.

use core::fmt::Debug;

/// Physical medium behind a [`Transport`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Medium {
    Serial,
    Can,
}

#[derive(Clone, PartialEq, Debug)]
pub enum TransportError<E> {
    /// No byte arrived within the configured read timeout
    Timeout,
    /// The driver could not construct a frame for the outgoing byte
    InvalidFrame,
    /// Underlying driver error
    Io(E),
}

/// Byte send/receive primitives the session is built on.
///
/// Reads block until a byte arrives or the timeout set with
/// [`Transport::set_timeout`] elapses.
pub trait Transport {
    type Error: Debug;

    fn medium(&self) -> Medium;

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError<Self::Error>>;

    /// Write a block of bytes back-to-back, returning the number sent
    fn write_block(&mut self, data: &[u8]) -> Result<usize, TransportError<Self::Error>> {
        for b in data {
            self.write_byte(*b)?;
        }
        Ok(data.len())
    }

    fn read_byte(&mut self) -> Result<u8, TransportError<Self::Error>>;

    /// Set the read timeout in milliseconds
    fn set_timeout(&mut self, timeout_ms: u32);

    fn timeout(&self) -> u32;

    /// Discard input until nothing arrives within the current timeout,
    /// returning the number of bytes dropped
    fn flush_input(&mut self) -> Result<usize, TransportError<Self::Error>> {
        let mut n = 0;
        loop {
            match self.read_byte() {
                Ok(b) => {
                    trace!("Discarding stale byte 0x{:02x}", b);
                    n += 1;
                }
                Err(TransportError::Timeout) => return Ok(n),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Poll a non-blocking read until it yields or `timeout_ms` elapses,
/// sleeping `poll_ms` between attempts
pub(crate) fn poll_read<T, E, F, D>(
    delay: &mut D,
    timeout_ms: u32,
    poll_ms: u32,
    mut read: F,
) -> Result<T, TransportError<E>>
where
    F: FnMut() -> nb::Result<T, TransportError<E>>,
    D: embedded_hal::blocking::delay::DelayMs<u32>,
{
    let mut t = 0;

    loop {
        match read() {
            Ok(v) => return Ok(v),
            Err(nb::Error::Other(e)) => return Err(e),
            Err(nb::Error::WouldBlock) => (),
        }

        if t >= timeout_ms {
            return Err(TransportError::Timeout);
        }

        // Always advance so a zero poll period still terminates
        let step = poll_ms.max(1);
        delay.delay_ms(step);
        t += step;
    }
}
