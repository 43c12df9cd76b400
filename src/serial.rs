//! Serial (UART) transport

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::transport::{poll_read, Medium, Transport, TransportError};

/// Transport over any `embedded-hal` serial port
pub struct SerialTransport<P, D> {
    port: P,
    delay: D,
    timeout_ms: u32,
    poll_delay_ms: u32,
}

impl<P, D, E> SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Wrap a serial port, polling it every `poll_delay_ms` while awaiting input
    pub fn new(port: P, delay: D, timeout_ms: u32, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            timeout_ms,
            poll_delay_ms,
        }
    }

    /// Release the underlying port
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Transport for SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn medium(&self) -> Medium {
        Medium::Serial
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError<E>> {
        block!(self.port.write(byte)).map_err(TransportError::Io)
    }

    fn write_block(&mut self, data: &[u8]) -> Result<usize, TransportError<E>> {
        for b in data {
            block!(self.port.write(*b)).map_err(TransportError::Io)?;
        }
        block!(self.port.flush()).map_err(TransportError::Io)?;

        Ok(data.len())
    }

    fn read_byte(&mut self) -> Result<u8, TransportError<E>> {
        let port = &mut self.port;

        poll_read(&mut self.delay, self.timeout_ms, self.poll_delay_ms, || {
            port.read().map_err(|e| e.map(TransportError::Io))
        })
    }

    fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    fn timeout(&self) -> u32 {
        self.timeout_ms
    }
}
