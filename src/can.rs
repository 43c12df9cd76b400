//! CAN transport
//!
//! Each protocol byte travels as the first byte of its own data frame, the
//! remaining seven bytes are zero padding.

use core::fmt::Debug;

use embedded_can::nb::Can;
use embedded_can::{Frame, StandardId};
use embedded_hal::blocking::delay::DelayMs;

use crate::transport::{poll_read, Medium, Transport, TransportError};

/// Frame payload length used for every outgoing byte
pub const CAN_FRAME_LEN: usize = 8;

/// Transport over any `embedded-can` controller
pub struct CanTransport<C, D> {
    can: C,
    delay: D,
    id: StandardId,
    timeout_ms: u32,
    poll_delay_ms: u32,
}

impl<C, D> CanTransport<C, D>
where
    C: Can,
    C::Error: Debug,
    D: DelayMs<u32>,
{
    /// Wrap a CAN controller, transmitting with standard identifier `id`
    pub fn new(can: C, delay: D, id: StandardId, timeout_ms: u32, poll_delay_ms: u32) -> Self {
        Self {
            can,
            delay,
            id,
            timeout_ms,
            poll_delay_ms,
        }
    }

    pub fn into_inner(self) -> (C, D) {
        (self.can, self.delay)
    }
}

impl<C, D> Transport for CanTransport<C, D>
where
    C: Can,
    C::Error: Debug,
    D: DelayMs<u32>,
{
    type Error = C::Error;

    fn medium(&self) -> Medium {
        Medium::Can
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError<C::Error>> {
        let mut data = [0u8; CAN_FRAME_LEN];
        data[0] = byte;

        let frame = C::Frame::new(self.id, &data).ok_or(TransportError::InvalidFrame)?;

        // A displaced lower priority frame is of no interest, only one is ever queued
        let _ = block!(self.can.transmit(&frame)).map_err(TransportError::Io)?;

        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, TransportError<C::Error>> {
        let can = &mut self.can;

        poll_read(&mut self.delay, self.timeout_ms, self.poll_delay_ms, || {
            let frame = can.receive().map_err(|e| e.map(TransportError::Io))?;

            match frame.data().first() {
                Some(b) if frame.is_data_frame() => Ok(*b),
                _ => {
                    debug!("Ignoring frame without payload (id: {:?})", frame.id());
                    Err(nb::Error::WouldBlock)
                }
            }
        })
    }

    fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    fn timeout(&self) -> u32 {
        self.timeout_ms
    }
}
