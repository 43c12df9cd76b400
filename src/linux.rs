use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Error, Options, SerialTransport, Session};

/// Serial transport bound to a linux tty
pub type LinuxSerial = SerialTransport<Serial, Delay>;

impl SerialTransport<Serial, Delay> {
    /// Open and configure a linux serial port (8 data bits, 1 stop bit, no flow control)
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        parity: Parity,
        options: &Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(parity);

        port.0.write_settings(&settings)?;

        // Keep driver reads short, response timeouts are handled by polling
        let poll = options.poll_delay_ms.max(1);
        port.0.set_timeout(Duration::from_millis(poll as u64))?;

        Ok(Self::new(
            port,
            Delay {},
            options.response_timeout_ms,
            options.poll_delay_ms,
        ))
    }
}

impl Session<LinuxSerial, Delay> {
    /// Create a new linux serial port session, without connecting
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        parity: Parity,
        options: Options,
    ) -> Result<Self, SerialError> {
        let transport = SerialTransport::linux(port, baud, parity, &options)?;

        // Return instance
        Ok(Self::new(transport, Delay {}, options))
    }
}

/// Errors raised by a linux serial session
pub type LinuxError = Error<IoErrorKind>;
