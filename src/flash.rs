//! Chunked flash programming and read-back.
//!
//! Images are moved in transactions of at most [`MAX_CHUNK`] bytes, each one
//! a full command / address / payload exchange. Nothing is retried: a failed
//! chunk aborts the whole operation and leaves flash from that chunk onward
//! undefined.

use std::io::{self, Read, Write};

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{Command, MAX_CHUNK};
use crate::transport::Transport;
use crate::{Error, Session};

/// Flash sequencer borrowing a connected [`Session`]
pub struct Flash<'a, T, D> {
    session: &'a mut Session<T, D>,
}

impl<T, D> Session<T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    pub fn flash(&mut self) -> Flash<'_, T, D> {
        Flash { session: self }
    }
}

/// Pull the next chunk from `source`, an empty read marks the end
fn pull<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, io::ErrorKind> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.kind()),
        }
    }
}

impl<'a, T, D> Flash<'a, T, D>
where
    T: Transport,
    D: DelayMs<u32>,
{
    /// Write an image from `source` starting at `address` (default the flash
    /// base), calling `progress` with the cumulative byte count after every
    /// acknowledged chunk. Returns the number of bytes written.
    pub fn write<R, F>(
        &mut self,
        source: &mut R,
        address: Option<u32>,
        mut progress: F,
    ) -> Result<u32, Error<T::Error>>
    where
        R: Read,
        F: FnMut(u32),
    {
        self.session.ensure_connected()?;

        let mut address = address.unwrap_or(self.session.options().flash_base);
        let mut written = 0;
        let mut buf = [0u8; MAX_CHUNK];

        debug!("Writing image from 0x{:08x}", address);

        loop {
            let n = pull(source, &mut buf).map_err(Error::Io)?;
            if n == 0 {
                break;
            }

            self.write_chunk(address, &buf[..n])?;

            address = address.wrapping_add(n as u32);
            written += n as u32;
            progress(written);
        }

        debug!("Wrote {} bytes", written);

        Ok(written)
    }

    /// Read flash from `start` until `end` (defaults the full flash window)
    /// into `sink`.
    ///
    /// Reads are always whole chunks, so the final one may run past `end`;
    /// trim the output if an exact length matters. Returns the number of
    /// bytes read.
    pub fn read<W, F>(
        &mut self,
        sink: &mut W,
        start: Option<u32>,
        end: Option<u32>,
        mut progress: F,
    ) -> Result<u32, Error<T::Error>>
    where
        W: Write,
        F: FnMut(u32),
    {
        self.session.ensure_connected()?;

        let mut address = start.unwrap_or(self.session.options().flash_base);
        let end = end.unwrap_or(self.session.options().flash_end);
        let mut read = 0;
        let mut buf = [0u8; MAX_CHUNK];

        debug!("Reading 0x{:08x} to 0x{:08x}", address, end);

        while address < end {
            self.read_chunk(address, &mut buf)?;
            sink.write_all(&buf).map_err(|e| Error::Io(e.kind()))?;

            address = address.saturating_add(MAX_CHUNK as u32);
            read += MAX_CHUNK as u32;
            progress(read);
        }

        Ok(read)
    }

    /// Compare flash from `address` (default the flash base) against the
    /// contents of `source`, returning the number of bytes checked
    pub fn verify<R, F>(
        &mut self,
        source: &mut R,
        address: Option<u32>,
        mut progress: F,
    ) -> Result<u32, Error<T::Error>>
    where
        R: Read,
        F: FnMut(u32),
    {
        self.session.ensure_connected()?;

        let mut address = address.unwrap_or(self.session.options().flash_base);
        let mut checked = 0;
        let mut expected = [0u8; MAX_CHUNK];
        let mut actual = [0u8; MAX_CHUNK];

        loop {
            let n = pull(source, &mut expected).map_err(Error::Io)?;
            if n == 0 {
                break;
            }

            self.read_chunk(address, &mut actual[..n])?;

            if let Some(i) = expected[..n].iter().zip(&actual[..n]).position(|(e, a)| e != a) {
                let address = address.wrapping_add(i as u32);
                error!("Verification mismatch at 0x{:08x}", address);
                return Err(Error::VerifyFailed { address });
            }

            address = address.wrapping_add(n as u32);
            checked += n as u32;
            progress(checked);
        }

        Ok(checked)
    }

    fn write_chunk(&mut self, address: u32, chunk: &[u8]) -> Result<(), Error<T::Error>> {
        let failed = |e: Error<T::Error>| e.within(|fault| Error::WriteFailed { address, fault });

        trace!("Writing {} bytes at 0x{:08x}", chunk.len(), address);

        self.session.command(Command::WriteMemory).map_err(failed)?;
        self.session.send_address(address).map_err(failed)?;
        self.session.send_data(chunk).map_err(failed)
    }

    fn read_chunk(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error<T::Error>> {
        let failed = |e: Error<T::Error>| e.within(|fault| Error::ReadFailed { address, fault });

        trace!("Reading {} bytes at 0x{:08x}", buf.len(), address);

        self.session.command(Command::ReadMemory).map_err(failed)?;
        self.session.send_address(address).map_err(failed)?;
        self.session.send_read_length(buf.len()).map_err(failed)?;

        for b in buf.iter_mut() {
            *b = self.session.read_byte().map_err(failed)?;
        }

        Ok(())
    }
}
