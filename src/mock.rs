//! Simulated bootloader for exercising the session and flash sequencer

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{checksum, FlashLayout, MASS_ERASE, UART_ACK, UART_DISC, UART_NACK};
use crate::transport::{Medium, Transport, TransportError};
use crate::{Options, Session};

#[derive(Clone, Debug, PartialEq)]
enum Rx {
    Idle,
    Complement(u8),
    EraseSelector,
    Address { command: u8, buf: Vec<u8> },
    Data { address: u32, buf: Vec<u8> },
    ReadLength { address: u32, buf: Vec<u8> },
}

pub struct Device {
    pub layout: FlashLayout,
    pub memory: Vec<u8>,
    pub version: u8,
    pub chip_id: u16,

    /// Every byte the host has sent
    pub sent: Vec<u8>,
    /// Bytes queued for the host to read
    pub rx: VecDeque<u8>,

    /// Answer NACK in place of the n-th acknowledgement (zero based)
    pub nack_at: Option<usize>,
    /// Length of `sent` at the moment a NACK was issued
    pub nacked_after: Option<usize>,

    /// Write transactions as (address, length byte)
    pub writes: Vec<(u32, u8)>,
    /// Read transactions as (address, length byte)
    pub reads: Vec<(u32, u8)>,
    pub erases: usize,
    pub jumped: Option<u32>,
    /// Reads attempted after the queue ran dry
    pub timeouts: usize,
    /// Stop answering a read transaction after this many bytes
    pub read_limit: Option<usize>,

    pub timeout_ms: u32,
    synced: bool,
    acks: usize,
    state: Rx,
}

impl Device {
    pub fn new() -> Self {
        let layout = FlashLayout::default();

        Self {
            memory: vec![0xFF; layout.size() as usize],
            layout,
            version: 0x22,
            chip_id: 0x0414,
            sent: vec![],
            rx: VecDeque::new(),
            nack_at: None,
            nacked_after: None,
            writes: vec![],
            reads: vec![],
            erases: 0,
            jumped: None,
            timeouts: 0,
            read_limit: None,
            timeout_ms: 0,
            synced: false,
            acks: 0,
            state: Rx::Idle,
        }
    }

    /// Queue stale output, as left behind by a boot banner
    pub fn with_stale(mut self, stale: &[u8]) -> Self {
        self.rx.extend(stale);
        self
    }

    pub fn nack_at(mut self, n: usize) -> Self {
        self.nack_at = Some(n);
        self
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn read_mem(&self, address: u32, len: usize) -> &[u8] {
        let o = (address - self.layout.base) as usize;
        &self.memory[o..o + len]
    }

    fn ack(&mut self) -> bool {
        let n = self.acks;
        self.acks += 1;

        if self.nack_at == Some(n) {
            self.nack();
            return false;
        }

        self.rx.push_back(UART_ACK);
        true
    }

    fn nack(&mut self) {
        self.rx.push_back(UART_NACK);
        self.nacked_after = Some(self.sent.len());
        self.state = Rx::Idle;
    }

    fn offset(&self, address: u32) -> Option<usize> {
        if self.layout.contains(address) {
            Some((address - self.layout.base) as usize)
        } else {
            None
        }
    }

    fn feed(&mut self, b: u8) {
        self.sent.push(b);

        let state = std::mem::replace(&mut self.state, Rx::Idle);

        self.state = match state {
            Rx::Idle if b == UART_DISC => {
                self.synced = true;
                self.ack();
                Rx::Idle
            }
            // An unsynchronised bootloader ignores everything but the init byte
            Rx::Idle if !self.synced => Rx::Idle,
            Rx::Idle => Rx::Complement(b),
            Rx::Complement(c) if b != !c => {
                self.nack();
                Rx::Idle
            }
            Rx::Complement(c) => self.command(c),
            Rx::EraseSelector if b == MASS_ERASE => {
                if self.ack() {
                    for m in self.memory.iter_mut() {
                        *m = 0xFF;
                    }
                    self.erases += 1;
                }
                Rx::Idle
            }
            Rx::EraseSelector => {
                self.nack();
                Rx::Idle
            }
            Rx::Address { command, mut buf } => {
                buf.push(b);
                if buf.len() < 5 {
                    Rx::Address { command, buf }
                } else if checksum(&buf[..4]) != buf[4] {
                    self.nack();
                    Rx::Idle
                } else {
                    let address = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    self.address(command, address)
                }
            }
            Rx::Data { address, mut buf } => {
                buf.push(b);
                if buf.len() < buf[0] as usize + 3 {
                    Rx::Data { address, buf }
                } else {
                    self.data(address, &buf);
                    Rx::Idle
                }
            }
            Rx::ReadLength { address, mut buf } => {
                buf.push(b);
                if buf.len() < 2 {
                    Rx::ReadLength { address, buf }
                } else if buf[0] != buf[1] {
                    self.nack();
                    Rx::Idle
                } else {
                    self.reads.push((address, buf[0]));
                    if self.ack() {
                        let len = self.read_limit.unwrap_or(256).min(buf[0] as usize + 1);
                        for i in 0..len as u32 {
                            let v = self
                                .offset(address + i)
                                .map(|o| self.memory[o])
                                .unwrap_or(0xFF);
                            self.rx.push_back(v);
                        }
                    }
                    Rx::Idle
                }
            }
        };

        // A NACK always returns the device to idle
        if self.nacked_after == Some(self.sent.len()) {
            self.state = Rx::Idle;
        }
    }

    fn command(&mut self, c: u8) -> Rx {
        match c {
            0x00 => {
                if self.ack() {
                    self.rx.extend(&[2, self.version, 0x00, 0x02]);
                    self.ack();
                }
                Rx::Idle
            }
            0x02 => {
                if self.ack() {
                    let id = self.chip_id.to_be_bytes();
                    self.rx.extend(&[1, id[0], id[1]]);
                    self.ack();
                }
                Rx::Idle
            }
            0x73 => {
                if self.ack() && self.ack() {
                    // Option bytes reloaded, the device resets
                    self.synced = false;
                }
                Rx::Idle
            }
            0x43 => {
                if self.ack() {
                    Rx::EraseSelector
                } else {
                    Rx::Idle
                }
            }
            0x31 | 0x11 | 0x21 => {
                if self.ack() {
                    Rx::Address {
                        command: c,
                        buf: vec![],
                    }
                } else {
                    Rx::Idle
                }
            }
            _ => {
                self.nack();
                Rx::Idle
            }
        }
    }

    fn address(&mut self, command: u8, address: u32) -> Rx {
        if !self.ack() {
            return Rx::Idle;
        }

        match command {
            0x31 => Rx::Data {
                address,
                buf: vec![],
            },
            0x11 => Rx::ReadLength {
                address,
                buf: vec![],
            },
            _ => {
                self.jumped = Some(address);
                self.synced = false;
                Rx::Idle
            }
        }
    }

    fn data(&mut self, address: u32, packet: &[u8]) {
        let (body, sum) = packet.split_at(packet.len() - 1);
        if checksum(body) != sum[0] {
            self.nack();
            return;
        }

        self.writes.push((address, body[0]));
        if !self.ack() {
            return;
        }

        for (i, v) in body[1..].iter().enumerate() {
            if let Some(o) = self.offset(address + i as u32) {
                self.memory[o] = *v;
            }
        }
    }
}

impl Transport for Device {
    type Error = Infallible;

    fn medium(&self) -> Medium {
        Medium::Serial
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError<Infallible>> {
        self.feed(byte);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, TransportError<Infallible>> {
        match self.rx.pop_front() {
            Some(b) => Ok(b),
            None => {
                self.timeouts += 1;
                Err(TransportError::Timeout)
            }
        }
    }

    fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    fn timeout(&self) -> u32 {
        self.timeout_ms
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

pub fn session(device: Device) -> Session<Device, NoDelay> {
    Session::new(device, NoDelay, Options::default())
}

/// A session that has completed its handshake, with the device's counters reset
pub fn connected(device: Device) -> Session<Device, NoDelay> {
    let nack_at = device.nack_at;

    let mut s = session(Device {
        nack_at: None,
        ..device
    });
    s.connect().unwrap();

    let d = s.transport_mut();
    d.sent.clear();
    d.acks = 0;
    d.nack_at = nack_at;

    s
}
