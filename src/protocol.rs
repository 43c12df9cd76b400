//! Wire-level constants and packet framing for the bootloader protocol.

/// Synchronisation byte, sent alone to open a session
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Largest payload of a single write or read transaction
pub const MAX_CHUNK: usize = 256;

/// Erase selector requesting a full-chip (mass) erase
pub const MASS_ERASE: u8 = 0xFF;

pub const FLASH_BASE: u32 = 0x0800_6000;
pub const FLASH_END: u32 = 0x0802_0000;
pub const FLASH_PAGE_SIZE: u32 = 1024;
pub const FLASH_PAGE_COUNT: u32 = 128;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Initial synchronisation, the only command sent without a complement
    Init = 0x7F,

    /// Fetch bootloader version and option bytes
    GetVersion = 0x00,

    /// Gets the chip ID
    GetChipId = 0x02,

    /// Disables the write protection for all Flash memory sectors, resetting the device
    WriteUnprotect = 0x73,

    /// Erases from one to all the Flash memory pages.
    EraseFlash = 0x43,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

/// XOR of every byte in `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Command opcode followed by its ones' complement
pub fn frame_command(command: Command) -> [u8; 2] {
    let c = command.opcode();
    [c, !c]
}

/// Big-endian address followed by its checksum
pub fn frame_address(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Length-prefixed data block followed by a checksum over length and payload.
///
/// The length byte carries `payload.len() - 1`.
///
/// # Panics
///
/// If `payload` is empty or longer than [`MAX_CHUNK`]; callers chunk their
/// data before framing it.
pub fn frame_data(payload: &[u8]) -> Vec<u8> {
    assert!(
        !payload.is_empty() && payload.len() <= MAX_CHUNK,
        "data packets carry 1..={} bytes, got {}",
        MAX_CHUNK,
        payload.len()
    );

    let mut packet = Vec::with_capacity(payload.len() + 2);
    packet.push((payload.len() - 1) as u8);
    packet.extend_from_slice(payload);
    packet.push(checksum(&packet));
    packet
}

/// Programmable flash region of the target device
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FlashLayout {
    pub base: u32,
    pub end: u32,
    pub page_size: u32,
    pub page_count: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            base: FLASH_BASE,
            end: FLASH_END,
            page_size: FLASH_PAGE_SIZE,
            page_count: FLASH_PAGE_COUNT,
        }
    }
}

impl FlashLayout {
    /// Size of the region in bytes
    pub fn size(&self) -> u32 {
        self.end.saturating_sub(self.base)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end
    }
}
