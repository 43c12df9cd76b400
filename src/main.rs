#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;
use std::fs::File;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use serial_core::Parity;

use stm32_can_uart_loader::{parse_address, Identity, Options, Session, Version};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Use even parity rather than none
    #[structopt(long)]
    even_parity: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Report bootloader version and chip ID
    Info {
        /// Fail unless the chip reports this ID
        #[structopt(long, parse(try_from_str = parse_chip_id))]
        expect_chip_id: Option<u16>,

        /// Fail if the bootloader is older than this (major.minor)
        #[structopt(long, parse(try_from_str = parse_version))]
        min_version: Option<Version>,
    },

    /// Unprotect, erase, program and start a firmware image
    Flash {
        /// Binary image to program
        file: PathBuf,

        /// Address to program from, defaults to the flash base
        #[structopt(long, parse(try_from_str = parse_address))]
        address: Option<u32>,

        /// Skip clearing write protection
        #[structopt(long)]
        no_unprotect: bool,

        /// Skip the mass erase
        #[structopt(long)]
        no_erase: bool,

        /// Read the image back and compare after programming
        #[structopt(long)]
        verify: bool,

        /// Save the programmed region to this file after programming
        #[structopt(long)]
        read_back: Option<PathBuf>,

        /// Stay in the bootloader once done
        #[structopt(long)]
        no_jump: bool,

        /// Address to jump to, defaults to the programming address
        #[structopt(long, parse(try_from_str = parse_address))]
        jump_address: Option<u32>,
    },

    /// Read flash into a file
    Read {
        /// Output file
        file: PathBuf,

        /// Start address, defaults to the flash base
        #[structopt(long, parse(try_from_str = parse_address))]
        start: Option<u32>,

        /// End address, defaults to the flash end
        #[structopt(long, parse(try_from_str = parse_address))]
        end: Option<u32>,
    },

    /// Mass erase the flash
    Erase,

    /// Start the application
    Go {
        /// Address to jump to, defaults to the flash base
        #[structopt(long, parse(try_from_str = parse_address))]
        address: Option<u32>,
    },
}

fn parse_chip_id(s: &str) -> Result<u16, String> {
    let v = parse_address(s).map_err(|e| e.to_string())?;
    u16::try_from(v).map_err(|_| format!("chip ID 0x{:x} exceeds 16 bits", v))
}

fn parse_version(s: &str) -> Result<Version, String> {
    let mut p = s.splitn(2, '.');
    let major = p.next().unwrap_or_default().parse::<u8>();
    let minor = p.next().unwrap_or("0").parse::<u8>();

    match (major, minor) {
        (Ok(major), Ok(minor)) => Ok(Version { major, minor }),
        _ => Err(format!("invalid version '{}', expected major.minor", s)),
    }
}

fn progress_bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    pb.set_message(msg);
    pb
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let parity = if o.even_parity {
        Parity::ParityEven
    } else {
        Parity::ParityNone
    };

    let mut s = Session::linux(&o.port, o.baud, parity, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    info!("Connecting to bootloader");

    s.connect().context("Error connecting to bootloader")?;

    info!("Bootloader connected!");

    match o.operation {
        Operation::Info {
            expect_chip_id,
            min_version,
        } => {
            let accept = |id: &Identity| {
                expect_chip_id.map(|c| c == id.chip_id).unwrap_or(true)
                    && min_version.map(|v| id.version >= v).unwrap_or(true)
            };

            let id = s.identify_with(accept)?;

            info!("Bootloader version: {}", id.version);
            info!("Chip ID: 0x{}", hex::encode(id.chip_id.to_be_bytes()));
        }
        Operation::Flash {
            file,
            address,
            no_unprotect,
            no_erase,
            verify,
            read_back,
            no_jump,
            jump_address,
        } => {
            let mut image = File::open(&file)
                .with_context(|| format!("Unable to open {}", file.display()))?;
            let size = image.metadata()?.len();
            let base = address.unwrap_or(o.options.flash_base);

            if size > o.options.flash_end.saturating_sub(base) as u64 {
                return Err(anyhow!(
                    "Image of {} does not fit in flash from 0x{:08x}",
                    bytefmt::format(size),
                    base
                ));
            }

            info!("Programming {} ({})", file.display(), bytefmt::format(size));

            if !no_unprotect {
                s.write_unprotect()
                    .context("Unable to execute write unprotect")?;
                s.reconnect().context("Unable to reconnect after unprotect")?;
                info!("Cleared write protection");
            }

            if !no_erase {
                s.erase().context("Unable to erase chip")?;
                info!("Erased flash memory");
            }

            let pb = progress_bar(size, "Writing");
            s.flash()
                .write(&mut image, Some(base), |n| pb.set_position(n as u64))
                .context("Unable to program flash memory")?;
            pb.finish_with_message("Written");

            if verify {
                let mut image = File::open(&file)?;
                let pb = progress_bar(size, "Verifying");
                s.flash()
                    .verify(&mut image, Some(base), |n| pb.set_position(n as u64))?;
                pb.finish_with_message("Verified");
            }

            if let Some(path) = read_back {
                let mut out = File::create(&path)?;
                let end = base.saturating_add(size as u32);
                s.flash().read(&mut out, Some(base), Some(end), |_| ())?;

                // Reads come in whole chunks
                out.set_len(size)?;
                info!("Saved programmed region to {}", path.display());
            }

            if !no_jump {
                s.jump(jump_address.or(Some(base)))?;
                info!("Started application");
            }
        }
        Operation::Read { file, start, end } => {
            let start = start.unwrap_or(o.options.flash_base);
            let end = end.unwrap_or(o.options.flash_end);
            let mut out = File::create(&file)?;

            let pb = progress_bar(end.saturating_sub(start) as u64, "Reading");
            let n = s
                .flash()
                .read(&mut out, Some(start), Some(end), |n| pb.set_position(n as u64))?;
            pb.finish_with_message("Read");

            info!("Read {} into {}", bytefmt::format(n as u64), file.display());
        }
        Operation::Erase => {
            s.erase().context("Unable to erase chip")?;
            info!("Erased flash memory");
        }
        Operation::Go { address } => {
            s.jump(address)?;
            info!("Started application");
        }
    }

    Ok(())
}
