use std::fs::File;
use std::io::{self, Write};

use anyhow::Context;
use log::error;
use structopt::StructOpt;

use sstflash::cli::{CliError, Opts};
use sstflash::controller::{self, Confirm, Outcome};
use sstflash::image::RomImage;
use sstflash::protocol::NullCriticalSection;
use sstflash::timer::TickSource;
use sstflash::window::{Device, MemoryWindow, ADDRESS_SPACE_SIZE};

/// Reads the BIOS tick's least-significant byte from its well-known
/// real-mode address, 0000:046C, through the same memory window the flash
/// device lives in.
struct BiosTick<'a> {
    map: &'a MemoryWindow,
}

impl<'a> TickSource for BiosTick<'a> {
    fn tick(&self) -> u8 {
        self.map.read(0, 0x046C)
    }
}

/// Reads a single confirmation line from stdin; 'y'/'Y' means yes.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{} ", prompt);
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }

        matches!(line.trim().chars().next(), Some('y') | Some('Y'))
    }
}

fn main() {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    match run(&opts) {
        Ok(outcome) => report(outcome),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

fn run(opts: &Opts) -> anyhow::Result<Outcome> {
    let file = File::open(&opts.image)
        .with_context(|| format!("opening image '{}'", opts.image.display()))?;
    let image = RomImage::load(file, opts.size_override)
        .with_context(|| format!("loading image '{}'", opts.image.display()))?;

    // SAFETY: the flashing path assumes the process's address space
    // identity-maps the legacy 1 MiB low-memory window starting at physical
    // address 0, which only holds under real mode or an equivalent
    // identity-mapped environment. Obtaining that mapping on any other
    // platform is an integration this crate deliberately leaves to the
    // caller (see the memory-window module docs).
    let map = unsafe { MemoryWindow::new(0usize as *mut u8, ADDRESS_SPACE_SIZE) };
    let tick = BiosTick { map: &map };
    let cs = NullCriticalSection;
    let confirm = StdinConfirm;

    Ok(controller::run(&map, &tick, &cs, &confirm, &image, opts.segment))
}

fn report(outcome: Outcome) -> ! {
    match outcome {
        Outcome::Aborted => {
            println!("{}", CliError::UserAborted);
            std::process::exit(1);
        }
        Outcome::DeviceNotRecognized { vendor, device } => {
            println!("device not recognized (vendor {:#04x}, device {:#04x})", vendor, device);
            std::process::exit(1);
        }
        Outcome::AlreadyUpToDate => {
            println!("already up to date");
            std::process::exit(0);
        }
        Outcome::Flashed(n) => {
            println!("flashed {} block(s), complete, reboot", n);
            controller::halt_forever();
        }
        Outcome::DeviceCorrupt(e) => {
            println!("{}, device may be corrupt, reboot", e);
            controller::halt_forever();
        }
        Outcome::VerifyFailed { block, offset } => {
            println!("verify failed at block {} offset {:#x}, reboot", block, offset);
            controller::halt_forever();
        }
    }
}
