//! Relic - run a legacy x86 PC from a BIOS image.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relic::clock::ClockMode;
use relic::devices::ata::{Carrier, DiskImage, DriveSelector};
use relic::{Machine, MachineConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClockArg {
    /// One clock pulse per quantum of executed instructions
    Instruction,
    /// Clock pulses from the host's wall clock
    Realtime,
}

impl From<ClockArg> for ClockMode {
    fn from(arg: ClockArg) -> Self {
        match arg {
            ClockArg::Instruction => ClockMode::Instruction,
            ClockArg::Realtime => ClockMode::Realtime,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "relic")]
#[command(about = "An emulator of legacy x86 personal computers")]
struct Args {
    /// System BIOS image (exactly 64 KiB)
    #[arg(short, long)]
    bios: PathBuf,

    /// VGA BIOS image (exactly 32 KiB)
    #[arg(long)]
    vga_bios: Option<PathBuf>,

    /// Hard disk image, e.g. `hd0=disk.img` or `primary-slave=data.img`
    #[arg(long = "hd", value_name = "SELECTOR=PATH", value_parser = parse_drive)]
    hard_disks: Vec<(DriveSelector, PathBuf)>,

    /// CD-ROM image, e.g. `secondary-master=install.iso`
    #[arg(long, value_name = "SELECTOR=PATH", value_parser = parse_drive)]
    cdrom: Option<(DriveSelector, PathBuf)>,

    /// Target instructions per second
    #[arg(long, default_value = "1000000")]
    ips: u64,

    /// Memory size in megabytes
    #[arg(short, long, default_value = "16")]
    memory: u64,

    /// Clock pulse source
    #[arg(long, value_enum, default_value = "instruction")]
    clock: ClockArg,

    /// Instructions per clock pulse
    #[arg(long, default_value = "1")]
    quantum: u64,

    /// Stop after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Run as fast as the host allows
    #[arg(long)]
    no_throttle: bool,

    /// Print a machine dump on exit
    #[arg(long)]
    dump: bool,
}

fn parse_drive(s: &str) -> Result<(DriveSelector, PathBuf), String> {
    let (selector, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SELECTOR=PATH, got `{s}`"))?;
    let selector = selector.parse::<DriveSelector>().map_err(|e| e.to_string())?;
    if path.is_empty() {
        return Err(format!("missing image path for {selector}"));
    }
    Ok((selector, PathBuf::from(path)))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = MachineConfig {
        memory: args.memory * 1024 * 1024,
        ips: args.ips,
        clock_mode: args.clock.into(),
        quantum: args.quantum,
        throttle: !args.no_throttle,
        max_instructions: args.max_instructions,
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(config)?;
    machine.set_serial_sink(Box::new(std::io::stdout()));

    info!("BIOS: {}", args.bios.display());
    machine.load_system_bios(&std::fs::read(&args.bios)?)?;
    if let Some(path) = &args.vga_bios {
        info!("VGA BIOS: {}", path.display());
        machine.load_vga_bios(&std::fs::read(path)?)?;
    }

    for (selector, path) in &args.hard_disks {
        let image = DiskImage::open(path, false)?;
        machine.insert_drive(*selector, Carrier::HardDisk, image, false)?;
    }
    if let Some((selector, path)) = &args.cdrom {
        let image = DiskImage::open(path, true)?;
        machine.insert_drive(*selector, Carrier::Cdrom, image, true)?;
    }

    let exit = machine.run()?;
    info!("stopped: {exit:?}");

    if args.dump {
        print!("{}", machine.dump());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drive() {
        let (selector, path) = parse_drive("hd1=disk.img").unwrap();
        assert_eq!(selector, DriveSelector::new(0, 1));
        assert_eq!(path, PathBuf::from("disk.img"));
        assert!(parse_drive("disk.img").is_err());
        assert!(parse_drive("hd9=disk.img").is_err());
        assert!(parse_drive("sm=").is_err());
    }

    #[test]
    fn test_args_map_onto_flags() {
        let args = Args::try_parse_from([
            "relic", "--bios", "bios.bin", "--hd", "pm=a.img", "--hd", "ps=b.img", "--cdrom",
            "sm=cd.iso", "--no-throttle", "--clock", "realtime",
        ])
        .unwrap();
        assert_eq!(args.hard_disks.len(), 2);
        assert_eq!(args.cdrom.map(|(s, _)| s), Some(DriveSelector::new(1, 0)));
        assert!(args.no_throttle);
        assert_eq!(ClockMode::from(args.clock), ClockMode::Realtime);
        assert_eq!(args.memory, 16);
    }
}
