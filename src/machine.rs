//! Machine assembly.
//!
//! [`Machine::new`] builds the bus, the interrupt controller and the clock,
//! wires every device to them and performs the initial reset. The CPU sees
//! the rest of the machine through [`Board`], its [`CpuHost`].
//!
//! ```text
//!                ┌──────────────── Board ────────────────┐
//!   ┌─────┐      │ GuestMemory   IoBus ──► pic pit cmos  │
//!   │ Cpu │─────►│                         serial lpt    │
//!   └─────┘      │ DualPic ◄── IrqLine     ata0 ata1     │
//!                │ Clock ──► TimerClient   HoldLine      │
//!                └───────────────────────────────────────┘
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock, ClockConfig, ClockError, ClockMode, SharedClock, MAX_TIMERS};
use crate::cpu::{Cpu, CpuConfig, CpuError, CpuExit, CpuHost, StopHandle};
use crate::devices::ata::{
    AtaChannel, AtaController, AtaError, Carrier, DiskImage, DriveKind, DriveSelector,
    MAX_CHANNELS,
};
use crate::devices::{Cmos, HoldLine, Parallel, Pit, Serial, SharedCmos, SharedPit};
use crate::io::{DeviceId, IoBus, PortWidth, SharedPortDevice};
use crate::memory::{GuestMemory, MemoryError, REAL_MODE_SPAN};
use crate::module::{ModuleError, ResetContext, SharedModule};
use crate::pic::{DualPic, PicDevice, SharedPic};
use crate::rom::{Bios, RomError, SYSTEM_BIOS_BASE, SYSTEM_BIOS_SIZE, VGA_BIOS_BASE, VGA_BIOS_SIZE};

/// Errors building or running a machine.
#[derive(Error, Debug)]
pub enum MachineError {
    /// Guest memory cannot back the real-mode address space.
    #[error("memory size {size:#x} is below the minimum of {min:#x} bytes")]
    MemoryTooSmall { size: u64, min: u64 },

    /// Instruction rate of zero.
    #[error("instructions per second must be positive")]
    ZeroIps,

    /// Instruction quantum of zero.
    #[error("instruction quantum must be positive")]
    ZeroQuantum,

    /// Unsupported number of ATA channels.
    #[error("ATA channel count must be between 1 and {MAX_CHANNELS}, got {0}")]
    AtaChannels(usize),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Rom(#[from] RomError),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Ata(#[from] AtaError),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Guest RAM in bytes.
    pub memory: u64,
    /// Target instructions per second.
    pub ips: u64,
    pub clock_mode: ClockMode,
    /// Instructions per clock pulse in instruction mode.
    pub quantum: u64,
    /// Pulse period in realtime mode.
    pub pulse_period: Duration,
    /// Shortest sleep of the realtime pulse thread.
    pub min_period: Duration,
    pub throttle: bool,
    pub ata_channels: usize,
    /// Timer slots, clamped to [`MAX_TIMERS`].
    pub timer_capacity: usize,
    /// Stop after this many instruction slots.
    pub max_instructions: Option<u64>,
    /// Time an ATA command spends busy before completing.
    pub command_delay_us: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory: 16 << 20,
            ips: 1_000_000,
            clock_mode: ClockMode::Instruction,
            quantum: 1,
            pulse_period: Duration::from_millis(1),
            min_period: Duration::from_millis(1),
            throttle: true,
            ata_channels: MAX_CHANNELS,
            timer_capacity: MAX_TIMERS,
            max_instructions: None,
            command_delay_us: 10,
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.memory < REAL_MODE_SPAN {
            return Err(MachineError::MemoryTooSmall {
                size: self.memory,
                min: REAL_MODE_SPAN,
            });
        }
        if self.ips == 0 {
            return Err(MachineError::ZeroIps);
        }
        if self.quantum == 0 {
            return Err(MachineError::ZeroQuantum);
        }
        if !(1..=MAX_CHANNELS).contains(&self.ata_channels) {
            return Err(MachineError::AtaChannels(self.ata_channels));
        }
        Ok(())
    }

    fn clock_config(&self) -> ClockConfig {
        ClockConfig {
            mode: self.clock_mode,
            ips: self.ips,
            quantum: self.quantum,
            period: self.pulse_period,
            min_period: self.min_period,
            capacity: self.timer_capacity.min(MAX_TIMERS),
        }
    }

    fn cpu_config(&self) -> CpuConfig {
        CpuConfig {
            ips: self.ips,
            throttle: self.throttle,
            min_sleep: self.min_period,
        }
    }
}

/// Everything the CPU can reach.
pub struct Board {
    memory: GuestMemory,
    bus: IoBus,
    pic: SharedPic,
    clock: SharedClock,
    hold: HoldLine,
}

impl Board {
    pub fn bus(&self) -> &IoBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut IoBus {
        &mut self.bus
    }

    pub fn pic(&self) -> &SharedPic {
        &self.pic
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn hold_line(&self) -> &HoldLine {
        &self.hold
    }
}

impl CpuHost for Board {
    fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    fn io_read(&mut self, port: u16, width: PortWidth) -> u32 {
        self.bus.read(port, width)
    }

    fn io_write(&mut self, port: u16, width: PortWidth, value: u32) {
        self.bus.write(port, width, value);
    }

    fn interrupt_pending(&self) -> bool {
        self.pic.borrow().intr()
    }

    fn acknowledge_interrupt(&mut self) -> Option<u8> {
        self.pic.borrow_mut().acknowledge()
    }

    fn hold_requested(&self) -> bool {
        self.hold.is_held()
    }

    fn advance(&mut self, cycles: u64) {
        clock::advance(&self.clock, cycles);
    }
}

/// A module waiting to be wired, with its bus-facing view if it has one.
struct Candidate {
    module: SharedModule,
    ports: Option<SharedPortDevice>,
}

/// A wired module.
struct Slot {
    module: SharedModule,
    device: Option<DeviceId>,
}

/// Modules the machine cannot run without.
const ESSENTIAL: &[&str] = &["pic"];

/// Drop candidates whose required peers are absent.
///
/// Each dropped module is reported and the rest of the machine is built
/// without it.
fn retain_connected(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let names: Vec<&'static str> = candidates.iter().map(|c| c.module.borrow().name()).collect();
    candidates
        .into_iter()
        .filter(|c| {
            let module = c.module.borrow();
            match module.connections().iter().copied().find(|peer| !names.contains(peer)) {
                Some(peer) => {
                    let err = ModuleError::MissingConnection {
                        module: module.name(),
                        peer,
                    };
                    warn!("machine: {err}, skipping");
                    false
                }
                None => true,
            }
        })
        .collect()
}

/// First reset of freshly wired modules.
///
/// A module that fails is reported, loses its ports and IRQ lines and is
/// left out of the machine. Only a failing essential module is an error.
fn reset_wired(board: &mut Board, modules: Vec<Slot>) -> Result<Vec<Slot>, MachineError> {
    let mut kept = Vec::with_capacity(modules.len());
    for slot in modules {
        let name = slot.module.borrow().name();
        let mut ctx = ResetContext::new(&mut board.bus, slot.device, &board.pic, &board.clock);
        let result = slot.module.borrow_mut().reset(&mut ctx);
        match result {
            Ok(()) => {
                debug!("machine: {name} reset");
                kept.push(slot);
            }
            Err(err) if ESSENTIAL.contains(&name) => return Err(err.into()),
            Err(err) => {
                warn!("machine: {name} failed to reset: {err}, leaving it out");
                ctx.release_ports();
                let mut pic = board.pic.borrow_mut();
                for irq in 0..16 {
                    if pic.irq_owner(irq) == Some(name) {
                        if let Err(err) = pic.free_irq(irq) {
                            warn!("machine: {name} keeps IRQ {irq}: {err}");
                        }
                    }
                }
            }
        }
    }
    Ok(kept)
}

pub struct Machine {
    config: MachineConfig,
    cpu: Cpu,
    board: Board,
    bios: Bios,
    modules: Vec<Slot>,
    pit: SharedPit,
    cmos: SharedCmos,
    serial: Rc<RefCell<Serial>>,
    parallel: Rc<RefCell<Parallel>>,
    ata: AtaController,
}

impl Machine {
    /// Build and reset a machine. ROM sockets start erased.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        config.validate()?;
        info!(
            "machine: {} KiB RAM, {} ips, {:?} clock, {} ATA channel(s)",
            config.memory / 1024,
            config.ips,
            config.clock_mode,
            config.ata_channels
        );

        let mut memory = GuestMemory::new(config.memory)?;
        let bios = Bios::new();
        memory.load(SYSTEM_BIOS_BASE, bios.system_bios())?;
        memory.load(VGA_BIOS_BASE, bios.vga_bios())?;
        memory.protect(SYSTEM_BIOS_BASE..SYSTEM_BIOS_BASE + SYSTEM_BIOS_SIZE as u64);
        memory.protect(VGA_BIOS_BASE..VGA_BIOS_BASE + VGA_BIOS_SIZE as u64);

        let pic: SharedPic = Rc::new(RefCell::new(DualPic::new()));
        let clock = Clock::shared(config.clock_config());
        let mut cpu = Cpu::new(config.cpu_config())?;

        let pic_device = Rc::new(RefCell::new(PicDevice::new(pic.clone())));
        let pit: SharedPit = Rc::new(RefCell::new(Pit::new()));
        let cmos: SharedCmos = Rc::new(RefCell::new(Cmos::with_host_time(config.memory)));
        let serial = Rc::new(RefCell::new(Serial::default()));
        let parallel = Rc::new(RefCell::new(Parallel::default()));
        let ata = AtaController::new(config.ata_channels, config.command_delay_us);

        let mut timed: Vec<(&str, Result<(), ClockError>)> = vec![
            ("pit", Pit::attach_timer(&pit, &clock)),
            ("cmos", Cmos::attach_timer(&cmos, &clock)),
        ];
        for channel in ata.channels() {
            timed.push(("ata", AtaChannel::attach_timer(channel, &clock)));
        }
        for (owner, result) in timed {
            if let Err(err) = result {
                warn!("machine: {owner} has no timer: {err}");
            }
        }

        let mut candidates = vec![
            Candidate {
                module: pic_device.clone(),
                ports: Some(pic_device),
            },
            Candidate {
                module: pit.clone(),
                ports: Some(pit.clone()),
            },
            Candidate {
                module: cmos.clone(),
                ports: Some(cmos.clone()),
            },
            Candidate {
                module: serial.clone(),
                ports: Some(serial.clone()),
            },
            Candidate {
                module: parallel.clone(),
                ports: Some(parallel.clone()),
            },
        ];
        for channel in ata.channels() {
            candidates.push(Candidate {
                module: channel.clone(),
                ports: Some(channel.clone()),
            });
        }

        let mut bus = IoBus::new();
        let wired = retain_connected(candidates)
            .into_iter()
            .map(|c| {
                let name = c.module.borrow().name();
                let device = c.ports.map(|ports| bus.attach(name, ports));
                Slot {
                    module: c.module,
                    device,
                }
            })
            .collect();

        let mut board = Board {
            memory,
            bus,
            pic,
            clock,
            hold: HoldLine::new(),
        };
        let modules = reset_wired(&mut board, wired)?;

        cpu.reset();
        Ok(Self {
            config,
            cpu,
            board,
            bios,
            modules,
            pit,
            cmos,
            serial,
            parallel,
            ata,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Change the target instruction rate.
    ///
    /// The CPU throttle and every clock timer are rescaled together, so
    /// device timing in microseconds is unchanged.
    pub fn set_ips(&mut self, ips: u64) -> Result<(), MachineError> {
        if ips == 0 {
            return Err(MachineError::ZeroIps);
        }
        self.cpu.set_ips(ips)?;
        self.board.clock.borrow_mut().set_ips(ips);
        self.config.ips = ips;
        info!("machine: {ips} ips");
        Ok(())
    }

    /// Install the system BIOS image at 0xF0000.
    pub fn load_system_bios(&mut self, image: &[u8]) -> Result<(), MachineError> {
        self.bios.set_system_bios(image)?;
        self.board.memory.load(SYSTEM_BIOS_BASE, self.bios.system_bios())?;
        info!("machine: system BIOS loaded");
        Ok(())
    }

    /// Install the VGA BIOS image at 0xC0000.
    pub fn load_vga_bios(&mut self, image: &[u8]) -> Result<(), MachineError> {
        self.bios.set_vga_bios(image)?;
        self.board.memory.load(VGA_BIOS_BASE, self.bios.vga_bios())?;
        info!("machine: VGA BIOS loaded");
        Ok(())
    }

    pub fn bios(&self) -> &Bios {
        &self.bios
    }

    /// Attach a disk image. Hard disks on the primary channel are also
    /// recorded in CMOS.
    pub fn insert_drive(
        &mut self,
        selector: DriveSelector,
        carrier: Carrier,
        image: DiskImage,
        write_protected: bool,
    ) -> Result<(), MachineError> {
        let name = image.name().to_string();
        self.ata.insert(selector, carrier, image, write_protected)?;
        if carrier == Carrier::HardDisk && selector.index() < 2 {
            self.cmos.borrow_mut().set_hard_disk(selector.index(), true);
        }
        info!("machine: {name} inserted as {selector} ({carrier:?})");
        Ok(())
    }

    /// Detach the image in `selector` and hand it back.
    pub fn eject_drive(&mut self, selector: DriveSelector) -> Result<Option<DiskImage>, MachineError> {
        let kind = self.ata.drive_kind(selector)?;
        let image = self.ata.eject(selector)?;
        if kind == DriveKind::HardDisk && selector.index() < 2 {
            self.cmos.borrow_mut().set_hard_disk(selector.index(), false);
        }
        if let Some(image) = &image {
            info!("machine: {} ejected from {selector}", image.name());
        }
        Ok(image)
    }

    pub fn ata(&self) -> &AtaController {
        &self.ata
    }

    /// Power-on reset of the CPU and every module.
    ///
    /// All modules are reset even if one fails; the first failure is
    /// returned.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.cpu.reset();
        let mut first = None;
        for slot in &self.modules {
            let mut module = slot.module.borrow_mut();
            let mut ctx = ResetContext::new(
                &mut self.board.bus,
                slot.device,
                &self.board.pic,
                &self.board.clock,
            );
            match module.reset(&mut ctx) {
                Ok(()) => debug!("machine: {} reset", module.name()),
                Err(err) => {
                    warn!("machine: {} failed to reset: {err}", module.name());
                    first.get_or_insert(err);
                }
            }
        }
        match first {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Run the CPU until it halts, is stopped, or reaches the configured
    /// instruction limit.
    pub fn run(&mut self) -> Result<CpuExit, MachineError> {
        self.board.clock.borrow_mut().start()?;
        for slot in &self.modules {
            slot.module.borrow_mut().start();
        }
        let exit = self.cpu.run(&mut self.board, self.config.max_instructions);
        for slot in &self.modules {
            slot.module.borrow_mut().stop();
        }
        self.board.clock.borrow_mut().stop();
        info!(
            "machine: {:?} after {} instructions",
            exit,
            self.cpu.instruction_count()
        );
        Ok(exit)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.cpu.stop_handle()
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.board.memory
    }

    pub fn pit(&self) -> &SharedPit {
        &self.pit
    }

    pub fn cmos(&self) -> &SharedCmos {
        &self.cmos
    }

    pub fn serial(&self) -> &Rc<RefCell<Serial>> {
        &self.serial
    }

    /// Send guest serial output to `sink` as it is transmitted.
    pub fn set_serial_sink(&mut self, sink: Box<dyn Write>) {
        self.serial.borrow_mut().set_sink(sink);
    }

    pub fn parallel(&self) -> &Rc<RefCell<Parallel>> {
        &self.parallel
    }

    /// Names of the wired modules, in reset order.
    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|s| s.module.borrow().name()).collect()
    }

    /// Diagnostic snapshot of the CPU, the clock and every module.
    pub fn dump(&self) -> String {
        let mut out = self.cpu.dump();
        out.push_str(&self.board.clock.borrow().dump());
        for slot in &self.modules {
            out.push_str(&slot.module.borrow().dump());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ata::{DriveState, SECTOR_SIZE};
    use crate::devices::REG_HARD_DISK;
    use crate::io::{PortDevice, PortMode};
    use crate::module::Module;

    fn test_config() -> MachineConfig {
        MachineConfig {
            memory: REAL_MODE_SPAN,
            throttle: false,
            max_instructions: Some(100_000),
            ..MachineConfig::default()
        }
    }

    /// A BIOS image with `program` at F000:0000 and a far jump to it at
    /// the reset vector.
    fn bios_with(program: &[u8]) -> Vec<u8> {
        let mut image = vec![0xF4; SYSTEM_BIOS_SIZE];
        image[..program.len()].copy_from_slice(program);
        image[0xFFF0..0xFFF5].copy_from_slice(&[0xEA, 0x00, 0x00, 0x00, 0xF0]);
        image
    }

    fn machine_running(program: &[u8]) -> Machine {
        let mut machine = Machine::new(test_config()).unwrap();
        machine.load_system_bios(&bios_with(program)).unwrap();
        machine
    }

    #[test]
    fn test_config_validation() {
        assert!(MachineConfig::default().validate().is_ok());
        let small = MachineConfig {
            memory: 1 << 20,
            ..MachineConfig::default()
        };
        assert!(matches!(
            small.validate(),
            Err(MachineError::MemoryTooSmall { .. })
        ));
        let no_ips = MachineConfig {
            ips: 0,
            ..MachineConfig::default()
        };
        assert!(matches!(no_ips.validate(), Err(MachineError::ZeroIps)));
        let no_quantum = MachineConfig {
            quantum: 0,
            ..MachineConfig::default()
        };
        assert!(matches!(no_quantum.validate(), Err(MachineError::ZeroQuantum)));
        for channels in [0, 3] {
            let bad = MachineConfig {
                ata_channels: channels,
                ..MachineConfig::default()
            };
            assert!(matches!(bad.validate(), Err(MachineError::AtaChannels(n)) if n == channels));
        }
    }

    #[test]
    fn test_build_wires_every_module() {
        let machine = Machine::new(test_config()).unwrap();
        assert_eq!(
            machine.module_names(),
            ["pic", "pit", "cmos", "serial", "parallel", "ata0", "ata1"]
        );
        let bus = machine.board().bus();
        for (port, name) in [
            (0x20, "pic"),
            (0xA1, "pic"),
            (0x43, "pit"),
            (0x71, "cmos"),
            (0x3F8, "serial"),
            (0x37A, "parallel"),
            (0x1F7, "ata0"),
            (0x3F6, "ata0"),
            (0x177, "ata1"),
            (0x376, "ata1"),
        ] {
            let owner = bus.owner(port).and_then(|id| bus.device_name(id));
            assert_eq!(owner, Some(name), "port {port:#x}");
        }
        assert_eq!(bus.owner(0x3F0), None);

        let pic = machine.board().pic().borrow();
        for (irq, owner) in [(0, "pit"), (4, "serial"), (7, "parallel"), (8, "cmos"), (14, "ata0"), (15, "ata1")] {
            assert_eq!(pic.irq_owner(irq), Some(owner));
        }
        // pit, cmos and one per channel
        assert_eq!(machine.board().clock().borrow().timer_count(), 4);
    }

    #[test]
    fn test_timer_capacity_overflow_degrades() {
        let machine = Machine::new(MachineConfig {
            timer_capacity: 2,
            ..test_config()
        })
        .unwrap();
        assert_eq!(machine.board().clock().borrow().timer_count(), 2);
        assert_eq!(machine.module_names().len(), 7);
    }

    #[test]
    fn test_reset_is_repeatable() {
        let mut machine = Machine::new(test_config()).unwrap();
        machine.reset().unwrap();
        machine.reset().unwrap();
        let pic = machine.board().pic().borrow();
        assert_eq!(pic.irq_owner(14), Some("ata0"));
        assert_eq!(pic.master().imr(), 0xFF);
    }

    #[test]
    fn test_rom_loading() {
        let mut machine = Machine::new(test_config()).unwrap();
        assert_eq!(machine.memory().read_u8(SYSTEM_BIOS_BASE), 0xFF);
        assert!(matches!(
            machine.load_system_bios(&[0; 100]),
            Err(MachineError::Rom(RomError::SizeMismatch { actual: 100, .. }))
        ));
        let image: Vec<u8> = (0..SYSTEM_BIOS_SIZE).map(|i| i as u8).collect();
        machine.load_system_bios(&image).unwrap();
        assert_eq!(machine.bios().system_bios(), &image[..]);
        assert_eq!(machine.memory().read_u8(SYSTEM_BIOS_BASE + 0x1234), 0x34);

        // guest writes into ROM are discarded
        machine.memory().write_u8(SYSTEM_BIOS_BASE + 0x1234, 0);
        assert_eq!(machine.memory().read_u8(SYSTEM_BIOS_BASE + 0x1234), 0x34);

        machine.load_vga_bios(&vec![0x55; VGA_BIOS_SIZE]).unwrap();
        assert_eq!(machine.memory().read_u8(VGA_BIOS_BASE + 0x10), 0x55);
    }

    struct Orphan;

    impl Module for Orphan {
        fn name(&self) -> &'static str {
            "orphan"
        }

        fn reset(&mut self, _ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
            Ok(())
        }

        fn dump(&self) -> String {
            String::new()
        }

        fn connections(&self) -> &'static [&'static str] {
            &["dma"]
        }
    }

    #[test]
    fn test_missing_connection_skips_module() {
        let serial = Rc::new(RefCell::new(Serial::default()));
        let kept = retain_connected(vec![
            Candidate {
                module: Rc::new(RefCell::new(Orphan)),
                ports: None,
            },
            Candidate {
                module: serial.clone(),
                ports: Some(serial),
            },
            Candidate {
                module: Rc::new(RefCell::new(PicDevice::new(Rc::new(RefCell::new(DualPic::new()))))),
                ports: None,
            },
        ]);
        let names: Vec<_> = kept.iter().map(|c| c.module.borrow().name()).collect();
        assert_eq!(names, ["serial", "pic"]);
    }

    /// Claims COM2's ports and IRQ, then fails to reset.
    struct Flaky(&'static str);

    impl PortDevice for Flaky {
        fn read_byte(&mut self, _port: u16) -> u8 {
            0xFF
        }

        fn write_byte(&mut self, _port: u16, _value: u8) {}
    }

    impl Module for Flaky {
        fn name(&self) -> &'static str {
            self.0
        }

        fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
            ctx.request_irq(self.0, Some(3))?;
            ctx.claim_range(0x2F8, 8, PortMode::ReadWrite)?;
            Err(ModuleError::MissingConnection {
                module: self.0,
                peer: "dma",
            })
        }

        fn dump(&self) -> String {
            String::new()
        }
    }

    fn bare_board() -> Board {
        Board {
            memory: GuestMemory::new(REAL_MODE_SPAN).unwrap(),
            bus: IoBus::new(),
            pic: Rc::new(RefCell::new(DualPic::new())),
            clock: Clock::shared(ClockConfig::default()),
            hold: HoldLine::new(),
        }
    }

    fn wire(board: &mut Board, modules: Vec<(SharedModule, SharedPortDevice)>) -> Vec<Slot> {
        modules
            .into_iter()
            .map(|(module, ports)| {
                let name = module.borrow().name();
                Slot {
                    module,
                    device: Some(board.bus.attach(name, ports)),
                }
            })
            .collect()
    }

    #[test]
    fn test_failed_reset_drops_only_that_module() {
        let mut board = bare_board();
        let pic = Rc::new(RefCell::new(PicDevice::new(board.pic.clone())));
        let flaky = Rc::new(RefCell::new(Flaky("flaky")));
        let serial = Rc::new(RefCell::new(Serial::default()));
        let slots = wire(
            &mut board,
            vec![
                (pic.clone(), pic),
                (flaky.clone(), flaky),
                (serial.clone(), serial),
            ],
        );

        let kept = reset_wired(&mut board, slots).unwrap();
        let names: Vec<_> = kept.iter().map(|s| s.module.borrow().name()).collect();
        assert_eq!(names, ["pic", "serial"]);
        assert_eq!(board.bus.owner(0x2F8), None);
        assert_eq!(board.bus.owner(0x2FF), None);
        let owner = board.bus.owner(0x3F8).and_then(|id| board.bus.device_name(id));
        assert_eq!(owner, Some("serial"));
        let pic = board.pic.borrow();
        assert_eq!(pic.irq_owner(3), None);
        assert_eq!(pic.irq_owner(4), Some("serial"));
    }

    #[test]
    fn test_failed_pic_reset_fails_build() {
        let mut board = bare_board();
        let pic = Rc::new(RefCell::new(Flaky("pic")));
        let serial = Rc::new(RefCell::new(Serial::default()));
        let slots = wire(&mut board, vec![(pic.clone(), pic), (serial.clone(), serial)]);
        assert!(matches!(
            reset_wired(&mut board, slots),
            Err(MachineError::Module(ModuleError::MissingConnection { module: "pic", .. }))
        ));
    }

    #[test]
    fn test_set_ips_keeps_device_timing() {
        let mut machine = Machine::new(test_config()).unwrap();
        // Counter 0, mode 2, 1193 input ticks (1 ms).
        let bus = machine.board_mut().bus_mut();
        bus.write_u8(0x43, 0x34);
        bus.write_u8(0x40, 0xA9);
        bus.write_u8(0x40, 0x04);

        machine.set_ips(2_000_000).unwrap();
        assert_eq!(machine.config().ips, 2_000_000);
        assert_eq!(machine.cpu().config().ips, 2_000_000);
        assert_eq!(machine.board().clock().borrow().config().ips, 2_000_000);

        // 1.5 ms at the new rate.
        machine.board_mut().advance(3_000);
        assert_eq!(machine.pit().borrow().expiries(), 1);

        assert!(matches!(machine.set_ips(0), Err(MachineError::ZeroIps)));
        assert_eq!(machine.cpu().config().ips, 2_000_000);
    }

    #[test]
    fn test_insert_and_eject_update_cmos() {
        let mut machine = Machine::new(test_config()).unwrap();
        let hd0 = DriveSelector::new(0, 0);
        let image = DiskImage::from_bytes("hd0", vec![0; 64 * SECTOR_SIZE], false);
        machine.insert_drive(hd0, Carrier::HardDisk, image, false).unwrap();
        assert_eq!(machine.ata().drive_state(hd0).unwrap(), DriveState::PresentIdle);
        assert_eq!(machine.cmos().borrow().read_register(REG_HARD_DISK), 0xF0);

        let image = machine.eject_drive(hd0).unwrap();
        assert_eq!(image.map(|i| i.name().to_string()), Some("hd0".to_string()));
        assert_eq!(machine.ata().drive_state(hd0).unwrap(), DriveState::Absent);
        assert_eq!(machine.cmos().borrow().read_register(REG_HARD_DISK), 0x00);
    }

    #[test]
    fn test_program_writes_to_serial() {
        // mov dx, 0x3f8; mov al, 'H'; out dx, al; mov al, 'i'; out dx, al; cli; hlt
        let mut machine = machine_running(&[
            0xBA, 0xF8, 0x03, 0xB0, b'H', 0xEE, 0xB0, b'i', 0xEE, 0xFA, 0xF4,
        ]);
        assert_eq!(machine.run().unwrap(), CpuExit::Halted);
        assert_eq!(machine.serial().borrow().output(), b"Hi");
    }

    #[test]
    fn test_unknown_port_reads_filler() {
        // mov dx, 0x2e8; in al, dx; mov [0x500], al; in ax, dx; mov [0x502], ax; cli; hlt
        let mut machine = machine_running(&[
            0x31, 0xC0, 0x8E, 0xD8, 0xBA, 0xE8, 0x02, 0xEC, 0xA2, 0x00, 0x05, 0xED, 0xA3,
            0x02, 0x05, 0xFA, 0xF4,
        ]);
        assert_eq!(machine.run().unwrap(), CpuExit::Halted);
        assert_eq!(machine.memory().read_u8(0x500), 0xFF);
        assert_eq!(machine.memory().read_u16(0x502), 0xFFFF);
    }

    #[test]
    fn test_pit_interrupt_reaches_handler() {
        #[rustfmt::skip]
        let program = [
            0x31, 0xC0,                         // xor ax, ax
            0x8E, 0xD8,                         // mov ds, ax
            0x8E, 0xD0,                         // mov ss, ax
            0xBC, 0x00, 0x7C,                   // mov sp, 0x7c00
            0xC7, 0x06, 0x20, 0x00, 0x30, 0x00, // mov word [0x20], handler
            0xC7, 0x06, 0x22, 0x00, 0x00, 0xF0, // mov word [0x22], 0xf000
            0xB0, 0xFE,                         // mov al, 0xfe
            0xE6, 0x21,                         // out 0x21, al
            0xB0, 0x34,                         // mov al, 0x34
            0xE6, 0x43,                         // out 0x43, al
            0xB0, 0x00,                         // mov al, 0
            0xE6, 0x40,                         // out 0x40, al
            0xB0, 0x01,                         // mov al, 1
            0xE6, 0x40,                         // out 0x40, al
            0xFB,                               // sti
            0xF4,                               // wait: hlt
            0x80, 0x3E, 0x00, 0x05, 0x00,       // cmp byte [0x500], 0
            0x74, 0xF8,                         // je wait
            0xFA,                               // cli
            0xF4,                               // hlt
            0xC6, 0x06, 0x00, 0x05, 0x01,       // handler: mov byte [0x500], 1
            0xB0, 0x20,                         // mov al, 0x20
            0xE6, 0x20,                         // out 0x20, al
            0xCF,                               // iret
        ];
        let mut machine = machine_running(&program);
        assert_eq!(machine.run().unwrap(), CpuExit::Halted);
        assert_eq!(machine.memory().read_u8(0x500), 1);
        assert_eq!(machine.board().pic().borrow().master().isr(), 0);
        assert_eq!(machine.cpu().regs().ip, 0x30);
    }

    #[test]
    fn test_identify_through_ports() {
        #[rustfmt::skip]
        let program = [
            0xBA, 0xF6, 0x01, // mov dx, 0x1f6
            0xB0, 0xA0,       // mov al, 0xa0
            0xEE,             // out dx, al
            0xBA, 0xF7, 0x01, // mov dx, 0x1f7
            0xB0, 0xEC,       // mov al, 0xec
            0xEE,             // out dx, al
            0xEC,             // poll: in al, dx
            0xA8, 0x80,       // test al, 0x80
            0x75, 0xFB,       // jnz poll
            0x31, 0xC0,       // xor ax, ax
            0x8E, 0xC0,       // mov es, ax
            0xBF, 0x00, 0x06, // mov di, 0x600
            0xB9, 0x00, 0x01, // mov cx, 256
            0xBA, 0xF0, 0x01, // mov dx, 0x1f0
            0xFC,             // cld
            0xF3, 0x6D,       // rep insw
            0xFA,             // cli
            0xF4,             // hlt
        ];
        let mut machine = machine_running(&program);
        let image = DiskImage::from_bytes("hd0", vec![0; 2048 * SECTOR_SIZE], false);
        machine
            .insert_drive(DriveSelector::new(0, 0), Carrier::HardDisk, image, false)
            .unwrap();
        assert_eq!(machine.run().unwrap(), CpuExit::Halted);

        let mem = machine.memory();
        assert_eq!(mem.read_u16(0x600), 0x0040);
        let total = u32::from(mem.read_u16(0x600 + 120)) | (u32::from(mem.read_u16(0x600 + 122)) << 16);
        assert_eq!(total, 2048);
        assert_eq!(machine.cpu().regs().reg16(crate::cpu::regs::CX), 0);
    }

    #[test]
    fn test_instruction_limit_and_dump() {
        // l: jmp l
        let mut machine = machine_running(&[0xEB, 0xFE]);
        assert_eq!(machine.run().unwrap(), CpuExit::Limit);
        let dump = machine.dump();
        for name in ["cpu:", "clock:", "pic", "pit", "cmos", "serial", "parallel", "ata0", "ata1"] {
            assert!(dump.contains(name), "dump lacks {name}");
        }
    }

    #[test]
    fn test_hold_line_stalls_cpu() {
        let mut machine = machine_running(&[0xEB, 0xFE]);
        let dma = machine.board().hold_line().clone();
        dma.assert();
        assert_eq!(machine.run().unwrap(), CpuExit::Limit);
        assert_eq!(machine.cpu().instruction_count(), 0);
        assert_eq!(machine.cpu().cycles(), 100_000);
        dma.release();
    }
}
