//! Real-mode x86 CPU.
//!
//! The CPU never owns the rest of the machine. Each step it talks to a
//! [`CpuHost`], which provides guest memory, port I/O, the interrupt
//! controller's INTR line, the bus-hold line and the clock:
//!
//! ```text
//!            ┌──────────────────── step ────────────────────┐
//!            │                                              │
//!   hold? ──►│ stall (clock still advances)                 │
//!            │                                              │
//!   INTR? ──►│ IF set and no STI/MOV SS shadow:             │
//!            │   acknowledge → push FLAGS, CS, IP → IVT     │
//!            │                                              │
//!   HLT'd? ─►│ idle (clock advances, wait for INTR)         │
//!            │                                              │
//!            │ fetch / decode / execute at CS:IP            │
//!            │ icount += 1, clock += 1                      │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! The run loop paces itself to the configured instructions per second and
//! checks its stop flag at every instruction boundary.

mod alu;
mod exec;
pub mod regs;

pub use regs::{register_names, Flags, RegisterError, Registers, Seg};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::io::PortWidth;
use crate::memory::GuestMemory;
use exec::Outcome;
use regs::{RegisterRef, SP};

/// Errors from CPU configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CpuError {
    /// The instruction rate must be positive.
    #[error("instructions per second must be positive")]
    ZeroIps,
}

/// The CPU's view of the machine.
pub trait CpuHost {
    fn memory(&self) -> &GuestMemory;

    /// Port read. Undeliverable reads return filler; they never fault.
    fn io_read(&mut self, port: u16, width: PortWidth) -> u32;

    /// Port write. Undeliverable writes are dropped.
    fn io_write(&mut self, port: u16, width: PortWidth, value: u32);

    /// State of the INTR line.
    fn interrupt_pending(&self) -> bool;

    /// INTA cycle: the vector of the interrupt to service, if any.
    fn acknowledge_interrupt(&mut self) -> Option<u8>;

    /// A bus master holds the bus.
    fn hold_requested(&self) -> bool;

    /// `cycles` instruction slots elapsed.
    fn advance(&mut self, cycles: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuConfig {
    pub ips: u64,
    /// Pace execution to `ips`.
    pub throttle: bool,
    /// Never sleep for less than this; shorter delays accumulate.
    pub min_sleep: Duration,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            ips: 1_000_000,
            throttle: true,
            min_sleep: Duration::from_millis(1),
        }
    }
}

/// Why [`Cpu::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuExit {
    /// HLT with interrupts disabled: nothing can wake the CPU.
    Halted,
    /// The slot budget passed to `run` was used up.
    Limit,
    /// The stop flag was raised.
    Stopped,
}

/// What one [`Cpu::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Executed,
    /// HLT with IF set; waiting for an interrupt.
    Idle,
    /// The bus is held by another master.
    Stalled,
    /// HLT with IF clear.
    Shutdown,
}

/// Cross-thread handle that stops a running CPU.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Physical address of `seg:off`, wrapped to 20 bits.
fn linear(seg: u16, off: u16) -> u64 {
    ((u64::from(seg) << 4) + u64::from(off)) & 0xF_FFFF
}

struct Throttle {
    origin: Instant,
    base: u64,
}

impl Throttle {
    fn new(cycles: u64) -> Self {
        Self {
            origin: Instant::now(),
            base: cycles,
        }
    }

    fn pace(&mut self, cycles: u64, config: &CpuConfig) {
        if cycles & 0xFF != 0 {
            return;
        }
        let run = u128::from(cycles - self.base);
        let due = Duration::from_nanos((run * 1_000_000_000 / u128::from(config.ips)) as u64);
        let elapsed = self.origin.elapsed();
        if due > elapsed + config.min_sleep {
            thread::sleep(due - elapsed);
        } else if elapsed > due + Duration::from_secs(1) {
            // Too far behind to catch up; start over instead of bursting.
            *self = Self::new(cycles);
        }
    }
}

pub struct Cpu {
    regs: Registers,
    icount: u64,
    cycles: u64,
    halted: bool,
    irq_shadow: bool,
    config: CpuConfig,
    stop: Arc<AtomicBool>,
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Result<Self, CpuError> {
        if config.ips == 0 {
            return Err(CpuError::ZeroIps);
        }
        Ok(Self {
            regs: Registers::new(),
            icount: 0,
            cycles: 0,
            halted: false,
            irq_shadow: false,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Power-on reset. The instruction counter keeps counting.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.halted = false;
        self.irq_shadow = false;
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// Instructions executed since construction.
    pub fn instruction_count(&self) -> u64 {
        self.icount
    }

    /// Instruction slots elapsed, idle and stalled ones included.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub(crate) fn set_ips(&mut self, ips: u64) -> Result<(), CpuError> {
        if ips == 0 {
            return Err(CpuError::ZeroIps);
        }
        self.config.ips = ips;
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Read a register by name as little-endian bytes.
    pub fn register(&self, name: &str) -> Result<Vec<u8>, RegisterError> {
        let (_, r) = regs::lookup(name)?;
        Ok(match r {
            RegisterRef::Gpr32(i) => self.regs.reg32(i).to_le_bytes().to_vec(),
            RegisterRef::Gpr16(i) => self.regs.reg16(i).to_le_bytes().to_vec(),
            RegisterRef::Gpr8(i) => vec![self.regs.reg8(i)],
            RegisterRef::Segment(s) => self.regs.seg(s).to_le_bytes().to_vec(),
            RegisterRef::Ip => self.regs.ip.to_le_bytes().to_vec(),
            RegisterRef::Flags => self.regs.flags.bits().to_le_bytes().to_vec(),
            RegisterRef::InstructionCount => self.icount.to_le_bytes().to_vec(),
        })
    }

    /// Write a register by name from little-endian bytes.
    pub fn set_register(&mut self, name: &str, value: &[u8]) -> Result<(), RegisterError> {
        let (canonical, r) = regs::lookup(name)?;
        if r == RegisterRef::InstructionCount {
            return Err(RegisterError::ReadOnly(canonical));
        }
        if value.len() != r.width() {
            return Err(RegisterError::WidthMismatch {
                name: canonical,
                expected: r.width(),
                actual: value.len(),
            });
        }
        let word = || u16::from_le_bytes([value[0], value[1]]);
        match r {
            RegisterRef::Gpr32(i) => self
                .regs
                .set_reg32(i, u32::from_le_bytes([value[0], value[1], value[2], value[3]])),
            RegisterRef::Gpr16(i) => self.regs.set_reg16(i, word()),
            RegisterRef::Gpr8(i) => self.regs.set_reg8(i, value[0]),
            RegisterRef::Segment(s) => self.regs.set_seg(s, word()),
            RegisterRef::Ip => self.regs.ip = word(),
            RegisterRef::Flags => self.regs.flags = Flags::from_image(word()),
            RegisterRef::InstructionCount => {}
        }
        Ok(())
    }

    /// Suppress interrupt recognition until after the next instruction.
    fn inhibit_interrupts(&mut self) {
        self.irq_shadow = true;
    }

    fn push16(&mut self, mem: &GuestMemory, value: u16) {
        let sp = self.regs.reg16(SP).wrapping_sub(2);
        self.regs.set_reg16(SP, sp);
        mem.write_u16(linear(self.regs.seg(Seg::Ss), sp), value);
    }

    fn pop16(&mut self, mem: &GuestMemory) -> u16 {
        let sp = self.regs.reg16(SP);
        let value = mem.read_u16(linear(self.regs.seg(Seg::Ss), sp));
        self.regs.set_reg16(SP, sp.wrapping_add(2));
        value
    }

    /// Real-mode interrupt entry through the IVT at 0000:0000.
    fn deliver_interrupt(&mut self, mem: &GuestMemory, vector: u8) {
        let flags = self.regs.flags.image();
        let cs = self.regs.seg(Seg::Cs);
        let ip = self.regs.ip;
        self.push16(mem, flags);
        self.push16(mem, cs);
        self.push16(mem, ip);
        self.regs.flags.remove(Flags::IF | Flags::TF);
        let entry = u64::from(vector) * 4;
        self.regs.ip = mem.read_u16(entry);
        self.regs.set_seg(Seg::Cs, mem.read_u16(entry + 2));
    }

    /// Let one instruction slot elapse.
    pub fn step<H: CpuHost + ?Sized>(&mut self, host: &mut H) -> Step {
        if host.hold_requested() {
            self.tick(host);
            return Step::Stalled;
        }

        if self.irq_shadow {
            self.irq_shadow = false;
        } else if self.regs.flags.contains(Flags::IF) && host.interrupt_pending() {
            if let Some(vector) = host.acknowledge_interrupt() {
                self.halted = false;
                self.deliver_interrupt(host.memory(), vector);
            }
        }

        if self.halted {
            self.tick(host);
            return Step::Idle;
        }

        let trap = self.regs.flags.contains(Flags::TF);
        let outcome = exec::execute(self, host);
        self.icount += 1;
        self.tick(host);

        if outcome == Outcome::Halt {
            if !self.regs.flags.contains(Flags::IF) {
                return Step::Shutdown;
            }
            self.halted = true;
        } else if trap {
            self.deliver_interrupt(host.memory(), 1);
        }
        Step::Executed
    }

    fn tick<H: CpuHost + ?Sized>(&mut self, host: &mut H) {
        self.cycles += 1;
        host.advance(1);
    }

    /// Run until halted, stopped, or `limit` instruction slots elapse.
    pub fn run<H: CpuHost + ?Sized>(&mut self, host: &mut H, limit: Option<u64>) -> CpuExit {
        self.stop.store(false, Ordering::Release);
        let mut throttle = Throttle::new(self.cycles);
        let mut slots = 0u64;
        info!(
            "cpu: running at {:04x}:{:04x}, {} ips{}",
            self.regs.seg(Seg::Cs),
            self.regs.ip,
            self.config.ips,
            if self.config.throttle { "" } else { " (unthrottled)" }
        );
        let exit = loop {
            if self.stop.load(Ordering::Acquire) {
                break CpuExit::Stopped;
            }
            if limit.is_some_and(|limit| slots >= limit) {
                break CpuExit::Limit;
            }
            slots += 1;
            if self.step(host) == Step::Shutdown {
                break CpuExit::Halted;
            }
            if self.config.throttle {
                throttle.pace(self.cycles, &self.config);
            }
        };
        debug!(
            "cpu: {:?} at {:04x}:{:04x} after {} instructions",
            exit,
            self.regs.seg(Seg::Cs),
            self.regs.ip,
            self.icount
        );
        exit
    }

    pub fn dump(&self) -> String {
        let r = &self.regs;
        format!(
            "cpu: AX={:04x} BX={:04x} CX={:04x} DX={:04x} SP={:04x} BP={:04x} SI={:04x} DI={:04x}\n\
             cpu: CS={:04x} DS={:04x} ES={:04x} SS={:04x} IP={:04x} FLAGS={:04x} {:?}\n\
             cpu: icount={} halted={}\n",
            r.reg16(regs::AX),
            r.reg16(regs::BX),
            r.reg16(regs::CX),
            r.reg16(regs::DX),
            r.reg16(regs::SP),
            r.reg16(regs::BP),
            r.reg16(regs::SI),
            r.reg16(regs::DI),
            r.seg(Seg::Cs),
            r.seg(Seg::Ds),
            r.seg(Seg::Es),
            r.seg(Seg::Ss),
            r.ip,
            r.flags.image(),
            r.flags,
            self.icount,
            self.halted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const LOAD: u16 = 0x0100;

    /// Flat memory, scripted ports and a one-shot interrupt source.
    struct TestHost {
        mem: GuestMemory,
        ports: HashMap<u16, u32>,
        writes: Vec<(u16, PortWidth, u32)>,
        pending: Option<u8>,
        hold: bool,
        advanced: u64,
    }

    impl TestHost {
        fn new(code: &[u8]) -> Self {
            let mem = GuestMemory::new(0x11_0000).unwrap();
            mem.load(u64::from(LOAD), code).unwrap();
            Self {
                mem,
                ports: HashMap::new(),
                writes: Vec::new(),
                pending: None,
                hold: false,
                advanced: 0,
            }
        }
    }

    impl CpuHost for TestHost {
        fn memory(&self) -> &GuestMemory {
            &self.mem
        }

        fn io_read(&mut self, port: u16, width: PortWidth) -> u32 {
            self.ports.get(&port).copied().unwrap_or(width.filler())
        }

        fn io_write(&mut self, port: u16, width: PortWidth, value: u32) {
            self.writes.push((port, width, value));
        }

        fn interrupt_pending(&self) -> bool {
            self.pending.is_some()
        }

        fn acknowledge_interrupt(&mut self) -> Option<u8> {
            self.pending.take()
        }

        fn hold_requested(&self) -> bool {
            self.hold
        }

        fn advance(&mut self, cycles: u64) {
            self.advanced += cycles;
        }
    }

    fn cpu_at_load() -> Cpu {
        let mut cpu = Cpu::new(CpuConfig {
            throttle: false,
            ..CpuConfig::default()
        })
        .unwrap();
        let regs = cpu.regs_mut();
        regs.set_seg(Seg::Cs, 0);
        regs.ip = LOAD;
        regs.set_reg16(SP, 0x8000);
        cpu
    }

    fn run(code: &[u8]) -> (Cpu, TestHost) {
        let mut host = TestHost::new(code);
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(10_000)), CpuExit::Halted);
        (cpu, host)
    }

    fn ax(cpu: &Cpu) -> u16 {
        cpu.regs().reg16(regs::AX)
    }

    #[test]
    fn test_arithmetic_and_flags() {
        // mov ax, 0x7fff; add ax, 1; hlt
        let (cpu, _) = run(&[0xB8, 0xFF, 0x7F, 0x05, 0x01, 0x00, 0xF4]);
        assert_eq!(ax(&cpu), 0x8000);
        assert!(cpu.regs().flags.contains(Flags::OF | Flags::SF));
        assert_eq!(cpu.instruction_count(), 3);
    }

    #[test]
    fn test_loop_and_memory() {
        // mov cx, 5; xor ax, ax; l: add ax, cx; loop l; mov [0x500], ax; hlt
        let (cpu, host) = run(&[
            0xB9, 0x05, 0x00, 0x31, 0xC0, 0x01, 0xC8, 0xE2, 0xFC, 0xA3, 0x00, 0x05, 0xF4,
        ]);
        assert_eq!(ax(&cpu), 15);
        assert_eq!(host.mem.read_u16(0x500), 15);
    }

    #[test]
    fn test_call_ret_and_stack() {
        // call +1; hlt; mov bx, 0x1234; ret
        let (cpu, _) = run(&[0xE8, 0x01, 0x00, 0xF4, 0xBB, 0x34, 0x12, 0xC3]);
        assert_eq!(cpu.regs().reg16(regs::BX), 0x1234);
        assert_eq!(cpu.regs().reg16(SP), 0x8000);
    }

    #[test]
    fn test_port_io() {
        // mov dx, 0x1f0; in ax, dx; out 0x80, al; in al, 0x99; hlt
        let mut host = TestHost::new(&[0xBA, 0xF0, 0x01, 0xED, 0xE6, 0x80, 0xE4, 0x99, 0xF4]);
        host.ports.insert(0x1F0, 0xBEEF);
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(100)), CpuExit::Halted);
        assert_eq!(host.writes, vec![(0x80, PortWidth::Byte, 0xEF)]);
        // Unknown port answers with filler.
        assert_eq!(ax(&cpu), 0xBEFF);
    }

    #[test]
    fn test_operand_size_prefix_on_io() {
        // mov dx, 0x10; in eax, dx; out dx, eax; hlt
        let mut host = TestHost::new(&[0xBA, 0x10, 0x00, 0x66, 0xED, 0x66, 0xEF, 0xF4]);
        host.ports.insert(0x10, 0x1234_5678);
        let mut cpu = cpu_at_load();
        cpu.run(&mut host, Some(100));
        assert_eq!(cpu.regs().reg32(regs::AX), 0x1234_5678);
        assert_eq!(host.writes, vec![(0x10, PortWidth::Dword, 0x1234_5678)]);
    }

    #[test]
    fn test_rep_stosb() {
        // push cs; pop es; mov di, 0x600; mov cx, 4; mov al, 0xaa; cld; rep stosb; hlt
        let (cpu, host) = run(&[
            0x0E, 0x07, 0xBF, 0x00, 0x06, 0xB9, 0x04, 0x00, 0xB0, 0xAA, 0xFC, 0xF3, 0xAA, 0xF4,
        ]);
        let mut buf = [0u8; 5];
        host.mem.read(0x600, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xAA, 0xAA, 0xAA, 0x00]);
        assert_eq!(cpu.regs().reg16(regs::CX), 0);
        assert_eq!(cpu.regs().reg16(regs::DI), 0x604);
    }

    #[test]
    fn test_undefined_opcode_raises_int6() {
        let mut host = TestHost::new(&[0x0F, 0x0B]);
        // INT 6 handler at 0000:0200 is a HLT.
        host.mem.load(0x18, &[0x00, 0x02, 0x00, 0x00]).unwrap();
        host.mem.load(0x200, &[0xF4]).unwrap();
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(100)), CpuExit::Halted);
        // Return address is the faulting instruction.
        assert_eq!(host.mem.read_u16(0x7FFA), LOAD);
    }

    #[test]
    fn test_divide_error() {
        // xor bl, bl; div bl
        let mut host = TestHost::new(&[0x30, 0xDB, 0xF6, 0xF3]);
        host.mem.load(0x00, &[0x00, 0x03, 0x00, 0x00]).unwrap();
        host.mem.load(0x300, &[0xF4]).unwrap();
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(100)), CpuExit::Halted);
        assert_eq!(cpu.regs().ip, 0x301);
    }

    #[test]
    fn test_external_interrupt_wakes_hlt() {
        // sti; hlt; mov ax, 1; cli; hlt
        let mut host = TestHost::new(&[0xFB, 0xF4, 0xB8, 0x01, 0x00, 0xFA, 0xF4]);
        // Vector 0x08 handler at 0000:0300: iret
        host.mem.load(0x20, &[0x00, 0x03, 0x00, 0x00]).unwrap();
        host.mem.load(0x300, &[0xCF]).unwrap();
        let mut cpu = cpu_at_load();

        assert_eq!(cpu.step(&mut host), Step::Executed);
        assert_eq!(cpu.step(&mut host), Step::Executed);
        assert!(cpu.is_halted());
        assert_eq!(cpu.step(&mut host), Step::Idle);

        host.pending = Some(0x08);
        assert_eq!(cpu.run(&mut host, Some(100)), CpuExit::Halted);
        assert_eq!(ax(&cpu), 1);
    }

    #[test]
    fn test_sti_shadow_delays_interrupt() {
        // sti; nop; hlt
        let mut host = TestHost::new(&[0xFB, 0x90, 0xF4]);
        host.mem.load(0x20, &[0x00, 0x03, 0x00, 0x00]).unwrap();
        host.mem.load(0x300, &[0xFA, 0xF4]).unwrap();
        host.pending = Some(0x08);
        let mut cpu = cpu_at_load();
        cpu.step(&mut host);
        cpu.step(&mut host);
        // The NOP after STI ran before the interrupt was taken.
        assert_eq!(cpu.regs().ip, LOAD + 2);
        assert!(host.pending.is_some());
        cpu.step(&mut host);
        assert_eq!(cpu.regs().ip, 0x301);
        assert!(host.pending.is_none());
    }

    #[test]
    fn test_masked_cpu_ignores_intr() {
        // cli; nop; nop; hlt
        let mut host = TestHost::new(&[0xFA, 0x90, 0x90, 0xF4]);
        host.pending = Some(0x08);
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(100)), CpuExit::Halted);
        assert!(host.pending.is_some());
    }

    #[test]
    fn test_hold_stalls_but_time_passes() {
        let mut host = TestHost::new(&[0x90, 0xF4]);
        host.hold = true;
        let mut cpu = cpu_at_load();
        assert_eq!(cpu.run(&mut host, Some(50)), CpuExit::Limit);
        assert_eq!(cpu.instruction_count(), 0);
        assert_eq!(host.advanced, 50);

        host.hold = false;
        assert_eq!(cpu.run(&mut host, Some(50)), CpuExit::Halted);
        assert_eq!(cpu.instruction_count(), 2);
    }

    #[test]
    fn test_stop_handle() {
        // jmp $
        let mut host = TestHost::new(&[0xEB, 0xFE]);
        let mut cpu = cpu_at_load();
        let handle = cpu.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.stop();
        });
        assert_eq!(cpu.run(&mut host, None), CpuExit::Stopped);
        stopper.join().unwrap();
    }

    #[test]
    fn test_throttle_paces_execution() {
        let mut host = TestHost::new(&[0xEB, 0xFE]);
        let mut cpu = Cpu::new(CpuConfig {
            ips: 100_000,
            throttle: true,
            min_sleep: Duration::from_millis(1),
        })
        .unwrap();
        cpu.regs_mut().set_seg(Seg::Cs, 0);
        cpu.regs_mut().ip = LOAD;
        let started = Instant::now();
        cpu.run(&mut host, Some(5_120));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_named_register_access() {
        let mut cpu = cpu_at_load();
        cpu.set_register("ax", &[0x34, 0x12]).unwrap();
        assert_eq!(cpu.register("AH").unwrap(), vec![0x12]);
        assert_eq!(cpu.register("eax").unwrap(), vec![0x34, 0x12, 0, 0]);
        assert_eq!(cpu.register("icount").unwrap(), 0u64.to_le_bytes().to_vec());

        assert_eq!(
            cpu.register("xmm0"),
            Err(RegisterError::Unknown("xmm0".to_string()))
        );
        assert_eq!(
            cpu.set_register("icount", &[0; 8]),
            Err(RegisterError::ReadOnly("icount"))
        );
        assert_eq!(
            cpu.set_register("bx", &[1]),
            Err(RegisterError::WidthMismatch {
                name: "bx",
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_zero_ips_rejected() {
        assert!(matches!(
            Cpu::new(CpuConfig {
                ips: 0,
                ..CpuConfig::default()
            }),
            Err(CpuError::ZeroIps)
        ));
    }
}
