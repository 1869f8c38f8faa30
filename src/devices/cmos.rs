//! CMOS RTC and NVRAM (MC146818 compatible).
//!
//! Port 0x70 selects a register (bit 7 masks NMI), port 0x71 reads or
//! writes it. The time registers advance once per second from a clock
//! timer; update-ended and alarm interrupts go out on IRQ 8.
//!
//! Reference: <https://wiki.osdev.org/CMOS>

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::clock::{ClockError, SharedClock, TimerClient};
use crate::io::{PortDevice, PortMode};
use crate::module::{Module, ModuleError, ResetContext};
use crate::pic::IrqLine;

/// CMOS I/O port for the index register.
pub const CMOS_PORT_INDEX: u16 = 0x70;

/// CMOS I/O port for the data register.
pub const CMOS_PORT_DATA: u16 = 0x71;

pub const CMOS_SIZE: usize = 128;

const REG_SECONDS: u8 = 0x00;
const REG_SECONDS_ALARM: u8 = 0x01;
const REG_MINUTES: u8 = 0x02;
const REG_MINUTES_ALARM: u8 = 0x03;
const REG_HOURS: u8 = 0x04;
const REG_HOURS_ALARM: u8 = 0x05;
const REG_WEEKDAY: u8 = 0x06;
const REG_DAY: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;

/// Status Register A - bit 7 is UIP (Update In Progress).
const REG_STATUS_A: u8 = 0x0A;

/// Status Register B - format and interrupt control.
const REG_STATUS_B: u8 = 0x0B;

/// Status Register C - interrupt flags (read clears).
const REG_STATUS_C: u8 = 0x0C;

/// Status Register D - bit 7 indicates valid RAM/time.
const REG_STATUS_D: u8 = 0x0D;

/// Hard disk types: drive 0 high nibble, drive 1 low nibble.
pub const REG_HARD_DISK: u8 = 0x12;
const REG_HD0_EXTENDED: u8 = 0x19;
const REG_HD1_EXTENDED: u8 = 0x1A;
const REG_EQUIPMENT: u8 = 0x14;
const REG_BASE_MEMORY: u8 = 0x15;
const REG_EXT_MEMORY: u8 = 0x17;
const REG_CHECKSUM: u8 = 0x2E;
const REG_EXT_MEMORY_COPY: u8 = 0x30;
const REG_CENTURY: u8 = 0x32;

const B_SET: u8 = 0x80;
const B_AIE: u8 = 0x20;
const B_UIE: u8 = 0x10;
const B_BINARY: u8 = 0x04;
const B_24H: u8 = 0x02;

const C_IRQF: u8 = 0x80;
const C_AF: u8 = 0x20;
const C_UF: u8 = 0x10;

/// "Don't care" alarm value.
const ALARM_ANY: u8 = 0xC0;

/// User-defined drive type, parameters in the extended type byte.
const HD_TYPE_EXTENDED: u8 = 0x0F;
const HD_TYPE_USER: u8 = 47;

const SECONDS_PER_DAY: u64 = 86_400;

fn is_leap_year(y: u64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_month(year: u64, month: u64) -> u64 {
    const DAYS: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    if month == 2 && is_leap_year(year) {
        29
    } else {
        DAYS[((month + 11) % 12) as usize]
    }
}

/// Days since 1970-01-01 -> (year, month 1-12, day 1-31).
fn civil_from_days(mut remaining: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    loop {
        let dy = if is_leap_year(year) { 366 } else { 365 };
        if remaining < dy {
            break;
        }
        remaining -= dy;
        year += 1;
    }
    let mut month = 1;
    while remaining >= days_in_month(year, month) {
        remaining -= days_in_month(year, month);
        month += 1;
    }
    (year, month, remaining + 1)
}

fn days_from_civil(year: u64, month: u64, day: u64) -> u64 {
    let mut days: u64 = (1970..year)
        .map(|y| if is_leap_year(y) { 366 } else { 365 })
        .sum();
    days += (1..month).map(|m| days_in_month(year, m)).sum::<u64>();
    days + day.saturating_sub(1)
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn from_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

/// CMOS RTC and NVRAM.
pub struct Cmos {
    index: u8,
    nmi_disabled: bool,
    ram: [u8; CMOS_SIZE],
    /// RTC time in seconds since the Unix epoch.
    time: u64,
    irq: Option<IrqLine>,
}

pub type SharedCmos = Rc<RefCell<Cmos>>;

impl Cmos {
    /// Create a CMOS for a guest with `memory_bytes` of RAM, with the RTC
    /// set to `time` (seconds since the Unix epoch).
    pub fn new(memory_bytes: u64, time: u64) -> Self {
        let mut cmos = Self {
            index: 0,
            nmi_disabled: false,
            ram: [0; CMOS_SIZE],
            time,
            irq: None,
        };
        cmos.ram[usize::from(REG_STATUS_A)] = 0x26;
        cmos.ram[usize::from(REG_STATUS_B)] = B_24H;
        cmos.ram[usize::from(REG_STATUS_D)] = 0x80;
        cmos.ram[usize::from(REG_SECONDS_ALARM)] = ALARM_ANY;
        cmos.ram[usize::from(REG_MINUTES_ALARM)] = ALARM_ANY;
        cmos.ram[usize::from(REG_HOURS_ALARM)] = ALARM_ANY;
        // Math coprocessor absent, VGA, no floppies.
        cmos.ram[usize::from(REG_EQUIPMENT)] = 0x00;
        cmos.set_memory_size(memory_bytes);
        cmos.store_time();
        cmos
    }

    /// Start from the host's wall clock.
    pub fn with_host_time(memory_bytes: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self::new(memory_bytes, now)
    }

    /// Register the once-per-second update timer.
    pub fn attach_timer(this: &SharedCmos, clock: &SharedClock) -> Result<(), ClockError> {
        clock
            .borrow_mut()
            .register("cmos", this.clone(), 1_000_000, true)?;
        Ok(())
    }

    pub fn read_register(&self, index: u8) -> u8 {
        self.ram[usize::from(index & 0x7F)]
    }

    pub fn nmi_disabled(&self) -> bool {
        self.nmi_disabled
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    fn set_memory_size(&mut self, memory_bytes: u64) {
        let base_kb: u16 = 640;
        let extended_kb = (memory_bytes.saturating_sub(1 << 20) / 1024).min(0xFFFF) as u16;
        self.put_word(REG_BASE_MEMORY, base_kb);
        self.put_word(REG_EXT_MEMORY, extended_kb);
        self.put_word(REG_EXT_MEMORY_COPY, extended_kb);
        self.update_checksum();
    }

    fn put_word(&mut self, index: u8, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.ram[usize::from(index)] = lo;
        self.ram[usize::from(index) + 1] = hi;
    }

    /// Record whether hard disk `drive` (0 or 1) is installed.
    pub fn set_hard_disk(&mut self, drive: usize, present: bool) {
        let kind = if present { HD_TYPE_EXTENDED } else { 0 };
        let reg = &mut self.ram[usize::from(REG_HARD_DISK)];
        let extended = if drive == 0 {
            *reg = (*reg & 0x0F) | (kind << 4);
            REG_HD0_EXTENDED
        } else {
            *reg = (*reg & 0xF0) | kind;
            REG_HD1_EXTENDED
        };
        self.ram[usize::from(extended)] = if present { HD_TYPE_USER } else { 0 };
        self.update_checksum();
        debug!("cmos: hard disk {drive} {}", if present { "installed" } else { "removed" });
    }

    /// Sum of bytes 0x10..=0x2D, stored big-endian at 0x2E.
    fn update_checksum(&mut self) {
        let sum: u16 = self.ram[0x10..=0x2D].iter().map(|b| u16::from(*b)).sum();
        let [hi, lo] = sum.to_be_bytes();
        self.ram[usize::from(REG_CHECKSUM)] = hi;
        self.ram[usize::from(REG_CHECKSUM) + 1] = lo;
    }

    fn binary(&self) -> bool {
        self.ram[usize::from(REG_STATUS_B)] & B_BINARY != 0
    }

    fn encode(&self, value: u8) -> u8 {
        if self.binary() {
            value
        } else {
            to_bcd(value)
        }
    }

    fn decode(&self, value: u8) -> u8 {
        if self.binary() {
            value
        } else {
            from_bcd(value)
        }
    }

    fn encode_hour(&self, hour: u8) -> u8 {
        if self.ram[usize::from(REG_STATUS_B)] & B_24H != 0 {
            return self.encode(hour);
        }
        let pm = hour >= 12;
        let h12 = match hour % 12 {
            0 => 12,
            h => h,
        };
        self.encode(h12) | if pm { 0x80 } else { 0 }
    }

    fn decode_hour(&self, raw: u8) -> u8 {
        if self.ram[usize::from(REG_STATUS_B)] & B_24H != 0 {
            return self.decode(raw);
        }
        let h12 = self.decode(raw & 0x7F) % 12;
        if raw & 0x80 != 0 {
            h12 + 12
        } else {
            h12
        }
    }

    /// Write the RTC time into the time registers.
    fn store_time(&mut self) {
        let days = self.time / SECONDS_PER_DAY;
        let secs = self.time % SECONDS_PER_DAY;
        let (year, month, day) = civil_from_days(days);
        let fields = [
            (REG_SECONDS, self.encode((secs % 60) as u8)),
            (REG_MINUTES, self.encode((secs / 60 % 60) as u8)),
            (REG_HOURS, self.encode_hour((secs / 3600) as u8)),
            // 1970-01-01 was a Thursday; Sunday is 1.
            (REG_WEEKDAY, self.encode(((days + 4) % 7 + 1) as u8)),
            (REG_DAY, self.encode(day as u8)),
            (REG_MONTH, self.encode(month as u8)),
            (REG_YEAR, self.encode((year % 100) as u8)),
            (REG_CENTURY, self.encode((year / 100) as u8)),
        ];
        for (reg, value) in fields {
            self.ram[usize::from(reg)] = value;
        }
    }

    /// Rebuild the RTC time from the time registers after a guest write.
    fn load_time(&mut self) {
        let reg = |r: u8| self.decode(self.ram[usize::from(r)]);
        let year = u64::from(reg(REG_CENTURY)) * 100 + u64::from(reg(REG_YEAR));
        let month = u64::from(reg(REG_MONTH)).clamp(1, 12);
        let day = u64::from(reg(REG_DAY)).max(1);
        let hour = u64::from(self.decode_hour(self.ram[usize::from(REG_HOURS)]));
        let minutes = u64::from(reg(REG_MINUTES));
        let seconds = u64::from(reg(REG_SECONDS));
        let days = days_from_civil(year.max(1970), month, day);
        self.time = days * SECONDS_PER_DAY + hour * 3600 + minutes * 60 + seconds;
    }

    fn alarm_matches(&self) -> bool {
        let pairs = [
            (REG_SECONDS_ALARM, REG_SECONDS),
            (REG_MINUTES_ALARM, REG_MINUTES),
            (REG_HOURS_ALARM, REG_HOURS),
        ];
        pairs.iter().all(|&(alarm, now)| {
            let a = self.ram[usize::from(alarm)];
            a & ALARM_ANY == ALARM_ANY || a == self.ram[usize::from(now)]
        })
    }

    /// Advance the RTC by one second.
    pub fn tick(&mut self) {
        let b = self.ram[usize::from(REG_STATUS_B)];
        if b & B_SET != 0 {
            return;
        }
        self.time += 1;
        self.store_time();
        let mut flags = 0;
        if b & B_UIE != 0 {
            flags |= C_UF;
        }
        if b & B_AIE != 0 && self.alarm_matches() {
            flags |= C_AF;
        }
        if flags != 0 {
            self.ram[usize::from(REG_STATUS_C)] |= flags | C_IRQF;
            trace!("cmos: interrupt flags {flags:#04x}");
            if let Some(irq) = &self.irq {
                irq.raise();
            }
        }
    }

    fn read_data(&mut self) -> u8 {
        let index = self.index;
        let value = self.ram[usize::from(index)];
        if index == REG_STATUS_C {
            self.ram[usize::from(REG_STATUS_C)] = 0;
            if let Some(irq) = &self.irq {
                irq.lower();
            }
        }
        value
    }

    fn write_data(&mut self, value: u8) {
        let index = self.index;
        match index {
            REG_STATUS_C | REG_STATUS_D => {}
            // UIP is read-only.
            REG_STATUS_A => {
                self.ram[usize::from(index)] = value & 0x7F;
            }
            REG_STATUS_B => {
                let leaving_set = self.ram[usize::from(index)] & B_SET != 0 && value & B_SET == 0;
                self.ram[usize::from(index)] = value;
                if leaving_set {
                    self.load_time();
                }
            }
            REG_SECONDS | REG_MINUTES | REG_HOURS | REG_WEEKDAY | REG_DAY | REG_MONTH
            | REG_YEAR | REG_CENTURY => {
                self.ram[usize::from(index)] = value;
                if self.ram[usize::from(REG_STATUS_B)] & B_SET == 0 {
                    self.load_time();
                }
            }
            _ => self.ram[usize::from(index)] = value,
        }
    }
}

impl PortDevice for Cmos {
    fn read_byte(&mut self, port: u16) -> u8 {
        match port {
            CMOS_PORT_DATA => self.read_data(),
            _ => 0xFF,
        }
    }

    fn write_byte(&mut self, port: u16, value: u8) {
        match port {
            CMOS_PORT_INDEX => {
                self.index = value & 0x7F;
                self.nmi_disabled = value & 0x80 != 0;
            }
            CMOS_PORT_DATA => self.write_data(value),
            _ => {}
        }
    }
}

impl TimerClient for Cmos {
    fn on_timer(&mut self) {
        self.tick();
    }
}

impl Module for Cmos {
    fn name(&self) -> &'static str {
        "cmos"
    }

    /// NVRAM is battery-backed and survives reset.
    fn reset(&mut self, ctx: &mut ResetContext<'_>) -> Result<(), ModuleError> {
        ctx.release_ports();
        self.index = 0;
        self.ram[usize::from(REG_STATUS_C)] = 0;
        self.irq = Some(ctx.request_irq("cmos", Some(8))?);
        ctx.claim_port(CMOS_PORT_INDEX, PortMode::WriteOnly)?;
        ctx.claim_port(CMOS_PORT_DATA, PortMode::ReadWrite)?;
        Ok(())
    }

    fn dump(&self) -> String {
        let mut out = format!(
            "cmos: index {:#04x} nmi {} time {}\n",
            self.index,
            if self.nmi_disabled { "masked" } else { "enabled" },
            self.time
        );
        out.push_str(&crate::rom::hex_dump(&self.ram, 0));
        out
    }

    fn connections(&self) -> &'static [&'static str] {
        &["pic"]
    }
}
