//! Clock and timer engine.
//!
//! Devices that need a sense of time register a [`TimerClient`] with the
//! clock. Every clock pulse decrements each active timer; a timer that
//! reaches zero calls back into its device and then re-arms (continuous)
//! or deactivates (one-shot).
//!
//! # Pulse Sources
//!
//! ```text
//! Instruction mode (default)          Realtime mode
//! ┌─────────┐ every `quantum`         ┌──────────────┐ sleep(period)
//! │ CPU loop│──instructions──┐        │ pulse thread │──────┐
//! └─────────┘                ▼        └──────────────┘      ▼
//!                       ┌────────┐          pending (AtomicU64)
//!                       │ pulse()│◄──── drained by the CPU loop at
//!                       └────────┘      instruction boundaries
//! ```
//!
//! Either way, timers are only ever touched on the emulation thread.
//! Intervals are given in microseconds and converted to pulses using the
//! CPU's instructions-per-second rate (instruction mode) or the thread's
//! pulse period (realtime mode).
//!
//! The table holds at most [`ClockConfig::capacity`] timers. Registering past that
//! bound fails; existing timers are untouched.

mod realtime;

pub use realtime::RealtimePulser;

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Capacity of the timer table.
pub const MAX_TIMERS: usize = 10;

/// Errors reported by the clock.
#[derive(Error, Debug)]
pub enum ClockError {
    /// Every timer slot is in use.
    #[error("all {capacity} timer slots are in use, cannot register {owner}")]
    CapacityExceeded {
        owner: &'static str,
        capacity: usize,
    },

    /// The timer id was never handed out by this clock.
    #[error("unknown timer {0:?}")]
    UnknownTimer(TimerId),

    /// The realtime pulse thread could not be spawned.
    #[error("failed to start the pulse thread: {0}")]
    Thread(#[source] std::io::Error),
}

/// Where pulses come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// One pulse every `quantum` executed instructions.
    #[default]
    Instruction,
    /// One pulse per wall-clock period, from a background thread.
    Realtime,
}

/// Clock configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    pub mode: ClockMode,
    /// Target instructions per second of the CPU.
    pub ips: u64,
    /// Instructions per pulse in instruction mode.
    pub quantum: u64,
    /// Pulse period in realtime mode.
    pub period: Duration,
    /// Shortest sleep of the pulse thread; shorter periods are coalesced.
    pub min_period: Duration,
    /// Timer slots, at most [`MAX_TIMERS`].
    pub capacity: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::Instruction,
            ips: 1_000_000,
            quantum: 1,
            period: Duration::from_micros(1_000),
            min_period: Duration::from_micros(1_000),
            capacity: MAX_TIMERS,
        }
    }
}

/// A device driven by the clock.
pub trait TimerClient {
    /// The device's timer reached zero.
    fn on_timer(&mut self);
}

pub type SharedTimerClient = Rc<RefCell<dyn TimerClient>>;

/// Identity of a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

struct Timer {
    owner: &'static str,
    client: SharedTimerClient,
    interval_us: u64,
    /// Interval in pulses.
    interval: u64,
    countdown: u64,
    active: bool,
    continuous: bool,
    fired: u64,
}

/// Set of timers that expired on one pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fired(u16);

impl Fired {
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, id: TimerId) -> bool {
        id.0 < MAX_TIMERS && self.0 & (1 << id.0) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = TimerId> {
        (0..MAX_TIMERS)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(TimerId)
    }
}

/// The machine's clock.
pub struct Clock {
    config: ClockConfig,
    timers: Vec<Timer>,
    pulses: u64,
    /// Instructions not yet converted into a pulse.
    residue: u64,
    pulser: Option<RealtimePulser>,
}

pub type SharedClock = Rc<RefCell<Clock>>;

impl Clock {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config: ClockConfig {
                ips: config.ips.max(1),
                quantum: config.quantum.max(1),
                capacity: config.capacity.min(MAX_TIMERS),
                ..config
            },
            timers: Vec::with_capacity(MAX_TIMERS),
            pulses: 0,
            residue: 0,
            pulser: None,
        }
    }

    pub fn shared(config: ClockConfig) -> SharedClock {
        Rc::new(RefCell::new(Self::new(config)))
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Pulses delivered since construction.
    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    /// Number of registered timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Convert a microsecond interval into pulses (at least one).
    pub fn ticks_for(&self, interval_us: u64) -> u64 {
        let ticks = match self.config.mode {
            ClockMode::Instruction => {
                let instructions =
                    u128::from(interval_us) * u128::from(self.config.ips) / 1_000_000;
                instructions.div_ceil(u128::from(self.config.quantum))
            }
            ClockMode::Realtime => {
                let period = self.config.period.as_micros().max(1);
                u128::from(interval_us).div_ceil(period)
            }
        };
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }

    /// Register a timer for `client`.
    ///
    /// The timer starts active with a full countdown.
    pub fn register(
        &mut self,
        owner: &'static str,
        client: SharedTimerClient,
        interval_us: u64,
        continuous: bool,
    ) -> Result<TimerId, ClockError> {
        if self.timers.len() >= self.config.capacity {
            warn!("clock: timer table full, {} runs without timing", owner);
            return Err(ClockError::CapacityExceeded {
                owner,
                capacity: self.config.capacity,
            });
        }
        let interval = self.ticks_for(interval_us);
        let id = TimerId(self.timers.len());
        self.timers.push(Timer {
            owner,
            client,
            interval_us,
            interval,
            countdown: interval,
            active: true,
            continuous,
            fired: 0,
        });
        debug!(
            "clock: {} registered timer {:?} ({} us = {} pulses, {})",
            owner,
            id,
            interval_us,
            interval,
            if continuous { "continuous" } else { "one-shot" }
        );
        Ok(id)
    }

    fn timer_mut(&mut self, id: TimerId) -> Result<&mut Timer, ClockError> {
        self.timers.get_mut(id.0).ok_or(ClockError::UnknownTimer(id))
    }

    fn timer(&self, id: TimerId) -> Result<&Timer, ClockError> {
        self.timers.get(id.0).ok_or(ClockError::UnknownTimer(id))
    }

    /// Change a timer's interval and restart its countdown.
    pub fn reset_timer(&mut self, id: TimerId, interval_us: u64) -> Result<(), ClockError> {
        let interval = self.ticks_for(interval_us);
        let timer = self.timer_mut(id)?;
        timer.interval_us = interval_us;
        timer.interval = interval;
        timer.countdown = interval;
        Ok(())
    }

    /// Pause or resume a timer. Resuming restarts the countdown.
    pub fn set_timer_active(&mut self, id: TimerId, active: bool) -> Result<(), ClockError> {
        let timer = self.timer_mut(id)?;
        if active && !timer.active {
            timer.countdown = timer.interval;
        }
        timer.active = active;
        Ok(())
    }

    pub fn is_active(&self, id: TimerId) -> Result<bool, ClockError> {
        Ok(self.timer(id)?.active)
    }

    /// Pulses left before the timer fires.
    pub fn countdown(&self, id: TimerId) -> Result<u64, ClockError> {
        Ok(self.timer(id)?.countdown)
    }

    /// Interval in pulses.
    pub fn interval(&self, id: TimerId) -> Result<u64, ClockError> {
        Ok(self.timer(id)?.interval)
    }

    /// Times the timer has fired.
    pub fn fire_count(&self, id: TimerId) -> Result<u64, ClockError> {
        Ok(self.timer(id)?.fired)
    }

    /// Device behind a timer.
    pub fn client(&self, id: TimerId) -> Option<SharedTimerClient> {
        self.timers.get(id.0).map(|t| t.client.clone())
    }

    /// Change the CPU rate; every timer is rescaled. Use
    /// [`Machine::set_ips`](crate::Machine::set_ips) so the CPU throttle follows.
    pub(crate) fn set_ips(&mut self, ips: u64) {
        self.config.ips = ips.max(1);
        for i in 0..self.timers.len() {
            let interval = self.ticks_for(self.timers[i].interval_us);
            let timer = &mut self.timers[i];
            timer.interval = interval;
            timer.countdown = timer.countdown.min(interval);
        }
    }

    /// Advance every active timer by one pulse.
    ///
    /// Returns the timers that expired. The caller runs their callbacks;
    /// see [`dispatch`].
    pub fn pulse(&mut self) -> Fired {
        self.pulses += 1;
        let mut fired = 0u16;
        for (i, timer) in self.timers.iter_mut().enumerate() {
            if !timer.active {
                continue;
            }
            timer.countdown -= 1;
            if timer.countdown == 0 {
                fired |= 1 << i;
                timer.fired += 1;
                timer.countdown = timer.interval;
                if !timer.continuous {
                    timer.active = false;
                }
            }
        }
        Fired(fired)
    }

    /// Turn `cycles` of elapsed CPU time into a number of pulses due.
    fn pulses_due(&mut self, cycles: u64) -> u64 {
        match self.config.mode {
            ClockMode::Instruction => {
                self.residue += cycles;
                let due = self.residue / self.config.quantum;
                self.residue %= self.config.quantum;
                due
            }
            ClockMode::Realtime => self.pulser.as_ref().map_or(0, RealtimePulser::drain),
        }
    }

    /// Start the pulse thread (realtime mode only).
    pub fn start(&mut self) -> Result<(), ClockError> {
        if self.config.mode != ClockMode::Realtime || self.pulser.is_some() {
            return Ok(());
        }
        let pulser = RealtimePulser::spawn(self.config.period, self.config.min_period)
            .map_err(ClockError::Thread)?;
        self.pulser = Some(pulser);
        Ok(())
    }

    /// Stop the pulse thread. Returns within one sleep interval.
    pub fn stop(&mut self) {
        if let Some(mut pulser) = self.pulser.take() {
            pulser.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.pulser.is_some()
    }

    pub fn dump(&self) -> String {
        let mut out = format!(
            "clock: {:?} mode, {} ips, quantum {}, {} pulses, {}/{} timers\n",
            self.config.mode,
            self.config.ips,
            self.config.quantum,
            self.pulses,
            self.timers.len(),
            self.config.capacity
        );
        for (i, t) in self.timers.iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{i}] {:<8} {:>8}/{:<8} {} {} fired={}",
                t.owner,
                t.countdown,
                t.interval,
                if t.active { "on " } else { "off" },
                if t.continuous { "cont" } else { "once" },
                t.fired
            );
        }
        out
    }
}

/// Apply `pulses` pulses to a shared clock and run expired callbacks.
///
/// The clock is not borrowed while a callback runs, so devices may
/// reconfigure their own timers from inside [`TimerClient::on_timer`].
pub fn dispatch(clock: &SharedClock, pulses: u64) {
    for _ in 0..pulses {
        let fired = clock.borrow_mut().pulse();
        if fired.is_empty() {
            continue;
        }
        for id in fired.iter() {
            let client = clock.borrow().client(id);
            if let Some(client) = client {
                client.borrow_mut().on_timer();
            }
        }
    }
}

/// Account for `cycles` elapsed CPU cycles on a shared clock.
pub fn advance(clock: &SharedClock, cycles: u64) {
    let due = clock.borrow_mut().pulses_due(cycles);
    if due > 0 {
        dispatch(clock, due);
    }
}

/// A device's handle on its own timer.
#[derive(Clone)]
pub struct TimerHandle {
    clock: SharedClock,
    id: TimerId,
}

impl TimerHandle {
    pub fn new(clock: SharedClock, id: TimerId) -> Self {
        Self { clock, id }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn set_active(&self, active: bool) {
        if let Err(err) = self.clock.borrow_mut().set_timer_active(self.id, active) {
            warn!("clock: {err}");
        }
    }

    pub fn reset(&self, interval_us: u64) {
        if let Err(err) = self.clock.borrow_mut().reset_timer(self.id, interval_us) {
            warn!("clock: {err}");
        }
    }

    pub fn is_active(&self) -> bool {
        self.clock.borrow().is_active(self.id).unwrap_or(false)
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimerHandle({:?})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    impl TimerClient for Counter {
        fn on_timer(&mut self) {
            self.hits += 1;
        }
    }

    fn counter() -> Rc<RefCell<Counter>> {
        Rc::new(RefCell::new(Counter::default()))
    }

    /// 1 MIPS, one pulse per instruction: 1 us == 1 pulse.
    fn clock() -> Clock {
        Clock::new(ClockConfig::default())
    }

    #[test]
    fn test_ticks_conversion() {
        let mut clock = clock();
        assert_eq!(clock.ticks_for(10), 10);
        assert_eq!(clock.ticks_for(0), 1);

        clock.set_ips(4_000_000);
        assert_eq!(clock.ticks_for(10), 40);

        let coarse = Clock::new(ClockConfig {
            quantum: 16,
            ..ClockConfig::default()
        });
        assert_eq!(coarse.ticks_for(100), 7);
    }

    #[test]
    fn test_continuous_timer_fires_every_n_pulses() {
        let shared = Clock::shared(ClockConfig::default());
        let c = counter();
        let id = shared.borrow_mut().register("t", c.clone(), 5, true).unwrap();

        for round in 1..=20u32 {
            for _ in 0..4 {
                dispatch(&shared, 1);
                assert_eq!(c.borrow().hits, round - 1);
            }
            dispatch(&shared, 1);
            assert_eq!(c.borrow().hits, round);
        }
        assert!(shared.borrow().is_active(id).unwrap());
        assert_eq!(shared.borrow().fire_count(id).unwrap(), 20);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let shared = Clock::shared(ClockConfig::default());
        let c = counter();
        let id = shared.borrow_mut().register("t", c.clone(), 3, false).unwrap();

        dispatch(&shared, 100);
        assert_eq!(c.borrow().hits, 1);
        assert!(!shared.borrow().is_active(id).unwrap());

        shared.borrow_mut().set_timer_active(id, true).unwrap();
        dispatch(&shared, 3);
        assert_eq!(c.borrow().hits, 2);
    }

    #[test]
    fn test_capacity_overflow_is_reported() {
        let mut clock = clock();
        let mut ids = Vec::new();
        for i in 0..MAX_TIMERS {
            ids.push(clock.register("t", counter(), 10 + i as u64, true).unwrap());
        }
        clock.pulse();
        clock.pulse();
        let before: Vec<u64> = ids.iter().map(|id| clock.countdown(*id).unwrap()).collect();

        let err = clock.register("late", counter(), 1, true).unwrap_err();
        assert!(matches!(
            err,
            ClockError::CapacityExceeded {
                owner: "late",
                capacity: MAX_TIMERS
            }
        ));

        let after: Vec<u64> = ids.iter().map(|id| clock.countdown(*id).unwrap()).collect();
        assert_eq!(before, after);
        assert_eq!(clock.timer_count(), MAX_TIMERS);
    }

    #[test]
    fn test_paused_timer_does_not_count() {
        let shared = Clock::shared(ClockConfig::default());
        let c = counter();
        let id = shared.borrow_mut().register("t", c.clone(), 2, true).unwrap();
        shared.borrow_mut().set_timer_active(id, false).unwrap();
        dispatch(&shared, 10);
        assert_eq!(c.borrow().hits, 0);
        assert_eq!(shared.borrow().countdown(id).unwrap(), 2);
    }

    #[test]
    fn test_reset_timer() {
        let mut clock = clock();
        let id = clock.register("t", counter(), 10, true).unwrap();
        clock.pulse();
        clock.reset_timer(id, 3).unwrap();
        assert_eq!(clock.interval(id).unwrap(), 3);
        assert_eq!(clock.countdown(id).unwrap(), 3);
        assert!(matches!(
            clock.reset_timer(TimerId(7), 1),
            Err(ClockError::UnknownTimer(TimerId(7)))
        ));
    }

    #[test]
    fn test_countdown_never_exceeds_interval() {
        let mut clock = clock();
        let id = clock.register("t", counter(), 100, true).unwrap();
        clock.set_ips(10_000);
        assert_eq!(clock.interval(id).unwrap(), 1);
        assert_eq!(clock.countdown(id).unwrap(), 1);
    }

    #[test]
    fn test_advance_uses_quantum() {
        let shared = Clock::shared(ClockConfig {
            quantum: 4,
            ..ClockConfig::default()
        });
        advance(&shared, 3);
        assert_eq!(shared.borrow().pulses(), 0);
        advance(&shared, 6);
        assert_eq!(shared.borrow().pulses(), 2);
    }

    /// A client that pauses its own timer from the callback.
    struct SelfPausing {
        handle: Option<TimerHandle>,
        hits: u32,
    }

    impl TimerClient for SelfPausing {
        fn on_timer(&mut self) {
            self.hits += 1;
            if let Some(handle) = &self.handle {
                handle.set_active(false);
            }
        }
    }

    #[test]
    fn test_callback_may_touch_its_timer() {
        let shared = Clock::shared(ClockConfig::default());
        let client = Rc::new(RefCell::new(SelfPausing {
            handle: None,
            hits: 0,
        }));
        let id = shared
            .borrow_mut()
            .register("self", client.clone(), 2, true)
            .unwrap();
        client.borrow_mut().handle = Some(TimerHandle::new(shared.clone(), id));

        dispatch(&shared, 10);
        assert_eq!(client.borrow().hits, 1);
        assert!(!shared.borrow().is_active(id).unwrap());
    }
}
