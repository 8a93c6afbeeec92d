//! World clocks.
//!
//! [`Ticker`] is the shared pause/resume/stop state machine. [`WorldTicker`]
//! owns the threads that drive a [`TickHandler`] from it:
//!
//! - the simulation thread runs the main clock, the rare clock (every
//!   `rare_interval` main ticks) and, when headless, the render pump;
//! - the physics thread runs fixed sub-steps at its own rate.
//!
//! Every clock enters the ticker before doing work, so pausing is atomic from
//! an observer's view: once `pause()` returns no clock is mid-tick and none
//! will start another until `resume()`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::TickerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerState {
    Stopped,
    Running,
    Paused,
}

/// Measured real time per main tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickStats {
    pub last: Duration,
    pub average: Duration,
    pub worst: Duration,
    /// Ticks that took longer than their budget.
    pub overruns: u64,
    pub samples: u64,
}

impl TickStats {
    fn record(&mut self, elapsed: Duration, budget: Duration) {
        self.samples += 1;
        self.last = elapsed;
        self.worst = self.worst.max(elapsed);
        // Running mean without keeping a sum that could overflow.
        let n = self.samples as f64;
        let avg = self.average.as_secs_f64() + (elapsed.as_secs_f64() - self.average.as_secs_f64()) / n;
        self.average = Duration::from_secs_f64(avg.max(0.0));
        if elapsed > budget {
            self.overruns += 1;
        }
    }
}

struct Inner {
    state: TickerState,
    started: bool,
    tick: u64,
    /// Clocks currently inside a tick or step.
    active: usize,
    stats: TickStats,
}

pub struct Ticker {
    inner: Mutex<Inner>,
    changed: Condvar,
    ticks_per_second: u32,
}

impl Ticker {
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TickerState::Stopped,
                started: false,
                tick: 0,
                active: 0,
                stats: TickStats::default(),
            }),
            changed: Condvar::new(),
            ticks_per_second: ticks_per_second.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("ticker poisoned")
    }

    pub fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Real-time budget of one main tick.
    pub fn tick_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ticks_per_second as f64)
    }

    pub fn state(&self) -> TickerState {
        self.lock().state
    }

    /// Main ticks begun so far. Never reset.
    pub fn tick_count(&self) -> u64 {
        self.lock().tick
    }

    pub fn stats(&self) -> TickStats {
        self.lock().stats
    }

    /// Begin running. A ticker starts once; starting again is rejected, and
    /// so is starting one that was stopped.
    pub fn start(&self) -> Result<(), TickerError> {
        let mut inner = self.lock();
        if inner.started {
            return Err(match inner.state {
                TickerState::Stopped => TickerError::Stopped,
                _ => TickerError::AlreadyStarted,
            });
        }
        inner.started = true;
        inner.state = TickerState::Running;
        self.changed.notify_all();
        Ok(())
    }

    /// Pause every clock. Blocks until no clock is mid-tick, so it must not
    /// be called from inside a tick callback.
    pub fn pause(&self) -> Result<(), TickerError> {
        let mut inner = self.lock();
        Self::check_live(&inner)?;
        if inner.state != TickerState::Running {
            return Err(TickerError::InvalidState(inner.state));
        }
        inner.state = TickerState::Paused;
        self.changed.notify_all();
        while inner.active > 0 {
            inner = self.changed.wait(inner).expect("ticker poisoned");
        }
        Ok(())
    }

    /// Resume from a pause. The tick counter continues where it left off.
    pub fn resume(&self) -> Result<(), TickerError> {
        let mut inner = self.lock();
        Self::check_live(&inner)?;
        if inner.state != TickerState::Paused {
            return Err(TickerError::InvalidState(inner.state));
        }
        inner.state = TickerState::Running;
        self.changed.notify_all();
        Ok(())
    }

    /// Stop for good. Clocks see the stop at their next tick boundary.
    pub fn stop(&self) -> Result<(), TickerError> {
        let mut inner = self.lock();
        Self::check_live(&inner)?;
        inner.state = TickerState::Stopped;
        self.changed.notify_all();
        Ok(())
    }

    fn check_live(inner: &Inner) -> Result<(), TickerError> {
        if !inner.started {
            return Err(TickerError::NotStarted);
        }
        if inner.state == TickerState::Stopped {
            return Err(TickerError::Stopped);
        }
        Ok(())
    }

    /// Enter the next main tick, waiting out a pause first. `None` once the
    /// ticker is stopped (or was never started).
    pub fn begin_tick(&self) -> Option<TickGuard<'_>> {
        let mut inner = self.wait_runnable()?;
        inner.tick += 1;
        inner.active += 1;
        Some(TickGuard {
            ticker: self,
            tick: inner.tick,
            started: Instant::now(),
            main: true,
        })
    }

    /// Enter a secondary clock step (physics, render pump). Does not advance
    /// the tick counter.
    pub fn enter_step(&self) -> Option<TickGuard<'_>> {
        let mut inner = self.wait_runnable()?;
        inner.active += 1;
        Some(TickGuard {
            ticker: self,
            tick: inner.tick,
            started: Instant::now(),
            main: false,
        })
    }

    fn wait_runnable(&self) -> Option<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        while inner.state == TickerState::Paused {
            inner = self.changed.wait(inner).expect("ticker poisoned");
        }
        (inner.state == TickerState::Running).then_some(inner)
    }

    /// Sleep until `deadline`, waking early on stop. Returns `false` when
    /// the ticker stopped.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let mut inner = self.lock();
        loop {
            if inner.state == TickerState::Stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .expect("ticker poisoned")
                .0;
        }
    }

    fn finish(&self, main: bool, elapsed: Duration) {
        let mut inner = self.lock();
        inner.active -= 1;
        if main {
            let budget = self.tick_budget();
            inner.stats.record(elapsed, budget);
            if elapsed > budget {
                tracing::debug!("Tick {} overran its budget: {:?} > {:?}", inner.tick, elapsed, budget);
            }
        }
        self.changed.notify_all();
    }
}

/// Held while a clock is inside a tick. Dropping it ends the tick.
pub struct TickGuard<'a> {
    ticker: &'a Ticker,
    tick: u64,
    started: Instant,
    main: bool,
}

impl TickGuard<'_> {
    /// The main tick number (for steps: the latest main tick begun).
    pub fn tick(&self) -> u64 {
        self.tick
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.ticker.finish(self.main, self.started.elapsed());
    }
}

/// Callbacks driven by the world clocks.
pub trait TickHandler: Send + Sync + 'static {
    fn tick_main(&self, tick: u64);

    /// `elapsed` is the nominal simulated time since the previous rare tick.
    fn tick_rare(&self, _tick: u64, _elapsed: Duration) {}

    fn step_physics(&self, _dt: Duration) {}

    fn pump_render(&self, _tick: u64) {}
}

/// Clock rates.
#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub ticks_per_second: u32,
    /// Main ticks per rare tick; 0 disables the rare clock.
    pub rare_interval: u32,
    /// Physics sub-steps per second; 0 disables the physics thread.
    pub physics_steps_per_second: u32,
    /// Render pump period for headless runs; `None` disables it.
    pub render_interval: Option<Duration>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 20,
            rare_interval: 20,
            physics_steps_per_second: 60,
            render_interval: Some(Duration::from_secs(1)),
        }
    }
}

pub struct WorldTicker {
    config: ClockConfig,
    ticker: Arc<Ticker>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorldTicker {
    pub fn new(config: ClockConfig) -> Self {
        let ticker = Arc::new(Ticker::new(config.ticks_per_second));
        Self {
            config,
            ticker,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn ticker(&self) -> &Arc<Ticker> {
        &self.ticker
    }

    pub fn state(&self) -> TickerState {
        self.ticker.state()
    }

    pub fn tick_count(&self) -> u64 {
        self.ticker.tick_count()
    }

    pub fn stats(&self) -> TickStats {
        self.ticker.stats()
    }

    /// Start every clock, driving `handler`.
    pub fn start(&self, handler: Arc<dyn TickHandler>) -> Result<(), TickerError> {
        self.ticker.start()?;
        let mut threads = self.threads.lock().expect("ticker threads poisoned");

        {
            let ticker = Arc::clone(&self.ticker);
            let handler = Arc::clone(&handler);
            let config = self.config.clone();
            threads.push(std::thread::spawn(move || run_simulation(&ticker, &*handler, &config)));
        }

        if self.config.physics_steps_per_second > 0 {
            let ticker = Arc::clone(&self.ticker);
            let dt = Duration::from_secs_f64(1.0 / self.config.physics_steps_per_second as f64);
            threads.push(std::thread::spawn(move || run_physics(&ticker, &*handler, dt)));
        }

        tracing::info!(
            "World clocks started: {} TPS, rare every {} ticks, physics {} steps/s",
            self.config.ticks_per_second,
            self.config.rare_interval,
            self.config.physics_steps_per_second
        );
        Ok(())
    }

    pub fn pause(&self) -> Result<(), TickerError> {
        self.ticker.pause()?;
        tracing::info!("World clocks paused at tick {}", self.ticker.tick_count());
        Ok(())
    }

    pub fn resume(&self) -> Result<(), TickerError> {
        self.ticker.resume()?;
        tracing::info!("World clocks resumed");
        Ok(())
    }

    /// Stop every clock and join its thread.
    pub fn stop(&self) -> Result<(), TickerError> {
        self.ticker.stop()?;
        let threads = std::mem::take(&mut *self.threads.lock().expect("ticker threads poisoned"));
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("A world clock thread panicked");
            }
        }
        tracing::info!("World clocks stopped after {} ticks", self.ticker.tick_count());
        Ok(())
    }
}

fn run_simulation(ticker: &Ticker, handler: &dyn TickHandler, config: &ClockConfig) {
    let period = ticker.tick_budget();
    let rare_elapsed = period * config.rare_interval;
    let mut next = Instant::now();
    let mut last_render = Instant::now();

    while let Some(guard) = ticker.begin_tick() {
        let tick = guard.tick();
        handler.tick_main(tick);
        if config.rare_interval > 0 && tick % config.rare_interval as u64 == 0 {
            handler.tick_rare(tick, rare_elapsed);
        }
        if let Some(every) = config.render_interval {
            if last_render.elapsed() >= every {
                handler.pump_render(tick);
                last_render = Instant::now();
            }
        }
        drop(guard);

        // No catch-up bursts after a stall or a pause.
        next = (next + period).max(Instant::now());
        if !ticker.sleep_until(next) {
            break;
        }
    }
}

fn run_physics(ticker: &Ticker, handler: &dyn TickHandler, dt: Duration) {
    let mut next = Instant::now();
    while let Some(step) = ticker.enter_step() {
        handler.step_physics(dt);
        drop(step);

        next = (next + dt).max(Instant::now());
        if !ticker.sleep_until(next) {
            break;
        }
    }
}
