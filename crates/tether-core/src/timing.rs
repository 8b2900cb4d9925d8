//! Per-exchange phase timing and per-method latency weights.

use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::call::ProgressSink;

/// Phases of one session exchange, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Request prepared.
    Create,
    /// Credential ready.
    Connect,
    /// Transport returned.
    Send,
    /// Status handled.
    Read,
    /// Body decoded.
    Parse,
}

impl Phase {
    /// Every phase, in exchange order.
    pub const ALL: [Phase; 5] = [
        Phase::Create,
        Phase::Connect,
        Phase::Send,
        Phase::Read,
        Phase::Parse,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Records how long each phase of an exchange took and forwards a progress
/// tick to every listener as phases complete.
pub struct TimeStat {
    started: Instant,
    last: Instant,
    phases: [Duration; 5],
    ticks: u8,
    sinks: Vec<ProgressSink>,
}

impl TimeStat {
    /// Start timing now, reporting progress to `sinks`.
    pub fn start(sinks: Vec<ProgressSink>) -> Self {
        let now = Instant::now();
        TimeStat {
            started: now,
            last: now,
            phases: [Duration::ZERO; 5],
            ticks: 0,
            sinks,
        }
    }

    /// Close `phase` at the current time.
    pub fn mark(&mut self, phase: Phase) {
        let now = Instant::now();
        self.phases[phase.index()] += now - self.last;
        self.last = now;
        self.tick();
    }

    fn tick(&mut self) {
        if self.ticks as usize >= Phase::ALL.len() {
            return;
        }
        self.ticks += 1;
        let percent = self.progress();
        for sink in &self.sinks {
            sink(percent);
        }
    }

    /// Progress in percent derived from the completed phases.
    pub fn progress(&self) -> u8 {
        (self.ticks as usize * 100 / Phase::ALL.len()) as u8
    }

    /// Time spent in `phase`.
    pub fn phase(&self, phase: Phase) -> Duration {
        self.phases[phase.index()]
    }

    /// Time from start to the last completed phase.
    pub fn elapsed(&self) -> Duration {
        self.last - self.started
    }
}

impl fmt::Display for TimeStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "create {}ms, connect {}ms, send {}ms, read {}ms, parse {}ms, total {}ms",
            self.phase(Phase::Create).as_millis(),
            self.phase(Phase::Connect).as_millis(),
            self.phase(Phase::Send).as_millis(),
            self.phase(Phase::Read).as_millis(),
            self.phase(Phase::Parse).as_millis(),
            self.elapsed().as_millis()
        )
    }
}

impl fmt::Debug for TimeStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeStat")
            .field("phases", &self.phases)
            .field("ticks", &self.ticks)
            .finish()
    }
}

/// Moving average of observed latency per method, used as the partition
/// weight of future requests.
#[derive(Debug)]
pub struct WeightTracker {
    averages: DashMap<String, (u64, u64)>,
    window: u64,
}

impl WeightTracker {
    /// `window` bounds how many samples the average remembers.
    pub fn new(window: u64) -> Self {
        WeightTracker {
            averages: DashMap::new(),
            window: window.max(1),
        }
    }

    /// Attribute `elapsed` evenly to the given methods.
    pub fn record<'a, I>(&self, methods: I, elapsed: Duration)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let methods: Vec<&str> = methods.into_iter().collect();
        if methods.is_empty() {
            return;
        }
        let share = (elapsed.as_micros() as u64 / methods.len() as u64).max(1);
        for method in methods {
            let mut entry = self.averages.entry(method.to_string()).or_insert((0, 0));
            let (avg, samples) = *entry;
            let samples = (samples + 1).min(self.window);
            let avg = if samples == 1 {
                share
            } else {
                (avg * (samples - 1) + share) / samples
            };
            *entry = (avg, samples);
        }
    }

    /// Estimated cost of `method` in microseconds. A method never observed
    /// weighs the mean of all observed methods, or 1 before any sample.
    pub fn weight(&self, method: &str) -> u64 {
        match self.averages.get(method) {
            Some(entry) => entry.0.max(1),
            None => self.mean(),
        }
    }

    /// Mean of the per-method averages; 1 when empty.
    pub fn mean(&self) -> u64 {
        let (sum, count) = self
            .averages
            .iter()
            .fold((0u64, 0u64), |(sum, count), e| (sum.saturating_add(e.value().0), count + 1));
        if count == 0 {
            1
        } else {
            (sum / count).max(1)
        }
    }

    /// True before any latency sample.
    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new(10)
    }
}
