//! Timing aggregator
//!
//! Accumulates elapsed time per name between `before` and `after` probe
//! calls. The default [`StartPolicy::SingleSlot`] keeps one start instant
//! for the whole aggregator: nested or concurrent intervals overwrite each
//! other's start, and an `after` without a fresh `before` measures from the
//! last start however old it is. [`StartPolicy::PerName`] tracks one start
//! per name instead.
//!
//! A process-wide instance backs the free functions [`before`], [`after`]
//! and [`times`], which are what instrumented code calls into.
//!
//! The instance overloads key intervals on [`Named::type_name`], which is
//! dispatched on the concrete value, so transformers held as trait objects
//! are still timed separately.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Values that can report their runtime type name
///
/// The default reports the implementing type's path. Use it as a supertrait
/// so `dyn` values resolve to the concrete type:
///
/// ```
/// use metronome::timing::Named;
///
/// trait Transformer: Named {}
///
/// struct Deobf;
/// impl Named for Deobf {}
/// impl Transformer for Deobf {}
///
/// let boxed: Box<dyn Transformer> = Box::new(Deobf);
/// assert!(boxed.type_name().ends_with("Deobf"));
/// ```
pub trait Named {
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<T: Named + ?Sized> Named for &T {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }
}

impl<T: Named + ?Sized> Named for Box<T> {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }
}

impl<T: Named + ?Sized> Named for Arc<T> {
    fn type_name(&self) -> &str {
        (**self).type_name()
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Monotonic time source, as an offset from an arbitrary origin
pub trait Clock: Send {
    fn now(&self) -> Duration;
}

/// Monotonic clock measuring from its own creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saturates at `u64::MAX` nanoseconds
    pub fn advance(&self, by: Duration) {
        let by = nanos(by);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by))
            });
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(nanos(to), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Where interval start instants are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPolicy {
    /// One shared start instant, overwritten by every `before`
    #[default]
    SingleSlot,
    /// One start instant per name, consumed by the matching `after`
    PerName,
}

pub struct TimingAggregator<C: Clock = SystemClock> {
    clock: C,
    policy: StartPolicy,
    start: Duration,
    starts: HashMap<String, Duration>,
    times: HashMap<String, Duration>,
}

impl TimingAggregator<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::new(), StartPolicy::default())
    }
}

impl Default for TimingAggregator<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> TimingAggregator<C> {
    /// The single start slot begins at the clock's current time
    pub fn with_clock(clock: C, policy: StartPolicy) -> Self {
        let start = clock.now();
        Self {
            clock,
            policy,
            start,
            starts: HashMap::new(),
            times: HashMap::new(),
        }
    }

    pub fn policy(&self) -> StartPolicy {
        self.policy
    }

    /// Mark the start of an interval
    pub fn before(&mut self, name: &str) {
        let now = self.clock.now();
        match self.policy {
            StartPolicy::SingleSlot => self.start = now,
            StartPolicy::PerName => {
                self.starts.insert(name.to_string(), now);
            }
        }
    }

    /// Close an interval and add its length to `name`
    ///
    /// Under [`StartPolicy::PerName`], an `after` with no pending `before`
    /// for the same name records nothing.
    pub fn after(&mut self, name: &str) {
        let now = self.clock.now();
        let start = match self.policy {
            StartPolicy::SingleSlot => self.start,
            StartPolicy::PerName => match self.starts.remove(name) {
                Some(start) => start,
                None => {
                    tracing::debug!(name, "after() without a pending before()");
                    return;
                }
            },
        };
        let elapsed = now.saturating_sub(start);
        *self.times.entry(name.to_string()).or_default() += elapsed;
    }

    /// [`before`](Self::before) keyed by the instance's runtime type name
    pub fn before_instance<T: Named + ?Sized>(&mut self, instance: &T) {
        self.before(instance.type_name());
    }

    /// [`after`](Self::after) keyed by the instance's runtime type name
    pub fn after_instance<T: Named + ?Sized>(&mut self, instance: &T) {
        self.after(instance.type_name());
    }

    /// Accumulated times ordered by name
    pub fn snapshot(&self) -> BTreeMap<String, Duration> {
        self.times
            .iter()
            .map(|(name, total)| (name.clone(), *total))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Drop all accumulated times and pending starts
    pub fn clear(&mut self) {
        self.times.clear();
        self.starts.clear();
        self.start = self.clock.now();
    }

    /// Write a table of accumulated times, longest first
    pub fn write_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if self.times.is_empty() {
            writeln!(out, "\nNo transformer timing data collected.")?;
            return Ok(());
        }

        let mut sorted: Vec<_> = self.times.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let total: Duration = sorted.iter().map(|(_, d)| **d).sum();

        writeln!(out)?;
        writeln!(out, "Transformer Timing Summary (sorted by total time)")?;
        writeln!(out, "{:<60} {:>12} {:>8}", "Name", "Total Time", "Share")?;
        writeln!(out, "{}", "─".repeat(82))?;
        for (name, time) in sorted {
            let share = if total.is_zero() {
                0.0
            } else {
                time.as_secs_f64() / total.as_secs_f64() * 100.0
            };
            writeln!(
                out,
                "{:<60} {:>11.6}s {:>7.2}%",
                name,
                time.as_secs_f64(),
                share
            )?;
        }
        writeln!(out, "{}", "─".repeat(82))?;
        writeln!(out, "{:<60} {:>11.6}s", "total", total.as_secs_f64())
    }

    /// Print the summary table to stderr
    pub fn print_summary(&self) {
        let stderr = io::stderr();
        let _ = self.write_summary(&mut stderr.lock());
    }
}

static GLOBAL: OnceLock<Mutex<TimingAggregator>> = OnceLock::new();

/// Process-wide aggregator used by instrumented code
pub fn global() -> &'static Mutex<TimingAggregator> {
    GLOBAL.get_or_init(|| Mutex::new(TimingAggregator::new()))
}

fn lock() -> MutexGuard<'static, TimingAggregator> {
    global().lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn before(name: &str) {
    lock().before(name);
}

pub fn after(name: &str) {
    lock().after(name);
}

pub fn before_instance<T: Named + ?Sized>(instance: &T) {
    lock().before_instance(instance);
}

pub fn after_instance<T: Named + ?Sized>(instance: &T) {
    lock().after_instance(instance);
}

/// Snapshot of the process-wide aggregator, ordered by name
pub fn times() -> BTreeMap<String, Duration> {
    lock().snapshot()
}
