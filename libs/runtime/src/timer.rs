//! Timer service.
//!
//! One thread per [`TimerManager`] sleeps until the earliest deadline in a
//! min-heap and posts a [`TimerEvent`] into the sink the timer was started
//! with. Firings are posted with the heap lock released, so a consumer may
//! stop or restart the very timer it is handling.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::event::{EventSink, TimerEvent};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// How often a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Count(u32),
    Continuous,
}

impl Repeat {
    pub fn once() -> Self {
        Repeat::Count(1)
    }
}

struct TimerInner {
    id: TimerId,
    name: String,
    period: Duration,
    repeat: Repeat,
    running: AtomicBool,
    generation: AtomicU64,
}

/// Cloneable timer handle.
///
/// The generation changes every time the timer is started or stopped;
/// a [`TimerEvent`] carrying an older generation is stale.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub fn new(name: impl Into<String>, period: Duration, repeat: Repeat) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                id: TimerId::next(),
                name: name.into(),
                period,
                repeat,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> TimerId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn period(&self) -> Duration {
        self.inner.period
    }

    pub fn repeat(&self) -> Repeat {
        self.inner.repeat
    }

    /// True while scheduled in a timer manager
    pub fn is_active(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn restart_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn validate(&self) -> Result<()> {
        if self.inner.period.is_zero() {
            return Err(Error::InvalidTimer {
                name: self.inner.name.clone(),
                reason: "period must be non-zero",
            });
        }
        if self.inner.repeat == Repeat::Count(0) {
            return Err(Error::InvalidTimer {
                name: self.inner.name.clone(),
                reason: "repeat count must be at least one",
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("period", &self.inner.period)
            .field("repeat", &self.inner.repeat)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Scheduled {
    timer: Timer,
    sink: Arc<dyn EventSink>,
    generation: u64,
    deadline: Instant,
    remaining: Option<u32>,
    fired: u64,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<(Instant, u64, TimerId)>>,
    table: HashMap<TimerId, Scheduled>,
    insertions: u64,
    shutdown: bool,
}

impl State {
    fn push(&mut self, deadline: Instant, id: TimerId) {
        self.insertions += 1;
        self.heap.push(Reverse((deadline, self.insertions, id)));
    }

    fn remove(&mut self, id: TimerId) -> Option<Scheduled> {
        let removed = self.table.remove(&id)?;
        self.heap.retain(|Reverse((_, _, entry))| *entry != id);
        Some(removed)
    }
}

struct Shared {
    name: String,
    state: Mutex<State>,
    wake: Condvar,
}

struct Firing {
    sink: Arc<dyn EventSink>,
    event: TimerEvent,
}

/// Owner of the timer-service thread
pub struct TimerManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    pub fn start() -> Result<Self> {
        Self::start_named("timer-service")
    }

    pub fn start_named(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });

        let service = shared.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(service))
            .map_err(|source| Error::Spawn { name, source })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `timer`, delivering its firings to `sink`.
    ///
    /// Starting a timer that is already scheduled replaces its schedule.
    pub fn start_timer(&self, timer: &Timer, sink: Arc<dyn EventSink>) -> Result<()> {
        timer.validate()?;
        let deadline = Instant::now()
            .checked_add(timer.period())
            .ok_or_else(|| Error::InvalidTimer {
                name: timer.name().to_string(),
                reason: "period too large",
            })?;

        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::Stopped(self.shared.name.clone()));
        }
        state.remove(timer.id());

        let generation = timer.restart_generation();
        let remaining = match timer.repeat() {
            Repeat::Count(n) => Some(n),
            Repeat::Continuous => None,
        };
        state.table.insert(
            timer.id(),
            Scheduled {
                timer: timer.clone(),
                sink,
                generation,
                deadline,
                remaining,
                fired: 0,
            },
        );
        state.push(deadline, timer.id());
        timer.inner.running.store(true, Ordering::Release);
        drop(state);

        tracing::trace!(timer = %timer.id(), name = timer.name(), "timer started");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel `timer`. Returns `false` if it was not scheduled.
    ///
    /// A firing already posted is still delivered but reports
    /// [`TimerEvent::is_active`] as `false`.
    pub fn stop_timer(&self, timer: &Timer) -> bool {
        let mut state = self.shared.state.lock();
        let removed = state.remove(timer.id()).is_some();
        if removed {
            timer.restart_generation();
            timer.inner.running.store(false, Ordering::Release);
            tracing::trace!(timer = %timer.id(), name = timer.name(), "timer stopped");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().table.len()
    }

    /// Stop the service thread; pending timers are dropped
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                state.shutdown = true;
                for (_, scheduled) in state.table.drain() {
                    scheduled.timer.inner.running.store(false, Ordering::Release);
                }
                state.heap.clear();
            }
        }
        self.shared.wake.notify_all();

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(service = %self.shared.name, "timer thread panicked");
            }
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("name", &self.shared.name)
            .field("active", &self.active_count())
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();

    while !state.shutdown {
        let now = Instant::now();
        let next = state.heap.peek().map(|Reverse((deadline, _, _))| *deadline);

        match next {
            None => shared.wake.wait(&mut state),
            Some(deadline) if deadline > now => {
                shared.wake.wait_until(&mut state, deadline);
            }
            Some(_) => {
                let Some(firing) = take_due(&mut state, now) else {
                    continue;
                };
                let timer = firing.event.timer.clone();
                let generation = firing.event.generation;

                let accepted =
                    MutexGuard::unlocked(&mut state, || firing.sink.post(firing.event.into()));

                if !accepted && timer.generation() == generation && state.remove(timer.id()).is_some()
                {
                    timer.inner.running.store(false, Ordering::Release);
                    tracing::debug!(timer = %timer.id(), "timer sink closed, timer removed");
                }
            }
        }
    }

    tracing::debug!(service = %shared.name, "timer service exited");
}

/// Pop the earliest due entry and advance its schedule
fn take_due(state: &mut State, now: Instant) -> Option<Firing> {
    let Reverse((_, _, id)) = state.heap.pop()?;
    let scheduled = state.table.get_mut(&id)?;

    let sequence = scheduled.fired;
    scheduled.fired += 1;
    let event = TimerEvent {
        timer: scheduled.timer.clone(),
        generation: scheduled.generation,
        sequence,
        fired_at: now,
    };
    let sink = scheduled.sink.clone();

    let again = match &mut scheduled.remaining {
        None => true,
        Some(left) => {
            *left = left.saturating_sub(1);
            *left > 0
        }
    };

    let next = if again {
        next_deadline(scheduled.deadline, scheduled.timer.period(), now)
    } else {
        None
    };

    match next {
        Some(deadline) => {
            scheduled.deadline = deadline;
            state.push(deadline, id);
        }
        None => {
            if again {
                tracing::warn!(timer = %id, "next deadline out of range, timer finished");
            }
            if let Some(done) = state.table.remove(&id) {
                done.timer.inner.running.store(false, Ordering::Release);
            }
        }
    }

    Some(Firing { sink, event })
}

/// `previous + period`, or `now + period` once more than a period behind.
/// `None` when the deadline is not representable.
fn next_deadline(previous: Instant, period: Duration, now: Instant) -> Option<Instant> {
    let deadline = previous.checked_add(period)?;
    match deadline.checked_add(period) {
        Some(after) if after <= now => now.checked_add(period),
        _ => Some(deadline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventPayload};
    use std::sync::mpsc;

    struct ChannelSink(Mutex<mpsc::Sender<TimerEvent>>);

    impl EventSink for ChannelSink {
        fn post(&self, event: Event) -> bool {
            match event.payload {
                EventPayload::Timer(timer) => self.0.lock().send(timer).is_ok(),
                _ => false,
            }
        }
    }

    fn channel() -> (Arc<ChannelSink>, mpsc::Receiver<TimerEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelSink(Mutex::new(tx))), rx)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn one_shot_fires_once() {
        let manager = TimerManager::start().unwrap();
        let (sink, rx) = channel();
        let timer = Timer::new("once", Duration::from_millis(10), Repeat::once());

        manager.start_timer(&timer, sink).unwrap();
        let fired = rx.recv_timeout(WAIT).unwrap();

        assert_eq!(fired.timer_id(), timer.id());
        assert_eq!(fired.sequence, 0);
        assert!(fired.is_active());
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
        assert!(!timer.is_active());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn counted_timer_fires_exactly_n_times() {
        let manager = TimerManager::start().unwrap();
        let (sink, rx) = channel();
        let timer = Timer::new("thrice", Duration::from_millis(5), Repeat::Count(3));

        manager.start_timer(&timer, sink).unwrap();
        let sequences: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(WAIT).unwrap().sequence)
            .collect();

        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn continuous_timer_runs_until_stopped() {
        let manager = TimerManager::start().unwrap();
        let (sink, rx) = channel();
        let period = Duration::from_millis(10);
        let timer = Timer::new("tick", period, Repeat::Continuous);

        let started = Instant::now();
        manager.start_timer(&timer, sink).unwrap();
        for k in 1..=5u32 {
            let fired = rx.recv_timeout(WAIT).unwrap();
            assert!(fired.fired_at.duration_since(started) >= period * k);
        }

        assert!(manager.stop_timer(&timer));
        assert!(!timer.is_active());

        // Anything still arriving was posted before the stop.
        while let Ok(late) = rx.recv_timeout(Duration::from_millis(50)) {
            assert!(!late.is_active());
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn stopping_an_idle_timer_is_a_no_op() {
        let manager = TimerManager::start().unwrap();
        let timer = Timer::new("idle", Duration::from_millis(10), Repeat::once());
        assert!(!manager.stop_timer(&timer));
    }

    #[test]
    fn restart_replaces_schedule() {
        let manager = TimerManager::start().unwrap();
        let (sink, rx) = channel();
        let timer = Timer::new("restart", Duration::from_millis(30), Repeat::once());

        manager.start_timer(&timer, sink.clone()).unwrap();
        let first = timer.generation();
        manager.start_timer(&timer, sink).unwrap();

        assert_eq!(manager.active_count(), 1);
        let fired = rx.recv_timeout(WAIT).unwrap();
        assert_ne!(fired.generation, first);
        assert!(rx.recv_timeout(Duration::from_millis(80)).is_err());
    }

    #[test]
    fn invalid_timers_are_rejected() {
        let manager = TimerManager::start().unwrap();
        let (sink, _rx) = channel();

        let zero = Timer::new("zero", Duration::ZERO, Repeat::once());
        assert!(matches!(
            manager.start_timer(&zero, sink.clone()),
            Err(Error::InvalidTimer { .. })
        ));

        let never = Timer::new("never", Duration::from_millis(1), Repeat::Count(0));
        assert!(matches!(
            manager.start_timer(&never, sink),
            Err(Error::InvalidTimer { .. })
        ));
    }

    #[test]
    fn unrepresentable_period_is_rejected() {
        let manager = TimerManager::start().unwrap();
        let (sink, _rx) = channel();
        let timer = Timer::new("forever", Duration::MAX, Repeat::Continuous);

        let result = manager.start_timer(&timer, sink);
        assert!(matches!(
            result,
            Err(Error::InvalidTimer { reason: "period too large", .. })
        ));
        assert!(!timer.is_active());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn next_deadline_skips_missed_slots_and_saturates() {
        let start = Instant::now();
        let period = Duration::from_millis(10);

        assert_eq!(next_deadline(start, period, start), Some(start + period));
        let late = start + Duration::from_millis(35);
        assert_eq!(next_deadline(start, period, late), Some(late + period));
        assert_eq!(next_deadline(start, Duration::MAX, start), None);
    }

    #[test]
    fn closed_sink_removes_timer() {
        let manager = TimerManager::start().unwrap();
        let (sink, rx) = channel();
        drop(rx);
        let timer = Timer::new("orphan", Duration::from_millis(5), Repeat::Continuous);

        manager.start_timer(&timer, sink).unwrap();
        let deadline = Instant::now() + WAIT;
        while manager.active_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(manager.active_count(), 0);
        assert!(!timer.is_active());
    }

    #[test]
    fn start_after_shutdown_fails() {
        let manager = TimerManager::start().unwrap();
        let (sink, _rx) = channel();
        manager.shutdown();

        let timer = Timer::new("late", Duration::from_millis(5), Repeat::once());
        assert!(matches!(
            manager.start_timer(&timer, sink),
            Err(Error::Stopped(_))
        ));
    }
}
