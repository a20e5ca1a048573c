use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use log::trace;

use crate::error::{self, Misuse};
use crate::options::Options;
use crate::signal::{Signal, SignalState};

/// A countdown counter that observers can wait on until it returns to zero.
///
/// Producers raise the counter with [`add`](WaitGroup::add) and lower it with
/// [`done`](WaitGroup::done). Observers either block in
/// [`wait`](WaitGroup::wait) or take a [`Signal`] from
/// [`wait_signal`](WaitGroup::wait_signal) and wait on it however they like.
///
/// Each stretch from the counter leaving zero to it coming back is a
/// generation with its own one-shot signal. Raising the counter while a
/// `wait` is in progress, or lowering it below zero, is misuse and is handled
/// according to [`Options::on_misuse`].
pub struct WaitGroup {
    counter: AtomicI32,
    waiting: AtomicI32,
    signal: ArcSwapOption<SignalState>,
    // Held while the counter crosses zero in either direction and while a
    // signal is installed. Never held across a blocking wait.
    transition: Mutex<()>,
    options: Options,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> WaitGroup {
        WaitGroup {
            counter: AtomicI32::new(0),
            waiting: AtomicI32::new(0),
            signal: ArcSwapOption::empty(),
            transition: Mutex::new(()),
            options,
        }
    }

    /// Adds `delta`, which may be negative, to the counter.
    ///
    /// When the counter drops to zero the current signal fires and every
    /// waiter is released. A positive `delta` on a zero counter starts a new
    /// generation with a freshly armed signal; it must not race with a
    /// `wait` that is already in progress.
    #[track_caller]
    pub fn add(&self, delta: i32) {
        if delta > 0 {
            self.increment(delta);
        } else if delta < 0 && self.subtract(delta) {
            error::report(&self.options, Misuse::NegativeCounter);
        }
    }

    #[track_caller]
    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        if self.counter.load(Ordering::Acquire) == 0 {
            return;
        }
        let _presence = Presence::enter(&self.waiting);
        // Pairs with the check of `waiting` after a positive add.
        if self.counter.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.wait_signal().wait();
    }

    /// Returns a handle that becomes ready once the counter has been zero at
    /// some point no earlier than this call.
    ///
    /// On a zero counter the handle is already ready. A later positive `add`
    /// does not re-arm a handle that was handed out; it installs a new one.
    pub fn wait_signal(&self) -> Signal {
        if let Some(state) = self.signal.load_full() {
            return Signal::from_state(state);
        }
        let _guard = self.lock();
        if let Some(state) = self.signal.load_full() {
            return Signal::from_state(state);
        }
        // Nothing was ever installed, so no generation has begun and the
        // counter stays at zero while we hold the lock.
        let signal = Signal::fired();
        self.signal.store(Some(signal.state().clone()));
        trace!("{}: installed pre-fired signal", self.label());
        signal
    }

    /// Current value of the counter.
    pub fn count(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Number of callers currently inside [`wait`](WaitGroup::wait).
    pub fn waiters(&self) -> i32 {
        self.waiting.load(Ordering::Acquire)
    }

    #[track_caller]
    fn increment(&self, delta: i32) {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                self.begin_generation(delta);
                break;
            }
            let Some(next) = current.checked_add(delta) else {
                error::report(&self.options, Misuse::Overflow);
            };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.waiting.load(Ordering::SeqCst) != 0 {
            let misuse = self.roll_back(delta);
            error::report(&self.options, misuse);
        }
    }

    /// Undoes a positive add that raced with `wait`. A concurrent extra
    /// `done` can make the undo land below zero; that is reported instead.
    fn roll_back(&self, delta: i32) -> Misuse {
        if self.subtract(-delta) {
            Misuse::NegativeCounter
        } else {
            Misuse::ConcurrentAddWait
        }
    }

    #[track_caller]
    fn begin_generation(&self, delta: i32) {
        let _guard = self.lock();
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(delta) else {
                error::report(&self.options, Misuse::Overflow);
            };
            if current == 0 {
                // Installed before the counter turns positive, so a positive
                // counter always comes with an armed signal.
                self.signal.store(Some(Signal::armed().state().clone()));
            }
            match self.counter.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 0 {
                        trace!("{}: generation begun with {}", self.label(), delta);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Applies a negative `delta`, clamping at zero. Returns whether the
    /// counter would have gone negative.
    fn subtract(&self, delta: i32) -> bool {
        let mut current = self.counter.load(Ordering::Relaxed);
        // Lock-free while the counter stays positive.
        loop {
            let next = current + delta;
            if next <= 0 {
                break;
            }
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(actual) => current = actual,
            }
        }
        self.end_generation(delta)
    }

    fn end_generation(&self, delta: i32) -> bool {
        let (went_negative, ended) = self.settle(delta);
        // Fired with the lock released: woken tasks may start the next
        // generation from inside `wake`.
        if let Some(signal) = ended {
            if signal.fire() {
                trace!("{}: generation ended", self.label());
            }
        }
        went_negative
    }

    /// Applies `delta` under the transition lock. Returns whether the counter
    /// would have gone negative, and the signal to fire if it reached zero.
    fn settle(&self, delta: i32) -> (bool, Option<Signal>) {
        let _guard = self.lock();
        let mut current = self.counter.load(Ordering::Acquire);
        loop {
            let next = current + delta;
            let clamped = next.max(0);
            if clamped == current {
                // Already zero; nothing to fire.
                return (next < 0, None);
            }
            // AcqRel makes every earlier decrement visible before the signal
            // fires, and the fire publishes them to the waiters.
            match self.counter.compare_exchange(
                current,
                clamped,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Captured under the lock, so this is the generation that
                    // just ended even if a new one begins before it fires.
                    let ended = if clamped == 0 {
                        self.signal.load_full().map(Signal::from_state)
                    } else {
                        None
                    };
                    return (next < 0, ended);
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> &str {
        self.options.name.as_deref().unwrap_or("waitgroup")
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new()
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signal = self.signal.load_full().map(Signal::from_state);
        f.debug_struct("WaitGroup")
            .field("name", &self.options.name)
            .field("counter", &self.count())
            .field("waiting", &self.waiters())
            .field("signal", &signal)
            .finish()
    }
}

// Marks a caller as inside `wait` for as long as it lives, unwinding included.
struct Presence<'a>(&'a AtomicI32);

impl<'a> Presence<'a> {
    fn enter(waiting: &'a AtomicI32) -> Presence<'a> {
        waiting.fetch_add(1, Ordering::SeqCst);
        Presence(waiting)
    }
}

impl Drop for Presence<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
