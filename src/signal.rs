use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub(crate) struct SignalState {
    fired: AtomicBool,
    // Async waiters parked on this generation. The same mutex backs the condvar.
    wakers: Mutex<WakerSlab>,
    condvar: Condvar,
}

impl SignalState {
    fn new(fired: bool) -> SignalState {
        SignalState {
            fired: AtomicBool::new(fired),
            wakers: Mutex::new(WakerSlab::default()),
            condvar: Condvar::new(),
        }
    }
}

/// Waker storage that hands out stable slots and reuses freed ones.
#[derive(Debug, Default)]
struct WakerSlab {
    entries: Vec<Option<Waker>>,
    free_slots: Vec<usize>,
}

impl WakerSlab {
    fn insert(&mut self, waker: Waker) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = Some(waker);
            index
        } else {
            self.entries.push(Some(waker));
            self.entries.len() - 1
        }
    }

    fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.take().is_some() {
                self.free_slots.push(index);
            }
        }
        // Shrink from the tail so a burst of cancelled waits leaves nothing behind.
        while self.entries.last().is_some_and(Option::is_none) {
            let tail = self.entries.len() - 1;
            self.entries.pop();
            if let Some(pos) = self.free_slots.iter().position(|&i| i == tail) {
                self.free_slots.swap_remove(pos);
            }
        }
    }

    fn drain(&mut self) -> Vec<Waker> {
        self.free_slots.clear();
        self.entries.drain(..).flatten().collect()
    }

    fn active_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }
}

/// One-shot broadcast event handed out by [`WaitGroup::wait_signal`].
///
/// A signal starts armed and is fired at most once; afterwards every current and
/// future reader sees it ready. Clones share the same event, so a handle can be
/// passed to other threads or tasks and waited on there.
///
/// Besides blocking with [`Signal::wait`], a handle can be waited on with a
/// bound ([`Signal::wait_timeout`], [`Signal::wait_deadline`]) or awaited.
/// Awaiting goes through [`SignalWait`], which lets it take part in `select!`
/// alongside timers and cancellation tokens.
///
/// [`WaitGroup::wait_signal`]: crate::WaitGroup::wait_signal
#[derive(Clone)]
pub struct Signal {
    state: Arc<SignalState>,
}

impl Signal {
    pub(crate) fn armed() -> Signal {
        Signal {
            state: Arc::new(SignalState::new(false)),
        }
    }

    pub(crate) fn fired() -> Signal {
        Signal {
            state: Arc::new(SignalState::new(true)),
        }
    }

    pub(crate) fn from_state(state: Arc<SignalState>) -> Signal {
        Signal { state }
    }

    pub(crate) fn state(&self) -> &Arc<SignalState> {
        &self.state
    }

    /// Moves the signal from armed to fired and wakes everything parked on it.
    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn fire(&self) -> bool {
        let wakers = {
            let mut guard = self.lock();
            // Release pairs with the acquire loads in `is_fired` and the wait loops.
            if self.state.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            self.state.condvar.notify_all();
            guard.drain()
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_fired(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }

    /// Blocks the current thread until the signal fires.
    pub fn wait(&self) {
        if self.is_fired() {
            return;
        }
        let mut guard = self.lock();
        while !self.is_fired() {
            guard = self
                .state
                .condvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks for at most `timeout`. A timeout too large to represent waits forever.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_deadline(deadline),
            None => {
                self.wait();
                Ok(())
            }
        }
    }

    pub fn wait_deadline(&self, deadline: Instant) -> Result<()> {
        if self.is_fired() {
            return Ok(());
        }
        let mut guard = self.lock();
        loop {
            if self.is_fired() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (next, _) = self
                .state
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }

    /// Whether both handles refer to the same event.
    pub fn ptr_eq(this: &Signal, other: &Signal) -> bool {
        Arc::ptr_eq(&this.state, &other.state)
    }

    fn lock(&self) -> MutexGuard<'_, WakerSlab> {
        self.state.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IntoFuture for Signal {
    type Output = ();
    type IntoFuture = SignalWait;

    fn into_future(self) -> SignalWait {
        SignalWait {
            signal: self,
            slot: None,
        }
    }
}

/// Future that resolves once its [`Signal`] fires.
///
/// It holds at most one waker slot on the signal and gives it back when
/// dropped, so abandoned waits (timeouts, losing `select!` branches) do not
/// pile up until the signal fires.
#[must_use = "futures do nothing unless polled"]
pub struct SignalWait {
    signal: Signal,
    slot: Option<usize>,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_fired() {
            self.slot = None;
            return Poll::Ready(());
        }
        let mut wakers = self.signal.lock();
        // Re-check under the lock: `fire` flips the flag and drains wakers while holding it.
        if self.signal.is_fired() {
            drop(wakers);
            self.slot = None;
            return Poll::Ready(());
        }
        match self.slot {
            Some(index) => {
                if let Some(Some(waker)) = wakers.entries.get_mut(index) {
                    if !waker.will_wake(cx.waker()) {
                        waker.clone_from(cx.waker());
                    }
                }
            }
            None => {
                let index = wakers.insert(cx.waker().clone());
                drop(wakers);
                self.slot = Some(index);
            }
        }
        Poll::Pending
    }
}

impl Drop for SignalWait {
    fn drop(&mut self) {
        // After a fire the slab is already drained and the slot is gone.
        if let Some(index) = self.slot.take() {
            self.signal.lock().remove(index);
        }
    }
}

impl fmt::Debug for SignalWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalWait")
            .field("signal", &self.signal)
            .field("registered", &self.slot.is_some())
            .finish()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("fired", &self.is_fired()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;
    use std::thread;

    use super::*;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fire_transitions_once() {
        let signal = Signal::armed();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[test]
    fn pre_fired_signal_never_blocks() {
        let signal = Signal::fired();
        signal.wait();
        assert!(signal.wait_timeout(Duration::ZERO).is_ok());
        assert!(!signal.fire());
    }

    #[test]
    fn wait_timeout_expires_on_armed_signal() {
        let signal = Signal::armed();
        let result = signal.wait_timeout(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn wait_returns_after_fire_from_another_thread() {
        let signal = Signal::armed();
        let remote = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.fire()
        });
        signal.wait();
        assert!(signal.is_fired());
        assert!(handle.join().unwrap());
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        (counter, waker)
    }

    #[test]
    fn poll_registers_waker_once_and_fire_wakes_it() {
        let (counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let signal = Signal::armed();
        let mut wait = signal.clone().into_future();

        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        assert_eq!(signal.lock().active_count(), 1);

        signal.fire();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(Pin::new(&mut wait).poll(&mut cx).is_ready());
        assert_eq!(signal.lock().active_count(), 0);
    }

    #[test]
    fn repoll_with_new_waker_replaces_the_old_one() {
        let (first, first_waker) = counting_waker();
        let (second, second_waker) = counting_waker();
        let signal = Signal::armed();
        let mut wait = signal.clone().into_future();

        let mut cx = Context::from_waker(&first_waker);
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        let mut cx = Context::from_waker(&second_waker);
        assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        assert_eq!(signal.lock().active_count(), 1);

        signal.fire();
        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_waits_release_their_slots() {
        let signal = Signal::armed();
        for _ in 0..10_000 {
            let (_, waker) = counting_waker();
            let mut cx = Context::from_waker(&waker);
            let mut wait = signal.clone().into_future();
            assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        }
        let wakers = signal.lock();
        assert_eq!(wakers.active_count(), 0);
        assert!(wakers.entries.is_empty());
        assert!(wakers.free_slots.is_empty());
    }

    #[test]
    fn slots_are_reused_when_waits_drop_out_of_order() {
        let signal = Signal::armed();
        let (counter, waker) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut waits: Vec<_> = (0..4).map(|_| signal.clone().into_future()).collect();
        for wait in &mut waits {
            assert!(Pin::new(wait).poll(&mut cx).is_pending());
        }
        // Drop the middle two, then register a fresh wait into a freed slot.
        waits.remove(1);
        waits.remove(1);
        let mut late = signal.clone().into_future();
        assert!(Pin::new(&mut late).poll(&mut cx).is_pending());
        assert_eq!(signal.lock().entries.len(), 4);
        assert_eq!(signal.lock().active_count(), 3);

        signal.fire();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        drop(waits);
        drop(late);
        assert!(signal.lock().entries.is_empty());
    }

    #[test]
    fn clones_share_the_event() {
        let signal = Signal::armed();
        let other = signal.clone();
        assert!(Signal::ptr_eq(&signal, &other));
        assert!(!Signal::ptr_eq(&signal, &Signal::armed()));
        other.fire();
        assert!(signal.is_fired());
    }
}
