//! A wait group whose completion can be observed through a one-shot signal.
//!
//! [`WaitGroup`] is a countdown counter: producers [`add`](WaitGroup::add) and
//! [`done`](WaitGroup::done), observers [`wait`](WaitGroup::wait) until it is
//! back at zero. [`WaitGroup::wait_signal`] hands out a [`Signal`] instead of
//! blocking, so the wait can be combined with timeouts, cancellation or
//! `select!`.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//! use waitgroup_signal::WaitGroup;
//!
//! let wg = Arc::new(WaitGroup::new());
//! for _ in 0..4 {
//!     wg.add(1);
//!     let wg = wg.clone();
//!     thread::spawn(move || wg.done());
//! }
//! wg.wait();
//! assert_eq!(wg.count(), 0);
//! ```
//!
//! A handle taken on a zero counter is ready straight away and is not re-armed
//! by a later [`add`](WaitGroup::add):
//!
//! ```
//! use waitgroup_signal::WaitGroup;
//!
//! let wg = WaitGroup::new();
//! let signal = wg.wait_signal();
//! wg.add(1);
//! assert!(signal.is_fired());
//! assert!(!wg.wait_signal().is_fired());
//! # wg.done();
//! ```

pub mod error;
pub mod options;
pub mod signal;
pub mod wait_group;

pub use error::{Error, Misuse, Result};
pub use options::{OnMisuse, Options};
pub use signal::{Signal, SignalWait};
pub use wait_group::WaitGroup;
