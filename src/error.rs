use log::error;
use thiserror::Error;

use crate::options::{OnMisuse, Options};

/// Caller-side violations of the `WaitGroup` contract. Always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    #[error("negative counter")]
    NegativeCounter,
    #[error("Add called concurrently with Wait")]
    ConcurrentAddWait,
    #[error("counter overflow")]
    Overflow,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for signal")]
    Timeout,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Logs the diagnostic and terminates according to `options.on_misuse`.
/// Callers must have restored their state before getting here.
#[cold]
#[track_caller]
pub(crate) fn report(options: &Options, misuse: Misuse) -> ! {
    let message = match &options.name {
        Some(name) => format!("waitgroup {name:?}: WaitGroup misuse: {misuse}"),
        None => format!("waitgroup: WaitGroup misuse: {misuse}"),
    };
    error!("{}", message);
    match options.on_misuse {
        OnMisuse::Panic => panic!("{}", message),
        OnMisuse::Abort => {
            eprintln!("{} at {}", message, std::panic::Location::caller());
            std::process::abort()
        }
    }
}
