#![allow(dead_code)]
//! Shared integration test utilities.

use std::any::Any;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use waitgroup_signal::{OnMisuse, Options, WaitGroup};

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Trace)
            .try_init();
    });
}

/// A group that panics on misuse instead of aborting the test binary.
pub fn panicking_group(name: &str) -> WaitGroup {
    WaitGroup::with_options(Options {
        name: Some(name.to_string()),
        on_misuse: OnMisuse::Panic,
    })
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        String::new()
    }
}

/// Spins until `condition` holds, failing the test after a generous bound.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
