//! Minimal embeddable crash capture.
//!
//! Hooks the process's uncaught-panic channel and its fatal signals
//! (`SIGABRT`, `SIGILL`, `SIGSEGV`, `SIGFPE`, `SIGBUS`), persists a single
//! [`CrashRecord`] before the process goes down, and hands that record to the
//! next launch exactly once.
//!
//! # Example
//!
//! ```no_run
//! use flux_crash_handler::{CrashConfig, get_last_crash, initialize_with};
//!
//! initialize_with(CrashConfig::new("/var/lib/myapp"));
//!
//! if let Some(crash) = get_last_crash() {
//!     eprintln!("last run crashed at {}: {}", crash.timestamp(), crash.error());
//! }
//! ```
//!
//! Previously installed hooks keep working: after a panic is recorded the
//! previous panic hook runs with the same info, and after a fatal signal is
//! recorded the previous handler runs and the signal is re-raised with its
//! default action.

pub mod capture;
pub mod config;
pub mod error;
pub mod record;
pub mod registry;
#[cfg(unix)]
mod signal;
pub mod store;

pub use capture::{Failure, capture_from_error};
pub use config::{CRASH_FILE_NAME, CrashConfig};
pub use error::StoreError;
pub use record::CrashRecord;
pub use registry::{HandlerRegistry, registry};
pub use store::ReportStore;

/// Install crash capture using the environment configuration
/// (`FLUX_CRASH_DIR`).
pub fn initialize() {
    registry().install(config::config().clone());
}

/// Install crash capture, storing reports under `config`'s data directory.
pub fn initialize_with(config: CrashConfig) {
    registry().install(config);
}

/// Remove and return the report left by a previous crash.
///
/// Meant to be called once, early during startup. Returns `None` when there
/// is no report or it could not be read.
pub fn get_last_crash() -> Option<CrashRecord> {
    registry().store().take()
}

/// Stop persisting crashes. Installed hooks stay in place and keep
/// forwarding to the handlers that were there before.
pub fn detach() {
    registry().uninstall();
}

/// Record an error that reached the top of the program unhandled, such as
/// the `Err` returned from `main`.
///
/// Does nothing unless crash capture is installed and attached.
pub fn report_error<E>(error: &E) -> Option<CrashRecord>
where
    E: std::error::Error + ?Sized + 'static,
{
    let store = registry().attached_store()?;
    Some(capture_from_error(store, &Failure::from_error(error)))
}

/// Message carried by test crashes.
#[cfg(feature = "diagnostics")]
pub const TEST_CRASH_MESSAGE: &str = "Test crash triggered by FluxCrashHandler";

/// Kind of failure raised by [`trigger_test_crash_with`].
#[cfg(feature = "diagnostics")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestCrash {
    /// An uncaught panic.
    #[default]
    Panic,
    /// `abort()`, delivering `SIGABRT`.
    Abort,
    /// A write to an unmapped address, delivering `SIGSEGV`.
    Segfault,
}

/// Raise an uncaught panic to exercise the capture path end-to-end.
///
/// Returns immediately. The panic happens on a separate thread, and once it
/// has been captured the process exits with status 101, as it would after an
/// uncaught panic on the main thread.
#[cfg(feature = "diagnostics")]
pub fn trigger_test_crash() {
    trigger_test_crash_with(TestCrash::Panic);
}

/// Raise a test failure of the given kind after returning to the caller.
///
/// Every kind terminates the process.
#[cfg(feature = "diagnostics")]
pub fn trigger_test_crash_with(kind: TestCrash) {
    tracing::info!(?kind, "triggering test crash");
    let spawned = std::thread::Builder::new()
        .name("flux-test-crash".into())
        .spawn(move || raise_test_crash(kind));
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "cannot spawn test crash thread");
    }
}

#[cfg(feature = "diagnostics")]
fn raise_test_crash(kind: TestCrash) {
    match kind {
        TestCrash::Panic => {
            // The hook has persisted the record by the time unwinding ends.
            if std::panic::catch_unwind(panic_with_test_message).is_err() {
                std::process::exit(101);
            }
        }
        TestCrash::Abort => std::process::abort(),
        TestCrash::Segfault => {
            // SAFETY: none. Address 0x1 is never mapped; the write faults.
            unsafe { std::ptr::dangling_mut::<u8>().write_volatile(1) }
        }
    }
}

#[cfg(feature = "diagnostics")]
fn panic_with_test_message() {
    panic!("{TEST_CRASH_MESSAGE}");
}
