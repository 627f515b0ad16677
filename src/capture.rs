//! Capture for uncaught panics and unhandled errors.
//!
//! This is the half of the capture engine that runs in ordinary thread
//! context (a panic hook, or a top-level error handler), where allocation and
//! formatting are available. The signal half lives in `signal.rs`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::Cell;
use std::error::Error;
use std::fmt::Write as _;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::record::CrashRecord;
use crate::registry::registry;
use crate::store::ReportStore;

/// A panic hook as accepted by [`std::panic::set_hook`].
pub(crate) type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

thread_local! {
    /// Set while this thread is inside our hook. Nested copies of the hook
    /// (left behind by a repeated install) only forward.
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

/// Set once a panic has been persisted in this process.
static PANIC_CAPTURED: AtomicBool = AtomicBool::new(false);

/// What is known about an uncaught failure at the point it is captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    message: Option<String>,
    description: String,
    stack_trace: String,
}

impl Failure {
    /// Describe a failure explicitly.
    ///
    /// `description` is used as the record's error text when `message` is
    /// absent or empty.
    pub fn new(
        message: Option<String>,
        description: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            message,
            description: description.into(),
            stack_trace: stack_trace.into(),
        }
    }

    /// Describe a panic from inside a panic hook.
    pub fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::force_capture();

        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        let description = match &location {
            Some(loc) => format!("panicked at {loc}"),
            None => "panic with non-string payload".to_string(),
        };

        let thread = std::thread::current();
        let mut stack_trace = format!("Panic on thread '{}'\n", thread.name().unwrap_or("<unnamed>"));
        if let Some(loc) = &location {
            let _ = writeln!(stack_trace, "Location: {loc}");
        }
        let _ = write!(stack_trace, "\nStack Trace:\n{backtrace}");

        Self {
            message: payload_message(info.payload()),
            description,
            stack_trace,
        }
    }

    /// Describe an error value that reached the top of the program unhandled.
    ///
    /// The stack trace lists the `source()` chain followed by the current
    /// backtrace.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: Error + ?Sized + 'static,
    {
        let backtrace = Backtrace::force_capture();

        let mut stack_trace = format!("Error: {}\n", std::any::type_name::<E>());
        let mut source = error.source();
        while let Some(cause) = source {
            let _ = writeln!(stack_trace, "Caused by: {cause}");
            source = cause.source();
        }
        let _ = write!(stack_trace, "\nStack Trace:\n{backtrace}");

        Self {
            message: Some(error.to_string()),
            description: std::any::type_name::<E>().to_string(),
            stack_trace,
        }
    }

    /// Text for the record's `error` field: the message, else the description.
    pub fn error_text(&self) -> &str {
        match self.message.as_deref() {
            Some(message) if !message.trim().is_empty() => message,
            _ if !self.description.is_empty() => &self.description,
            _ => "unknown error",
        }
    }

    /// Rendered stack trace.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }
}

/// Extract the message from a panic payload, if it is a string.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

/// Build a record for `failure`, stamp it, and persist it.
///
/// Persistence failures are logged by the store and otherwise ignored.
pub fn capture_from_error(store: &ReportStore, failure: &Failure) -> CrashRecord {
    let record = CrashRecord::new(failure.error_text().to_string(), failure.stack_trace.clone());
    store.save(&record);
    record
}

/// Whether a panic has been persisted by this process.
pub(crate) fn panic_captured() -> bool {
    PANIC_CAPTURED.load(Ordering::SeqCst)
}

/// Wrap `previous` in a hook that captures first and then forwards.
///
/// The previous hook always runs, with the same `PanicHookInfo`, whether or
/// not capture happened.
pub(crate) fn chained_panic_hook(previous: PanicHook) -> PanicHook {
    Box::new(move |info| {
        let outermost = !CAPTURING.with(|c| c.replace(true));
        if outermost && let Some(store) = registry().attached_store() {
            capture_from_error(store, &Failure::from_panic(info));
            PANIC_CAPTURED.store(true, Ordering::SeqCst);
        }

        previous(info);

        if outermost {
            CAPTURING.with(|c| c.set(false));
        }
    })
}
