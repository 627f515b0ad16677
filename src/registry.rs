//! Handler registry: owns the process-wide crash hooks.
//!
//! There is exactly one registry per process. Installing it saves whatever
//! panic hook and fatal-signal dispositions were in place and puts ours in
//! front of them. Detaching only stops persistence; the hooks stay installed
//! and keep forwarding to what was there before.

use std::panic;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::capture::chained_panic_hook;
use crate::config::{CrashConfig, config};
use crate::store::ReportStore;

static REGISTRY: HandlerRegistry = HandlerRegistry::new();

/// Returns the process-wide registry.
#[inline]
pub fn registry() -> &'static HandlerRegistry {
    &REGISTRY
}

/// Process-wide crash hook state.
///
/// Fields read from crash context (`store`, `attached`) are lock-free.
/// `install_lock` is only ever taken on the installing thread.
#[derive(Debug)]
pub struct HandlerRegistry {
    store: OnceLock<ReportStore>,
    fallback: OnceLock<ReportStore>,
    attached: AtomicBool,
    installs: AtomicUsize,
    install_lock: Mutex<()>,
}

impl HandlerRegistry {
    const fn new() -> Self {
        Self {
            store: OnceLock::new(),
            fallback: OnceLock::new(),
            attached: AtomicBool::new(false),
            installs: AtomicUsize::new(0),
            install_lock: Mutex::new(()),
        }
    }

    /// Install the panic hook and fatal signal handlers.
    ///
    /// The first configuration seen by the registry fixes the report location
    /// for the rest of the process. Calling this again re-chains against the
    /// hooks installed at that moment and re-attaches after [`uninstall`].
    ///
    /// [`uninstall`]: HandlerRegistry::uninstall
    pub fn install(&self, config: CrashConfig) {
        let _guard = self
            .install_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let store = self.store.get_or_init(|| ReportStore::new(&config));
        if store.path() != config.report_path() {
            tracing::warn!(
                requested = %config.report_path().display(),
                active = %store.path().display(),
                "crash handler already configured; keeping the active report path"
            );
        }

        // The signal path cannot create directories, so do it now.
        if let Some(dir) = store.path().parent()
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create crash report directory");
        }

        let previous = panic::take_hook();
        panic::set_hook(chained_panic_hook(previous));

        #[cfg(unix)]
        let chained_signals = crate::signal::install(store);
        #[cfg(not(unix))]
        let chained_signals = 0;

        self.attached.store(true, Ordering::SeqCst);
        let installs = self.installs.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::info!(
            path = %store.path().display(),
            installs,
            chained_signals,
            "crash handler installed"
        );
    }

    /// Stop persisting crashes.
    ///
    /// The OS-level and panic hooks are left in place so whatever was
    /// installed before keeps receiving failures.
    pub fn uninstall(&self) {
        if self.attached.swap(false, Ordering::SeqCst) {
            tracing::debug!("crash handler detached");
        }
    }

    /// Whether captures are currently persisted.
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Number of completed `install` calls.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// The store used for capture, if attached.
    pub(crate) fn attached_store(&self) -> Option<&ReportStore> {
        if self.is_attached() {
            self.store.get()
        } else {
            None
        }
    }

    /// The store used for retrieval.
    ///
    /// Falls back to the environment configuration when nothing has been
    /// installed yet, so a report can be collected before `initialize`
    /// without fixing the location a later install will use.
    pub fn store(&self) -> &ReportStore {
        match self.store.get() {
            Some(store) => store,
            None => self.fallback.get_or_init(|| ReportStore::new(config())),
        }
    }
}
