//! Fatal signal capture.
//!
//! Everything reachable from [`handle_fatal_signal`] must be
//! async-signal-safe: no heap allocation, no locks, no `std::io`, no
//! `tracing`. The report is assembled in fixed stack buffers and written with
//! raw `open`/`write`/`fsync`/`rename` calls on paths that were encoded when
//! the handlers were installed.
//!
//! The JSON produced here must stay readable by [`crate::store::ReportStore`].

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::config::CRASH_FILE_NAME;
use crate::registry::registry;
use crate::store::ReportStore;

/// Signals that end the process without unwinding.
pub(crate) const FATAL_SIGNALS: [libc::c_int; 5] = [
    libc::SIGABRT,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGFPE,
    libc::SIGBUS,
];

/// Disposition each fatal signal had before ours, indexed like
/// [`FATAL_SIGNALS`]. Null means there is nothing to chain to.
///
/// Replaced values are leaked: a handler running on another thread may still
/// hold the old pointer.
static PREVIOUS: [AtomicPtr<libc::sigaction>; FATAL_SIGNALS.len()] =
    [const { AtomicPtr::new(ptr::null_mut()) }; FATAL_SIGNALS.len()];

/// Report paths, encoded once at install time.
static PATHS: OnceLock<ReportPaths> = OnceLock::new();

/// Set by the first fatal signal; later ones skip straight to termination.
static CAPTURED: AtomicBool = AtomicBool::new(false);

const WRITE_FAILED: &[u8] = b"flux_crash_handler: failed to persist crash report\n";

/// NUL-terminated report paths usable from a signal handler.
#[derive(Debug)]
pub(crate) struct ReportPaths {
    report: CString,
    scratch: CString,
}

impl ReportPaths {
    /// Encode the store's paths. `None` if a path contains a NUL byte.
    pub(crate) fn new(store: &ReportStore) -> Option<Self> {
        let report = store.path();
        let scratch = report.with_file_name(format!(".{CRASH_FILE_NAME}.signal.tmp"));
        Some(Self {
            report: CString::new(report.as_os_str().as_bytes()).ok()?,
            scratch: CString::new(scratch.as_os_str().as_bytes()).ok()?,
        })
    }
}

/// Install our handler for every fatal signal.
///
/// The current disposition of each signal is saved for chaining unless it is
/// already our own handler, in which case the earlier saved one is kept.
/// Returns the number of signals that had a real handler to chain to.
pub(crate) fn install(store: &ReportStore) -> usize {
    match ReportPaths::new(store) {
        Some(paths) => {
            let _ = PATHS.set(paths);
        }
        None => tracing::warn!(
            path = %store.path().display(),
            "crash report path is not representable; signal capture will not persist"
        ),
    }

    let mut chained = 0;
    for (slot, &signo) in PREVIOUS.iter().zip(FATAL_SIGNALS.iter()) {
        // SAFETY: `sigaction` is zero-initializable and both pointers are
        // valid for the duration of the call.
        let old = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler_address();
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);

            let mut old: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signo, &action, &mut old) != 0 {
                tracing::warn!(
                    signal = signal_name(signo).unwrap_or("?"),
                    error = %std::io::Error::last_os_error(),
                    "failed to install fatal signal handler"
                );
                continue;
            }
            old
        };

        if old.sa_sigaction == handler_address() {
            continue;
        }
        if is_real_handler(old.sa_sigaction) {
            chained += 1;
        } else {
            tracing::debug!(
                signal = signal_name(signo).unwrap_or("?"),
                "no previous signal handler to chain to"
            );
        }
        slot.swap(Box::into_raw(Box::new(old)), Ordering::SeqCst);
    }
    chained
}

fn handler_address() -> libc::sighandler_t {
    handle_fatal_signal as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
        as libc::sighandler_t
}

fn is_real_handler(handler: libc::sighandler_t) -> bool {
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != handler_address()
}

extern "C" fn handle_fatal_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // A second entry is either a fault inside a chained handler or a chained
    // handler calling back into us. Chaining again could loop forever.
    if CAPTURED.swap(true, Ordering::SeqCst) {
        terminate(signo);
    }

    if !defer_to_panic_record(signo)
        && registry().is_attached()
        && let Some(paths) = PATHS.get()
    {
        capture_from_signal(paths, signo, fault_address(signo, info));
    }

    // SAFETY: `info` and `context` are forwarded untouched from the kernel.
    unsafe { chain_previous(signo, info, context) };
    terminate(signo);
}

/// A panic that cannot unwind ends in `SIGABRT` on the panicking thread: any
/// panic under `panic = "abort"`, a panic while already unwinding, or one that
/// reaches an `extern "C"` boundary. Keep the panic's record rather than
/// replacing it with a bare signal name.
fn defer_to_panic_record(signo: libc::c_int) -> bool {
    // `thread::panicking` reads a const-initialized thread local and an
    // atomic; it does not allocate.
    signo == libc::SIGABRT && crate::capture::panic_captured() && std::thread::panicking()
}

/// Build the signal record and write it to the report path.
///
/// Returns `false` if the report could not be persisted.
pub(crate) fn capture_from_signal(
    paths: &ReportPaths,
    signo: libc::c_int,
    fault: Option<usize>,
) -> bool {
    let (secs, millis) = now_utc();
    let record = build_record(signo, fault, current_thread_id(), secs, millis);
    let ok = record.is_complete() && write_report(paths, record.as_bytes());
    if !ok {
        write_stderr(WRITE_FAILED);
    }
    ok
}

/// Serialize a signal record as JSON into a fixed buffer.
pub(crate) fn build_record(
    signo: libc::c_int,
    fault: Option<usize>,
    thread: Option<u64>,
    secs: i64,
    millis: u32,
) -> FixedBuf<1024> {
    let mut error = FixedBuf::<64>::new();
    error.push(b"Signal: ");
    push_signal_name(&mut error, signo);

    let mut timestamp = FixedBuf::<32>::new();
    push_timestamp(&mut timestamp, secs, millis);

    let mut trace = FixedBuf::<256>::new();
    trace.push(b"Signal ");
    trace.push_dec(signo as u64, 1);
    trace.push(b" (");
    push_signal_name(&mut trace, signo);
    trace.push(b")");
    if let Some(addr) = fault {
        trace.push(b" at address ");
        trace.push_hex(addr);
    }
    if let Some(tid) = thread {
        trace.push(b" on thread ");
        trace.push_dec(tid, 1);
    }

    let mut out = FixedBuf::<1024>::new();
    out.push(b"{\"error\":");
    out.push_json_str(error.as_bytes());
    out.push(b",\"timestamp\":");
    out.push_json_str(timestamp.as_bytes());
    out.push(b",\"stackTrace\":");
    out.push_json_str(trace.as_bytes());
    out.push(b"}");

    if !(error.is_complete() && timestamp.is_complete() && trace.is_complete()) {
        out.overflowed = true;
    }
    out
}

/// Fixed name of a fatal signal.
pub(crate) fn signal_name(signo: libc::c_int) -> Option<&'static str> {
    match signo {
        libc::SIGABRT => Some("SIGABRT"),
        libc::SIGILL => Some("SIGILL"),
        libc::SIGSEGV => Some("SIGSEGV"),
        libc::SIGFPE => Some("SIGFPE"),
        libc::SIGBUS => Some("SIGBUS"),
        _ => None,
    }
}

fn push_signal_name<const N: usize>(buf: &mut FixedBuf<N>, signo: libc::c_int) {
    match signal_name(signo) {
        Some(name) => buf.push(name.as_bytes()),
        None => buf.push_dec(signo as u64, 1),
    }
}

fn fault_address(signo: libc::c_int, info: *mut libc::siginfo_t) -> Option<usize> {
    if info.is_null() || signo == libc::SIGABRT {
        return None;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
        Some(unsafe { (*info).si_addr() } as usize)
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        // SAFETY: as above.
        Some(unsafe { (*info).si_addr } as usize)
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    {
        None
    }
}

fn current_thread_id() -> Option<u64> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: gettid has no preconditions.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        u64::try_from(tid).ok()
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

/// Wall clock as (seconds since the epoch, milliseconds).
fn now_utc() -> (i64, u32) {
    // SAFETY: clock_gettime is async-signal-safe and writes only `ts`.
    unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        if libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) != 0 {
            return (0, 0);
        }
        (ts.tv_sec as i64, (ts.tv_nsec / 1_000_000) as u32)
    }
}

/// Render `YYYY-MM-DDTHH:MM:SS.mmmZ`.
fn push_timestamp<const N: usize>(buf: &mut FixedBuf<N>, secs: i64, millis: u32) {
    let days = secs.div_euclid(86_400);
    let time = secs.rem_euclid(86_400) as u64;
    let (year, month, day) = civil_from_days(days);

    if year < 0 {
        buf.push(b"-");
    }
    buf.push_dec(year.unsigned_abs(), 4);
    buf.push(b"-");
    buf.push_dec(u64::from(month), 2);
    buf.push(b"-");
    buf.push_dec(u64::from(day), 2);
    buf.push(b"T");
    buf.push_dec(time / 3600, 2);
    buf.push(b":");
    buf.push_dec(time % 3600 / 60, 2);
    buf.push(b":");
    buf.push_dec(time % 60, 2);
    buf.push(b".");
    buf.push_dec(u64::from(millis.min(999)), 3);
    buf.push(b"Z");
}

/// Convert days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month as u32, day as u32)
}

/// Write `bytes` to the scratch path, sync it, and rename it over the report.
fn write_report(paths: &ReportPaths, bytes: &[u8]) -> bool {
    // SAFETY: the paths are NUL-terminated and outlive the calls; the buffer
    // pointer and length come from a live slice.
    unsafe {
        let fd = libc::open(
            paths.scratch.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o600 as libc::c_uint,
        );
        if fd < 0 {
            return false;
        }

        let mut written = 0;
        while written < bytes.len() {
            let n = libc::write(
                fd,
                bytes[written..].as_ptr().cast(),
                bytes.len() - written,
            );
            if n < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                libc::close(fd);
                libc::unlink(paths.scratch.as_ptr());
                return false;
            }
            written += n as usize;
        }

        libc::fsync(fd);
        libc::close(fd);
        libc::rename(paths.scratch.as_ptr(), paths.report.as_ptr()) == 0
    }
}

fn write_stderr(msg: &[u8]) {
    // SAFETY: write(2) on a live slice.
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

/// Invoke whatever handler was installed for `signo` before ours.
///
/// # Safety
///
/// Must only be called from a signal handler for `signo`, with the `info` and
/// `context` the kernel delivered.
unsafe fn chain_previous(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let Some(index) = FATAL_SIGNALS.iter().position(|&s| s == signo) else {
        return;
    };
    let previous = PREVIOUS[index].load(Ordering::SeqCst);
    if previous.is_null() {
        return;
    }

    // SAFETY: non-null entries point at leaked, never-freed `sigaction`s.
    let previous = unsafe { &*previous };
    let handler = previous.sa_sigaction;
    if !is_real_handler(handler) {
        return;
    }

    // SAFETY: the previous owner registered `handler` with these flags, so it
    // has the matching signature.
    unsafe {
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(handler);
            f(signo, info, context);
        } else {
            let f: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
            f(signo);
        }
    }
}

/// Restore the default action and re-raise, so the process dies with the
/// original signal.
fn terminate(signo: libc::c_int) -> ! {
    // SAFETY: plain syscalls on stack-allocated arguments.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, ptr::null_mut());

        let mut unblock: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut unblock);
        libc::sigaddset(&mut unblock, signo);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &unblock, ptr::null_mut());

        libc::raise(signo);
        libc::_exit(128 + signo)
    }
}

/// A byte buffer with fixed capacity that never allocates.
///
/// Writes past the end are dropped and remembered, so a caller can refuse to
/// persist a truncated record.
pub(crate) struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
    overflowed: bool,
}

impl<const N: usize> FixedBuf<N> {
    pub(crate) const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
            overflowed: false,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// `false` if anything was dropped.
    pub(crate) fn is_complete(&self) -> bool {
        !self.overflowed
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        let room = N - self.len;
        let n = data.len().min(room);
        self.bytes[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        if n < data.len() {
            self.overflowed = true;
        }
    }

    fn push_byte(&mut self, b: u8) {
        self.push(&[b]);
    }

    /// Decimal, left-padded with zeros to `width`.
    pub(crate) fn push_dec(&mut self, mut value: u64, width: usize) {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        for _ in (digits.len() - i)..width {
            self.push_byte(b'0');
        }
        self.push(&digits[i..]);
    }

    pub(crate) fn push_hex(&mut self, value: usize) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut digits = [0u8; 2 * size_of::<usize>()];
        let mut i = digits.len();
        let mut v = value;
        loop {
            i -= 1;
            digits[i] = HEX[v & 0xf];
            v >>= 4;
            if v == 0 {
                break;
            }
        }
        self.push(b"0x");
        self.push(&digits[i..]);
    }

    /// Quoted JSON string with the mandatory escapes.
    pub(crate) fn push_json_str(&mut self, s: &[u8]) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        self.push_byte(b'"');
        for &b in s {
            match b {
                b'"' => self.push(b"\\\""),
                b'\\' => self.push(b"\\\\"),
                b'\n' => self.push(b"\\n"),
                b'\r' => self.push(b"\\r"),
                b'\t' => self.push(b"\\t"),
                0x00..=0x1f => {
                    self.push(b"\\u00");
                    self.push_byte(HEX[(b >> 4) as usize]);
                    self.push_byte(HEX[(b & 0xf) as usize]);
                }
                _ => self.push_byte(b),
            }
        }
        self.push_byte(b'"');
    }
}
