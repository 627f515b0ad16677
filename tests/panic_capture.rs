//! In-process panic capture.
//!
//! The panic hook is process-global, so every scenario lives in one test and
//! runs in sequence.

mod common;

use std::panic;
use std::sync::Mutex;

use flux_crash_handler::{CRASH_FILE_NAME, CrashConfig, get_last_crash, initialize_with};

/// Messages seen by the hook that was installed before ours.
static SEEN_BY_PREVIOUS: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Panic locations seen by the hook that was installed before ours.
static LOCATIONS_SEEN_BY_PREVIOUS: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn seen_by_previous() -> Vec<String> {
    SEEN_BY_PREVIOUS.lock().unwrap().clone()
}

fn last_location_seen_by_previous() -> String {
    LOCATIONS_SEEN_BY_PREVIOUS.lock().unwrap().last().cloned().unwrap_or_default()
}

fn panic_with<F: FnOnce() + panic::UnwindSafe>(f: F) {
    assert!(panic::catch_unwind(f).is_err());
}

fn dir_is_empty(dir: &std::path::Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[derive(Debug)]
struct Opaque;

#[test]
fn panic_capture_lifecycle() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    panic::set_hook(Box::new(|info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<opaque>".to_string());
        SEEN_BY_PREVIOUS.lock().unwrap().push(message);
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_default();
        LOCATIONS_SEEN_BY_PREVIOUS.lock().unwrap().push(location);
    }));

    initialize_with(CrashConfig::new(dir.path()));

    // Nothing has crashed yet: nothing to take, nothing touched.
    assert!(get_last_crash().is_none());
    assert!(dir_is_empty(dir.path()));

    // A panic with a message.
    panic_with(|| panic!("boom"));
    assert_eq!(seen_by_previous(), vec!["boom"]);
    assert!(dir.path().join(CRASH_FILE_NAME).is_file());

    let crash = get_last_crash().expect("report for boom");
    assert_eq!(crash.error(), "boom");
    assert!(crash.captured_at().is_ok(), "bad timestamp {:?}", crash.timestamp());
    assert!(!crash.stack_trace().is_empty());
    assert!(crash.stack_trace().contains("panic_capture"));

    // The previous hook got the same info our hook captured from.
    let location = last_location_seen_by_previous();
    assert!(location.contains("panic_capture.rs"), "{location}");
    assert!(
        crash.stack_trace().contains(&format!("Location: {location}\n")),
        "{location} not in {}",
        crash.stack_trace()
    );

    // Take is single delivery.
    assert!(get_last_crash().is_none());
    assert!(dir_is_empty(dir.path()));

    // A panic without a string payload still gets a description.
    panic_with(|| panic::panic_any(Opaque));
    let crash = get_last_crash().expect("report for opaque payload");
    assert!(!crash.error().is_empty());
    assert!(crash.error().starts_with("panicked at "), "{}", crash.error());
    assert!(crash.error().contains("panic_capture.rs"));
    assert_eq!(crash.error(), format!("panicked at {}", last_location_seen_by_previous()));

    // Two crashes before retrieval: the second wins.
    panic_with(|| panic!("first"));
    panic_with(|| panic!("second"));
    assert_eq!(get_last_crash().map(|c| c.error().to_string()), Some("second".to_string()));
    assert!(get_last_crash().is_none());

    // Installing again chains against our own hook without doubling up.
    initialize_with(CrashConfig::new(dir.path()));
    panic_with(|| panic!("again"));
    assert_eq!(
        seen_by_previous(),
        vec!["boom", "<opaque>", "first", "second", "again"]
    );
    assert_eq!(get_last_crash().map(|c| c.error().to_string()), Some("again".to_string()));

    // Detached: the previous hook still runs, nothing is stored.
    flux_crash_handler::detach();
    panic_with(|| panic!("detached"));
    assert_eq!(seen_by_previous().last().map(String::as_str), Some("detached"));
    assert!(get_last_crash().is_none());

    // A second install with another directory keeps the first one.
    let other = tempfile::tempdir().unwrap();
    initialize_with(CrashConfig::new(other.path()));
    panic_with(|| panic!("reattached"));
    assert!(dir_is_empty(other.path()));
    assert_eq!(get_last_crash().map(|c| c.error().to_string()), Some("reattached".to_string()));

    // A corrupt report reads as no report and is cleared.
    std::fs::write(dir.path().join(CRASH_FILE_NAME), b"{\"error\": \"half").unwrap();
    assert!(get_last_crash().is_none());
    assert!(dir_is_empty(dir.path()));

    // Handled errors can be reported without panicking.
    let err = std::io::Error::other("disk on fire");
    let crash = flux_crash_handler::report_error(&err).expect("attached");
    assert_eq!(crash.error(), "disk on fire");
    assert_eq!(get_last_crash(), Some(crash));

    assert_eq!(flux_crash_handler::registry().install_count(), 3);
}
