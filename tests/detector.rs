//! End-to-end detector behavior: the capture protocol feeding the ledger,
//! enablement control, and teardown.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use leakscope::{
    CaptureFrame, CrtFlavor, DetectorBuilder, Detector, FixedModuleEnumerator,
    FixedStackProvider, ModuleRecord, Options, ReportFlags, Settings,
};

const HEAP: usize = 0x10;

fn quiet_settings() -> Settings {
    let mut settings = Settings::default();
    settings.report = ReportFlags::empty();
    settings
}

fn build(settings: Settings) -> Arc<Detector> {
    DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000, 0x3000]))
        .build()
}

fn collect_lines(detector: &Detector) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    detector.install_line_hook(move |line| sink.lock().unwrap().push(line.to_string()));
    lines
}

/// Simulates one intercepted allocation the way a hook trampoline would.
fn observe_alloc(detector: &Detector, heap: usize, address: usize, size: usize) {
    let guard = detector.enter_capture(CaptureFrame::default(), CrtFlavor::None);
    if detector.enabled() {
        guard.set(heap, address, 0, size);
    }
}

#[test]
fn test_tracked_allocation_becomes_leak() {
    let detector = build(quiet_settings());
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 64);
    assert_eq!(detector.leaks_count(), 1);
    assert_eq!(detector.ledger().current_bytes(), 64);

    let reported = detector.report_leaks();
    assert_eq!(reported, 1);
    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|line| line.contains("64 bytes")));
    assert!(lines.iter().any(|line| line.contains("Call Stack (TID")));
}

#[test]
fn test_address_reuse_keeps_single_entry() {
    let detector = build(quiet_settings());

    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.free_observed(HEAP, 0x1000, CaptureFrame::default());
    observe_alloc(&detector, HEAP, 0x1000, 128);

    assert_eq!(detector.ledger().block_count(), 1);
    assert_eq!(detector.ledger().current_bytes(), 128);
    let summary = detector.ledger().find_block(0x1000).unwrap();
    assert_eq!(summary.size, 128);
}

#[test]
fn test_disabled_thread_is_never_tracked() {
    let detector = build(quiet_settings());

    detector.disable_current_thread();
    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.enable_current_thread();

    assert_eq!(detector.leaks_count(), 0);
    assert!(detector.ledger().find_block(0x1000).is_none());

    // Once re-enabled the next allocation is tracked again.
    observe_alloc(&detector, HEAP, 0x2000, 32);
    assert_eq!(detector.leaks_count(), 1);
}

#[test]
fn test_restore_thread_state() {
    let detector = build(quiet_settings());

    detector.disable_current_thread();
    detector.enable_current_thread();
    observe_alloc(&detector, HEAP, 0x1000, 16);
    assert_eq!(detector.leaks_count(), 1);

    // Restore puts back the state saved by the last explicit change.
    detector.restore_thread_state();
    observe_alloc(&detector, HEAP, 0x2000, 16);
    assert_eq!(detector.leaks_count(), 1);
}

#[test]
fn test_start_disabled_default_applies_to_new_threads() {
    let mut settings = quiet_settings();
    settings.flags |= Options::START_DISABLED;
    let detector = build(settings);

    observe_alloc(&detector, HEAP, 0x1000, 64);
    assert_eq!(detector.leaks_count(), 0);

    detector.enable_all();
    observe_alloc(&detector, HEAP, 0x2000, 64);
    assert_eq!(detector.leaks_count(), 1);
}

#[test]
fn test_in_place_realloc_preserves_serial() {
    let detector = build(quiet_settings());

    observe_alloc(&detector, HEAP, 0x1000, 64);
    let before = detector.ledger().find_block(0x1000).unwrap();

    // A reallocation returning the same address updates the record in place.
    let guard = detector.enter_capture(CaptureFrame::default(), CrtFlavor::None);
    if detector.enabled() {
        guard.set(HEAP, 0x1000, 0x1000, 96);
    }
    drop(guard);

    let after = detector.ledger().find_block(0x1000).unwrap();
    assert_eq!(after.serial, before.serial);
    assert_eq!(after.size, 96);
    assert_eq!(detector.ledger().current_bytes(), 96);
    // The reallocation's own stack was captured and re-attached.
    assert!(after.call_stack.is_some());
}

#[test]
fn test_moving_realloc_rekeys_block() {
    let detector = build(quiet_settings());

    observe_alloc(&detector, HEAP, 0x1000, 64);
    let guard = detector.enter_capture(CaptureFrame::default(), CrtFlavor::None);
    if detector.enabled() {
        guard.set(HEAP, 0x1000, 0x4000, 80);
    }
    drop(guard);

    assert!(detector.ledger().find_block(0x1000).is_none());
    assert_eq!(detector.ledger().find_block(0x4000).unwrap().size, 80);
    assert_eq!(detector.ledger().current_bytes(), 80);
}

#[test]
fn test_nested_capture_commits_once() {
    let detector = build(quiet_settings());

    let outer = detector.enter_capture(
        CaptureFrame {
            frame_pointer: 0xAAAA,
            entry: 0x1,
        },
        CrtFlavor::Universal,
    );
    {
        // A nested interception observes the real heap operation.
        let inner = detector.enter_capture(CaptureFrame::default(), CrtFlavor::None);
        assert!(!inner.is_outermost());
        inner.set(HEAP, 0x5000, 0, 48);
    }
    assert!(outer.is_outermost());
    drop(outer);

    assert_eq!(detector.ledger().block_count(), 1);
    let summary = detector.ledger().find_block(0x5000).unwrap();
    assert_eq!(summary.size, 48);
}

#[test]
fn test_excluded_module_allocations_are_skipped() {
    let module_base = 0x7000_0000;
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .module_enumerator(FixedModuleEnumerator::new(vec![ModuleRecord {
            path: PathBuf::from("C:/app/plugin.dll"),
            base: module_base,
            size: 0x1_0000,
        }]))
        .build();
    detector.disable_module(module_base);

    // Allocation originating inside the excluded module's range.
    let guard = detector.enter_capture(
        CaptureFrame {
            frame_pointer: module_base + 0x10,
            entry: 0x1,
        },
        CrtFlavor::None,
    );
    if detector.enabled() {
        guard.set(HEAP, 0x1000, 0, 64);
    }
    drop(guard);
    assert_eq!(detector.leaks_count(), 0);

    // Re-enabling the module includes later allocations again.
    detector.enable_module(module_base);
    let guard = detector.enter_capture(
        CaptureFrame {
            frame_pointer: module_base + 0x10,
            entry: 0x1,
        },
        CrtFlavor::None,
    );
    if detector.enabled() {
        guard.set(HEAP, 0x2000, 0, 64);
    }
    drop(guard);
    assert_eq!(detector.leaks_count(), 1);
}

#[test]
fn test_forced_module_list_excludes_by_name() {
    let records = vec![
        ModuleRecord {
            path: PathBuf::from("C:/app/host.exe"),
            base: 0x40_0000,
            size: 0x1_0000,
        },
        ModuleRecord {
            path: PathBuf::from("C:/app/noisy.dll"),
            base: 0x50_0000,
            size: 0x1_0000,
        },
    ];
    let mut settings = quiet_settings();
    settings.forced_modules = vec!["noisy.dll".into()];
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .module_enumerator(FixedModuleEnumerator::new(records))
        .build();

    assert!(detector.modules().is_excluded(0x50_0001));
    assert!(!detector.modules().is_excluded(0x40_0001));
}

#[test]
fn test_duplicate_heap_evicts_and_warns() {
    let detector = build(quiet_settings());
    let lines = collect_lines(&detector);

    detector.heap_created(HEAP);
    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.heap_created(HEAP);

    assert_eq!(detector.ledger().block_count(), 0);
    assert_eq!(detector.ledger().current_bytes(), 0);
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("duplicate heap")));
}

#[test]
fn test_heap_destroy_reports_contained_leaks() {
    let detector = build(quiet_settings());
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.heap_destroyed(HEAP);

    assert_eq!(detector.ledger().heap_count(), 0);
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("destroyed heap")));
}

#[test]
fn test_heap_destroy_skip_option_suppresses_report() {
    let mut settings = quiet_settings();
    settings.flags |= Options::SKIP_HEAP_FREE_LEAKS;
    let detector = build(settings);
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.heap_destroyed(HEAP);

    assert_eq!(detector.ledger().heap_count(), 0);
    assert!(!lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("destroyed heap")));
}

#[test]
fn test_cross_heap_free_diagnostic() {
    let mut settings = quiet_settings();
    settings.flags |= Options::VALIDATE_HEAP_FREE;
    let detector = build(settings);
    let lines = collect_lines(&detector);

    observe_alloc(&detector, 0xA, 0x1000, 64);
    detector.free_observed(0xB, 0x1000, CaptureFrame::default());

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|line| line.contains("CRITICAL ERROR")));
    assert!(lines
        .iter()
        .any(|line| line.contains("Allocated on heap 0xa")));
}

#[test]
fn test_untracked_free_is_silent() {
    let detector = build(quiet_settings());
    let lines = collect_lines(&detector);
    detector.free_observed(HEAP, 0x9999, CaptureFrame::default());
    assert!(lines.lock().unwrap().is_empty());
}

#[test]
fn test_self_test_passes_at_shutdown() {
    let mut settings = quiet_settings();
    settings.flags |= Options::SELF_TEST;
    let detector = build(settings);
    let lines = collect_lines(&detector);

    let reported = detector.shutdown();
    assert!(reported >= 1);
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("passed the memory leak self-test")));
}

#[test]
fn test_shutdown_summarizes_and_tears_down() {
    let detector = build(quiet_settings());
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 64);
    let leaks = detector.shutdown();

    assert_eq!(leaks, 1);
    assert_eq!(detector.ledger().block_count(), 0);
    let lines = lines.lock().unwrap();
    assert!(lines
        .iter()
        .any(|line| line.contains("detected 1 memory leak")));
    assert!(lines.iter().any(|line| line.contains("now exiting")));
}

#[test]
fn test_shutdown_without_enablement_warns() {
    let mut settings = quiet_settings();
    settings.flags |= Options::START_DISABLED;
    let detector = build(settings);
    let lines = collect_lines(&detector);

    detector.shutdown();
    assert!(lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("never enabled")));
}

#[test]
fn test_options_round_trip() {
    let detector = build(quiet_settings());
    detector.set_options(
        Options::AGGREGATE_DUPLICATES | Options::VALIDATE_HEAP_FREE,
        128,
        32,
    );
    assert_eq!(
        detector.options(),
        Options::AGGREGATE_DUPLICATES | Options::VALIDATE_HEAP_FREE
    );

    // A zero frame limit falls back to the default.
    detector.set_options(Options::empty(), 0, 0);
    assert!(detector.options().is_empty());
}

#[test]
fn test_modules_list_round_trip() {
    let detector = build(quiet_settings());
    detector.set_modules_list(vec!["Plugin.DLL".into(), "other.dll".into()], true);
    let (list, include) = detector.modules_list();
    assert_eq!(list, vec!["plugin.dll".to_string(), "other.dll".to_string()]);
    assert!(include);
}
