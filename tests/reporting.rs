//! Reporter behavior: aggregation, checkpointing, CRT filtering and hooks.

use std::sync::{Arc, Mutex};

use leakscope::{
    CaptureFrame, CrtFlavor, Detector, DetectorBuilder, FixedStackProvider, Options,
    ReportFlags, Settings,
};

const HEAP: usize = 0x10;

fn quiet_settings() -> Settings {
    let mut settings = Settings::default();
    settings.report = ReportFlags::empty();
    settings
}

fn collect_lines(detector: &Detector) -> Arc<Mutex<Vec<String>>> {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    detector.install_line_hook(move |line| sink.lock().unwrap().push(line.to_string()));
    lines
}

fn observe_alloc(detector: &Detector, heap: usize, address: usize, size: usize) {
    let guard = detector.enter_capture(CaptureFrame::default(), CrtFlavor::None);
    if detector.enabled() {
        guard.set(heap, address, 0, size);
    }
}

#[test]
fn test_aggregation_folds_identical_leaks() {
    let mut settings = quiet_settings();
    settings.flags |= Options::AGGREGATE_DUPLICATES;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000]))
        .build();
    let lines = collect_lines(&detector);

    for index in 0..3 {
        observe_alloc(&detector, HEAP, 0x1000 + index * 0x100, 64);
    }

    let reported = detector.report_leaks();
    assert_eq!(reported, 3);

    let lines = lines.lock().unwrap();
    let blocks: Vec<_> = lines
        .iter()
        .filter(|line| line.starts_with("---------- Block"))
        .collect();
    assert_eq!(blocks.len(), 1);
    assert!(lines
        .iter()
        .any(|line| line.contains("Count: 3") && line.contains("Total 192 bytes")));
}

#[test]
fn test_aggregation_disabled_reports_each_entry() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000]))
        .build();
    let lines = collect_lines(&detector);

    for index in 0..3 {
        observe_alloc(&detector, HEAP, 0x1000 + index * 0x100, 64);
    }

    assert_eq!(detector.report_leaks(), 3);
    let lines = lines.lock().unwrap();
    let blocks: Vec<_> = lines
        .iter()
        .filter(|line| line.starts_with("---------- Block"))
        .collect();
    assert_eq!(blocks.len(), 3);
}

#[test]
fn test_aggregation_distinguishes_stacks_and_sizes() {
    let mut settings = quiet_settings();
    settings.flags |= Options::AGGREGATE_DUPLICATES;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::cycling(vec![
            vec![0x1000, 0x2000],
            vec![0x1000, 0x2000],
            vec![0x9000],
        ]))
        .build();
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 64); // stack A
    observe_alloc(&detector, HEAP, 0x2000, 64); // stack A (duplicate)
    observe_alloc(&detector, HEAP, 0x3000, 64); // stack B

    assert_eq!(detector.report_leaks(), 3);
    let lines = lines.lock().unwrap();
    let blocks: Vec<_> = lines
        .iter()
        .filter(|line| line.starts_with("---------- Block"))
        .collect();
    assert_eq!(blocks.len(), 2);
}

#[test]
fn test_counting_never_aggregates() {
    let mut settings = quiet_settings();
    settings.flags |= Options::AGGREGATE_DUPLICATES;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);
    observe_alloc(&detector, HEAP, 0x2000, 64);
    assert_eq!(detector.leaks_count(), 2);
}

#[test]
fn test_reporting_is_repeatable() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);
    assert_eq!(detector.report_leaks(), 1);
    // Reporting alone never marks blocks; a second pass sees them again.
    assert_eq!(detector.report_leaks(), 1);
}

#[test]
fn test_mark_all_then_report_is_empty() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.mark_all_leaks_reported();
    assert_eq!(detector.report_leaks(), 0);
    assert_eq!(detector.leaks_count(), 0);

    // A genuine new allocation after the checkpoint is still reported.
    observe_alloc(&detector, HEAP, 0x2000, 32);
    assert_eq!(detector.report_leaks(), 1);
}

#[test]
fn test_thread_scoped_queries() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);

    let own = detector
        .ledger()
        .find_block(0x1000)
        .unwrap()
        .thread_id;
    assert_eq!(detector.thread_leaks_count(own), 1);
    assert_eq!(detector.thread_leaks_count(own + 1), 0);
    assert_eq!(detector.report_thread_leaks(own + 1), 0);
    assert_eq!(detector.report_thread_leaks(own), 1);

    detector.mark_thread_leaks_reported(own);
    assert_eq!(detector.thread_leaks_count(own), 0);
}

#[test]
fn test_skip_crt_startup_leaks() {
    let mut settings = quiet_settings();
    settings.flags |= Options::SKIP_CRT_STARTUP_LEAKS;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000]).classified_as_crt_startup())
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);

    assert_eq!(detector.leaks_count(), 0);
    assert_eq!(detector.report_leaks(), 0);
    // Still excluded on a second pass: the block is marked reported, not
    // merely folded away by aggregation bookkeeping.
    assert_eq!(detector.report_leaks(), 0);
}

#[test]
fn test_leak_hook_receives_raw_fields() {
    let records = Arc::new(Mutex::new(Vec::new()));
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000]))
        .build();
    {
        let records = Arc::clone(&records);
        detector.install_leak_hook(move |leak| {
            records
                .lock()
                .unwrap()
                .push((leak.address, leak.size, leak.count));
        });
    }

    observe_alloc(&detector, HEAP, 0x1234, 64);
    detector.report_leaks();

    let records = records.lock().unwrap();
    assert_eq!(records.as_slice(), &[(0x1234, 64, 1)]);
}

#[test]
fn test_remove_hook_stops_delivery() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .build();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let id = {
        let sink = Arc::clone(&lines);
        detector.install_line_hook(move |line| sink.lock().unwrap().push(line.to_string()))
    };

    observe_alloc(&detector, HEAP, 0x1000, 64);
    detector.report_leaks();
    assert!(!lines.lock().unwrap().is_empty());

    assert!(detector.remove_hook(id));
    lines.lock().unwrap().clear();
    detector.report_leaks();
    assert!(lines.lock().unwrap().is_empty());
    assert!(!detector.remove_hook(id));
}

#[test]
fn test_resolve_callstacks_pre_resolves() {
    let detector = DetectorBuilder::new(quiet_settings())
        .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000]))
        .build();

    observe_alloc(&detector, HEAP, 0x1000, 64);
    assert_eq!(detector.resolve_callstacks(), 0);

    let summary = detector.ledger().find_block(0x1000).unwrap();
    assert!(summary.call_stack.unwrap().is_resolved());
}

#[test]
fn test_data_dump_uses_block_reader() {
    let mut settings = quiet_settings();
    settings.max_data_dump = 8;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .block_reader(|address, len| {
            (address == 0x1000).then(|| b"LEAKDATA".to_vec()).map(|mut data| {
                data.truncate(len);
                data
            })
        })
        .build();
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 8);
    detector.report_leaks();

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|line| line.contains("Data:")));
    assert!(lines.iter().any(|line| line.contains("LEAKDATA")));
}

#[test]
fn test_suppressed_data_dump() {
    let mut settings = quiet_settings();
    settings.max_data_dump = 0;
    let detector = DetectorBuilder::new(settings)
        .stack_provider(FixedStackProvider::new(vec![0x1000]))
        .block_reader(|_, len| Some(vec![0xAA; len]))
        .build();
    let lines = collect_lines(&detector);

    observe_alloc(&detector, HEAP, 0x1000, 8);
    detector.report_leaks();
    assert!(!lines.lock().unwrap().iter().any(|line| line.contains("Data:")));
}

#[test]
fn test_leak_hash_is_stable_across_runs() {
    let hashes: Vec<u32> = (0..2)
        .map(|_| {
            let detector = DetectorBuilder::new(quiet_settings())
                .stack_provider(FixedStackProvider::new(vec![0x1000, 0x2000]))
                .build();
            let seen = Arc::new(Mutex::new(0u32));
            {
                let seen = Arc::clone(&seen);
                detector.install_leak_hook(move |leak| {
                    *seen.lock().unwrap() = leak.leak_hash;
                });
            }
            observe_alloc(&detector, HEAP, 0x1000, 64);
            detector.report_leaks();
            let hash = *seen.lock().unwrap();
            hash
        })
        .collect();

    assert_ne!(hashes[0], 0);
    assert_eq!(hashes[0], hashes[1]);
}
