use packet_engine::anomaly::{AnomalyKind, AnomalyReport, Severity};
use packet_engine::{AnalysisEngine, Report};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Ethernet/IPv4/UDP frame with a deliberately broken IHL field.
fn malformed_frame() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    bytes.extend_from_slice(&[0x00, 0x66, 0x77, 0x88, 0x99, 0x00]);
    bytes.extend_from_slice(&[0x08, 0x00]);
    bytes.push(0x42); // version 4, IHL 2
    bytes.resize(60, 0);
    bytes
}

fn legal_frame() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    bytes.extend_from_slice(&[0x00, 0x66, 0x77, 0x88, 0x99, 0x00]);
    bytes.extend_from_slice(&[0x08, 0x00]);
    bytes.push(0x45);
    bytes.push(0x00);
    bytes.extend_from_slice(&46u16.to_be_bytes());
    bytes.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00]);
    bytes.extend_from_slice(&[10, 0, 0, 1]);
    bytes.extend_from_slice(&[10, 0, 0, 2]);
    bytes.extend_from_slice(&9000u16.to_be_bytes());
    bytes.extend_from_slice(&9001u16.to_be_bytes());
    bytes.extend_from_slice(&26u16.to_be_bytes());
    bytes.extend_from_slice(&[0x00, 0x00]);
    bytes.resize(60, 0);
    bytes
}

#[test]
fn test_hooks_fire_once_per_report() {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();

    let mut engine = AnalysisEngine::builder()
        .on_anomaly(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    engine.analyze(&legal_frame(), 1);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    engine.analyze(&malformed_frame(), 2);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hook_sees_the_same_report_as_the_caller() {
    let captured: Arc<Mutex<Vec<AnomalyReport>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();

    let mut engine = AnalysisEngine::builder()
        .on_anomaly(move |report| {
            sink.lock().unwrap().push(report.clone());
        })
        .build()
        .unwrap();

    let returned = match engine.analyze(&malformed_frame(), 7) {
        Report::Packet(report) => report.anomalies,
        Report::ParseError { .. } => panic!("frame did not decode"),
    };

    let hooked = captured.lock().unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(hooked.len(), 1);
    assert_eq!(hooked[0].kind, AnomalyKind::MalformedPacket);
    assert_eq!(hooked[0].kind, returned[0].kind);
    assert_eq!(hooked[0].description, returned[0].description);
    assert_eq!(hooked[0].timestamp, 7);
    assert_eq!(hooked[0].severity, Severity::Medium);
}

#[test]
fn test_multiple_hooks_all_fire() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let c1 = first.clone();
    let c2 = second.clone();

    let mut engine = AnalysisEngine::builder()
        .on_anomaly(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        })
        .on_anomaly(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    engine.analyze(&malformed_frame(), 1);

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 10);
}

#[test]
fn test_hook_filtering_by_severity() {
    let high_or_worse = Arc::new(AtomicUsize::new(0));
    let counter = high_or_worse.clone();

    let mut engine = AnalysisEngine::builder()
        .on_anomaly(move |report| {
            if report.severity >= Severity::High {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    // A malformed packet is only Medium severity.
    engine.analyze(&malformed_frame(), 1);
    assert_eq!(high_or_worse.load(Ordering::SeqCst), 0);
}
