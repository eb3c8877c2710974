use super::*;

fn close_to(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn sample_matches_ntp_formula() {
    // Remote clock 5s ahead, 0.1s each way, 0.2s processing.
    let (offset, latency) = sample(100.0, 105.1, 105.3, 100.4);
    assert!(close_to(offset, 5.0));
    assert!(close_to(latency, 0.1));
}

#[test]
fn two_samples_average_exactly() {
    let clock = ClockSync::new();
    clock.start(100.0);

    // offset 4.0, latency 0.5
    let first = clock.record(104.5, 104.5, 101.0);
    assert!(close_to(first.offset, 4.0));
    assert!(close_to(first.latency, 0.5));
    assert_eq!(first.count, 1);

    // offset 2.0, latency 1.5 (same client_sent, later reply)
    let second = clock.record(103.5, 103.5, 103.0);
    assert!(close_to(second.offset, (4.0 + 2.0) / 2.0));
    assert!(close_to(second.latency, (0.5 + 1.5) / 2.0));
    assert_eq!(second.count, 2);
    assert_eq!(clock.snapshot(), second);
}

#[test]
fn start_resets_running_means() {
    let clock = ClockSync::new();
    clock.start(100.0);
    clock.record(104.5, 104.5, 101.0);
    clock.start(200.0);
    assert_eq!(clock.snapshot(), ClockSnapshot::default());
}

#[test]
fn observe_accepts_float_pair() {
    let clock = ClockSync::new();
    clock.start(now_secs());
    let now = now_secs();
    let snapshot = clock
        .observe(&Value::Array(vec![Value::F64(now), Value::F64(now)]))
        .expect("valid payload");
    assert_eq!(snapshot.count, 1);
    assert!(snapshot.offset.abs() < 5.0);
}

#[test]
fn observe_accepts_integer_seconds() {
    let clock = ClockSync::new();
    clock.start(0.0);
    let snapshot = clock
        .observe(&Value::Array(vec![Value::from(10), Value::from(10)]))
        .expect("integer payload");
    assert_eq!(snapshot.count, 1);
}

#[test]
fn observe_rejects_malformed_payload() {
    let clock = ClockSync::new();
    let err = clock.observe(&Value::from("now")).expect_err("string payload");
    assert!(matches!(err, DuctError::Protocol(_)));
    let err = clock
        .observe(&Value::Array(vec![Value::F64(1.0)]))
        .expect_err("short payload");
    assert!(matches!(err, DuctError::Protocol(_)));
    assert_eq!(clock.snapshot().count, 0);
}
