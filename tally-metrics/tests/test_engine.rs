use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use tally_metrics::{
    ChannelSink, CheckConfig, Dialect, Engine, EngineConfig, GaugeOp, HistogramBlockConfig,
    MatchConfig, MetricKind, SynthConfig, VecSink, update_adder,
};
use tally_test::sorted_lines;

const TS: u64 = 1_700_000_000_000;

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.self_stats.enable = false;
    config
}

fn engine(config: &EngineConfig) -> (Engine, VecSink) {
    tally_test::setup();
    let sink = VecSink::new();
    let engine = Engine::new(config, Arc::new(sink.clone())).unwrap();
    (engine, sink)
}

fn synth(target: &str, operation: &str, sources: &[&str], factor: f64) -> SynthConfig {
    SynthConfig {
        target: target.to_owned(),
        source: sources.iter().map(|s| (*s).to_owned()).collect(),
        operation: operation.to_owned(),
        factor,
        ..Default::default()
    }
}

#[test]
fn test_adder_reports_and_resets() {
    let (mut engine, sink) = engine(&config());
    let record = engine.get_or_create(MetricKind::Adder, "svc.requests");
    for _ in 0..5 {
        update_adder(&record, 1.0).unwrap();
    }

    engine.tick(TS);
    assert_eq!(sink.take_text(), "svc.requests 5.000000\n");

    engine.tick(TS + 10_000);
    assert_eq!(sink.take_text(), "svc.requests 0.000000\n");
}

#[test]
fn test_gauge_keeps_value() {
    let (mut engine, sink) = engine(&config());
    let ingester = engine.ingester();
    ingester.ingest_lines("load:10|g\nload:+5|g\nload:-3|g\nfresh:-5|g\n");

    engine.tick(TS);
    similar_asserts::assert_eq!(
        sorted_lines(&sink.take_text()),
        vec!["fresh -5.000000", "load 12.000000"]
    );

    engine.tick(TS + 10_000);
    similar_asserts::assert_eq!(
        sorted_lines(&sink.take_text()),
        vec!["fresh -5.000000", "load 12.000000"]
    );
}

#[test]
fn test_stats_summary() {
    let (mut engine, sink) = engine(&config());
    for value in (1..=10).rev() {
        engine
            .ingest(MetricKind::Stats, "api.latency", value as f64, GaugeOp::Set)
            .unwrap();
    }

    engine.tick(TS);
    insta::assert_snapshot!(sink.take_text(), @r"
    stats.timers.api.latency.count 10.000000
    stats.timers.api.latency.sum 55.000000
    stats.timers.api.latency.mean 5.500000
    stats.timers.api.latency.upper 10.000000
    stats.timers.api.latency.lower 1.000000
    stats.timers.api.latency.median 5.000000
    stats.timers.api.latency.spread 9.000000
    stats.timers.api.latency.upper_90 9.000000
    stats.timers.api.latency.upper_99 9.000000
    ");

    // Idle timers are not reported.
    engine.tick(TS + 10_000);
    assert_eq!(sink.take_text(), "");
}

#[test]
fn test_stats_moments_and_mode() {
    let mut config = config();
    config.stats.thresholds = "10".to_owned();
    let enabled = CheckConfig {
        enable: true,
        min_points: 4,
        matching: MatchConfig {
            fallback_match: true,
            ..Default::default()
        },
    };
    config.moments = enabled.clone();
    config.mode = enabled;
    let (mut engine, sink) = engine(&config);

    engine
        .ingester()
        .ingest_lines("t:2|ms\nt:4|ms\nt:4|ms\nt:4|ms\nt:5|ms\nt:5|ms\nt:7|ms\nt:9|ms\n");
    engine.tick(TS);

    let output = sink.take_text();
    let lines = sorted_lines(&output);
    assert!(lines.contains(&"stats.timers.t.lower_10 2.000000"));
    assert!(lines.contains(&"stats.timers.t.stddev 2.000000"));
    assert!(lines.contains(&"stats.timers.t.mode 4.000000"));
    assert!(lines.contains(&"stats.timers.t.mode_ct 3.000000"));
    assert!(lines.iter().any(|l| l.starts_with("stats.timers.t.skewness ")));
    assert!(lines.iter().any(|l| l.starts_with("stats.timers.t.kurtosis ")));
}

#[test]
fn test_large_stats_batch_uses_radix_sort() {
    let mut config = config();
    config.stats.qsort_threshold = 2_048;
    config.stats.thresholds = "50m,999m".to_owned();
    let (mut engine, sink) = engine(&config);

    let record = engine.get_or_create(MetricKind::Stats, "big");
    for i in (0..5_000).rev() {
        record.update(i as f64, GaugeOp::Set).unwrap();
    }
    engine.tick(TS);

    let output = sink.take_text();
    let lines = sorted_lines(&output);
    assert!(lines.contains(&"stats.timers.big.count 5000.000000"));
    assert!(lines.contains(&"stats.timers.big.lower 0.000000"));
    assert!(lines.contains(&"stats.timers.big.upper 4999.000000"));
    assert!(lines.contains(&"stats.timers.big.median 2499.000000"));
    assert!(lines.contains(&"stats.timers.big.lower_050 249.000000"));
    assert!(lines.contains(&"stats.timers.big.upper_999 4994.000000"));
}

#[test]
fn test_histogram_buckets() {
    let mut config = config();
    config.histograms = vec![HistogramBlockConfig {
        name: "latency".to_owned(),
        bounds: vec![10.0, 100.0],
        ..Default::default()
    }];
    let (mut engine, sink) = engine(&config);

    engine
        .ingester()
        .ingest_lines("rt:10|hg\nrt:5|hg\nrt:50|hg\nrt:1000|hg\n");
    engine.tick(TS);

    insta::assert_snapshot!(sink.take_text(), @r"
    stats.histograms.rt.0.bound 10.000000
    stats.histograms.rt.0.count 2.000000
    stats.histograms.rt.1.bound 100.000000
    stats.histograms.rt.1.count 1.000000
    stats.histograms.rt.inf.count 1.000000
    stats.histograms.rt.total 4.000000
    ");
}

#[test]
fn test_synthetic_sum() {
    let mut config = config();
    config.synths = vec![synth("total", "sum", &["a", "b", "c"], 2.0)];
    let (mut engine, sink) = engine(&config);

    for (path, value) in [("a", 2.0), ("b", 3.0), ("c", 4.0)] {
        engine
            .ingest(MetricKind::Adder, path, value, GaugeOp::Set)
            .unwrap();
    }
    engine.tick(TS);

    similar_asserts::assert_eq!(
        sorted_lines(&sink.take_text()),
        vec![
            "a 2.000000",
            "b 3.000000",
            "c 4.000000",
            "total 18.000000"
        ]
    );
}

#[test]
fn test_synthetic_mean_if_skips_absent_sources() {
    let mut config = config();
    config.synths = vec![synth("avg", "meanIf", &["x", "y", "z"], 1.0)];
    let (mut engine, sink) = engine(&config);

    // `y` exists but has no data this tick.
    engine.get_or_create(MetricKind::Adder, "y");
    engine.ingest(MetricKind::Adder, "x", 3.0, GaugeOp::Set).unwrap();
    engine.ingest(MetricKind::Adder, "z", 9.0, GaugeOp::Set).unwrap();
    engine.tick(TS);

    let output = sink.take_text();
    assert!(sorted_lines(&output).contains(&"avg 6.000000"));
}

#[test]
fn test_synthetic_negative_max_absent_uses_default() {
    let mut config = config();
    config.synths = vec![SynthConfig {
        max_absent: Some(-2),
        ..synth("t", "sum", &["a", "b", "c"], 1.0)
    }];
    let (mut engine, sink) = engine(&config);

    engine.get_or_create(MetricKind::Adder, "b");
    engine.get_or_create(MetricKind::Adder, "c");
    engine.ingest(MetricKind::Adder, "a", 5.0, GaugeOp::Set).unwrap();
    engine.tick(TS);

    assert!(sorted_lines(&sink.take_text()).contains(&"t 5.000000"));
}

#[test]
fn test_synthetic_waits_for_missing_sources() {
    let mut config = config();
    config.synths = vec![synth("d", "diff", &["in", "out"], 1.0)];
    let (mut engine, sink) = engine(&config);

    engine.ingest(MetricKind::Adder, "in", 10.0, GaugeOp::Set).unwrap();
    engine.tick(TS);
    assert!(sorted_lines(&sink.take_text()).contains(&"d 0.000000"));

    engine.ingest(MetricKind::Adder, "in", 10.0, GaugeOp::Set).unwrap();
    engine.ingest(MetricKind::Adder, "out", 4.0, GaugeOp::Set).unwrap();
    engine.tick(TS + 10_000);
    assert!(sorted_lines(&sink.take_text()).contains(&"d 6.000000"));
}

#[test]
fn test_synthetic_sources_are_exempt_from_gc() {
    let mut config = config();
    config.gc.threshold = 1;
    config.synths = vec![synth("s", "sum", &["kept"], 1.0)];
    let (mut engine, _sink) = engine(&config);

    engine.ingest(MetricKind::Adder, "kept", 1.0, GaugeOp::Set).unwrap();
    engine.ingest(MetricKind::Adder, "dropped", 1.0, GaugeOp::Set).unwrap();
    for tick in 0..5 {
        engine.tick(TS + tick * 10_000);
    }

    assert!(engine.locate(MetricKind::Adder, "kept").is_some());
    assert!(engine.locate(MetricKind::Adder, "s").is_some());
    assert!(engine.locate(MetricKind::Adder, "dropped").is_none());
}

fn value_of(lines: &[&str], name: &str) -> f64 {
    lines
        .iter()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| panic!("{name} not emitted"))
}

#[test]
fn test_prediction_output() {
    let mut config = config();
    config.predict.enable = true;
    config.predict.size = 10;
    config.predict.matching.fallback_match = true;
    let (mut engine, sink) = engine(&config);

    // A perfect line rising by 2 per tick.
    for tick in 0..12u64 {
        engine
            .ingest(MetricKind::Adder, "p", 2.0 * tick as f64 + 2.0, GaugeOp::Set)
            .unwrap();
        engine.tick(TS + tick * 10_000);
        let output = sink.take_text();
        let lines = sorted_lines(&output);

        assert!(!lines.iter().any(|l| l.starts_with("p ")));
        assert_eq!(value_of(&lines, "p.input"), 2.0 * tick as f64 + 2.0);
        if tick < 9 {
            assert_eq!(lines.len(), 1, "{lines:?}");
            continue;
        }

        assert!((value_of(&lines, "p.fit") - 1.0).abs() < 1e-6);
        assert!((value_of(&lines, "p.lr_b") - 0.2).abs() < 1e-6);
        assert!((value_of(&lines, "p.predict") - (2.0 * tick as f64 + 4.0)).abs() < 1e-3);
        if tick > 9 {
            assert!(value_of(&lines, "p.diff").abs() < 1e-3);
        }
    }
}

#[test]
fn test_removed_record_stops_reporting() {
    let (mut engine, sink) = engine(&config());
    engine.ingest(MetricKind::Adder, "gone", 1.0, GaugeOp::Set).unwrap();
    let record = engine.remove(MetricKind::Adder, "gone").unwrap();

    assert!(!record.is_valid());
    engine.tick(TS);
    assert_eq!(sink.take_text(), "");

    // A new record takes the path.
    engine.ingest(MetricKind::Adder, "gone", 2.0, GaugeOp::Set).unwrap();
    engine.tick(TS + 10_000);
    assert_eq!(sink.take_text(), "gone 2.000000\n");
}

#[test]
fn test_dialects() {
    for (dialect, expected) in [
        (Dialect::Ministry, "c 1.000000\n"),
        (Dialect::Graphite, "c 1.000000 1700000000\n"),
        (Dialect::Statsd, "c:1.000000|g\n"),
    ] {
        let mut config = config();
        config.dialect = dialect;
        let (mut engine, sink) = engine(&config);

        engine.ingest(MetricKind::Adder, "c", 1.0, GaugeOp::Set).unwrap();
        engine.tick(TS);
        assert_eq!(sink.take_text(), expected, "{dialect:?}");
    }
}

#[test]
fn test_self_stats() {
    let mut config = config();
    config.self_stats.enable = true;
    config.adder.threads = Some(1);
    config.gauge.enable = false;
    config.stats.base.enable = false;
    config.histo.enable = false;
    let (mut engine, sink) = engine(&config);

    engine.ingest(MetricKind::Adder, "a", 1.0, GaugeOp::Set).unwrap();
    engine.ingest(MetricKind::Adder, "a", 1.0, GaugeOp::Set).unwrap();
    engine.tick(TS);

    let output = sink.take_text();
    let lines = sorted_lines(&output);
    assert!(lines.contains(&"a 2.000000"));
    assert!(lines.contains(&"self.tally.adder.0.active 1.000000"));
    assert!(lines.contains(&"self.tally.adder.0.points 2.000000"));
    assert!(lines.contains(&"self.tally.adder.0.highest 2.000000"));
    assert!(lines.contains(&"self.tally.adder.0.predictions 0.000000"));
    assert!(lines.iter().any(|l| l.starts_with("self.tally.adder.0.usec ")));

    let stats = engine.worker_stats(MetricKind::Adder);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].points, 2);
}

fn receive_until(rx: &Receiver<Bytes>, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut output = String::new();

    while !output.contains(needle) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(buffer) => output.push_str(&String::from_utf8_lossy(&buffer)),
            Err(_) => panic!("{needle:?} not emitted, got:\n{output}"),
        }
    }

    output
}

#[test]
fn test_threaded_engine() {
    tally_test::setup();
    let mut config = config();
    config.period_ms = 50;
    config.synths = vec![synth("sum", "sum", &["a", "b"], 1.0)];

    let (tx, rx) = crossbeam_channel::unbounded();
    let engine = Engine::new(&config, Arc::new(ChannelSink::new(tx))).unwrap();
    engine.ingester().ingest_lines("a:1|c\nb:2|c\n");

    let handle = engine.start().unwrap();
    handle.ingester().ingest_lines("q:7|g\n");

    let output = receive_until(&rx, "sum 3.000000");
    assert!(output.contains("a 1.000000"));
    receive_until(&rx, "q 7.000000");

    let mut engine = handle.shutdown();
    assert_eq!(engine.synth_count(), 1);
    assert_eq!(engine.worker_stats(MetricKind::Stats).len(), 6);

    // The stopped engine can still be ticked by hand.
    engine.ingest(MetricKind::Adder, "a", 4.0, GaugeOp::Set).unwrap();
    engine.tick(TS);
    let output = receive_until(&rx, "sum 4.000000");
    assert!(output.contains("a 4.000000"));
}

#[test]
fn test_shutdown_while_ticks_overrun() {
    tally_test::setup();
    let mut config = config();
    config.period_ms = 1;
    config.synths = vec![synth("sum", "sum", &["a", "b"], 1.0)];

    // Output is never drained, so every tick keeps formatting into a growing channel.
    let (tx, _rx) = crossbeam_channel::unbounded();
    let engine = Engine::new(&config, Arc::new(ChannelSink::new(tx))).unwrap();
    let handle = engine.start().unwrap();

    let ingester = handle.ingester();
    let load = Instant::now() + Duration::from_millis(200);
    let mut i = 0u64;
    while Instant::now() < load {
        ingester.ingest_lines(&format!("a:1|c\nb:2|c\nt.{}:{i}|ms\n", i % 500));
        i += 1;
    }

    let started = Instant::now();
    let engine = handle.shutdown();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(5), "shutdown took {elapsed:?}");
    assert_eq!(engine.synth_count(), 1);
}
