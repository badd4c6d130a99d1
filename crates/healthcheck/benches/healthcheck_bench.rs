use chrono::Utc;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use healthcheck::{
    prober::{Prober, TcpProber},
    stats,
    types::{HealthCheckResult, ProbeOutcome},
};
use rulestore::Rule;
use std::collections::HashMap;
use std::hint::black_box;
use std::time::Duration;

fn rule(i: usize) -> Rule {
    Rule {
        id: i.to_string(),
        path: format!("/svc{i}"),
        target_host: "127.0.0.1".to_string(),
        target_port: 1,
        enabled: true,
        health_check_path: None,
        description: None,
        created_at: None,
        updated_at: None,
    }
}

fn tcp_probe_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcp_probe");

    // Nothing listens on port 1 (measures failure path)
    let prober = TcpProber::new();

    group.bench_function("tcp_connection_refused", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| {
            rt.block_on(async {
                black_box(prober.probe("127.0.0.1", 1, Duration::from_millis(100)).await)
            })
        });
    });

    group.finish();
}

fn statistics_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("statistics");

    for size in [10usize, 100, 1000] {
        let rules: Vec<Rule> = (0..size).map(rule).collect();
        let now = Utc::now();
        let results: HashMap<String, HealthCheckResult> = rules
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let outcome = if i % 3 == 0 {
                    ProbeOutcome::Unreachable("connection refused".to_string())
                } else {
                    ProbeOutcome::Reachable(Duration::from_micros(i as u64 * 10))
                };
                (r.id.clone(), HealthCheckResult::from_probe(r, outcome, now))
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("summarize", size), &size, |b, _| {
            b.iter(|| black_box(stats::summarize(&rules, &results)));
        });

        group.bench_with_input(BenchmarkId::new("monitor_report", size), &size, |b, _| {
            b.iter(|| black_box(stats::monitor_report(&rules, &results)));
        });
    }

    group.finish();
}

criterion_group!(benches, tcp_probe_benchmark, statistics_benchmark);
criterion_main!(benches);
