//! Benchmarks for host classification.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use nullroute::cache::CachedClassifier;
use nullroute::dns::{Classifier, HostRules};

fn generate_rules(size: usize) -> HostRules {
    let blocked: Vec<String> = (0..size)
        .map(|i| {
            if i % 2 == 0 {
                format!("blocked{i}.com")
            } else {
                format!("*.ads{i}.net")
            }
        })
        .collect();
    let allowed = vec!["ok.ads1.net".to_string()];
    let home = "home.lan".to_string();
    HostRules::new(&blocked, &allowed, [(&home, "192.168.1.2")])
}

fn bench_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_rules");

    for size in [10, 100, 1000, 10000] {
        let rules = generate_rules(size);

        group.bench_with_input(BenchmarkId::new("exact_hit", size), &rules, |b, rules| {
            b.iter(|| rules.classify(black_box("blocked0.com")));
        });
        group.bench_with_input(BenchmarkId::new("wildcard_hit", size), &rules, |b, rules| {
            b.iter(|| rules.classify(black_box("tracking.ads1.net")));
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &rules, |b, rules| {
            b.iter(|| rules.classify(black_box("www.example.org")));
        });
    }

    group.finish();
}

fn bench_cached(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_classifier");

    let cached = CachedClassifier::new(generate_rules(10000));
    cached.classify("www.example.org");

    group.bench_function("warm_hit", |b| {
        b.iter(|| cached.classify(black_box("www.example.org")));
    });

    group.bench_function("cold_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cached.classify(black_box(&format!("host{i}.example.org")))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_rules, bench_cached);
criterion_main!(benches);
