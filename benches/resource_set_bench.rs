//! Hot-path benchmarks: thread cache updates, table lookups and monitoring queries.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resource_stats::{
    MonitorType, ResourceSet, ResourceSetStat, ResourceSetStats, ResourceSetTable, ThreadCache, TrackingConfig,
};

fn bench_thread_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_cache");
    let sets: Vec<_> = (0..4).map(|i| Arc::new(ResourceSet::new(&format!("org{}", i), false))).collect();

    group.throughput(Throughput::Elements(1));
    group.bench_function("accumulate_resident", |b| {
        let mut cache = ThreadCache::new();
        b.iter(|| cache.accumulate(black_box(&sets[0]), ResourceSetStat::Qos1MsgsPublished, 1));
    });

    group.bench_function("accumulate_rotating", |b| {
        let mut cache = ThreadCache::new();
        let mut next = 0usize;
        b.iter(|| {
            next = (next + 1) % sets.len();
            cache.accumulate(black_box(&sets[next]), ResourceSetStat::Qos1MsgBytesPublished, 512);
        });
    });

    group.bench_function("accumulate_and_flush", |b| {
        let mut cache = ThreadCache::new();
        b.iter(|| {
            cache.accumulate(&sets[0], ResourceSetStat::Connections, 1);
            cache.accumulate(&sets[0], ResourceSetStat::MaxPublishRecipients, 12);
            cache.flush_all();
        });
    });

    group.finish();
}

fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("table");
    let table = ResourceSetTable::new(1000, true, None);
    for i in 0..1000 {
        let _ = table.get_or_create(&format!("org{:04}", i));
    }

    group.bench_function("get_or_create_hit", |b| {
        b.iter(|| table.get_or_create(black_box("org0500")));
    });

    group.bench_function("lookup_miss", |b| {
        b.iter(|| table.lookup(black_box("unknown-org")));
    });

    group.finish();
}

fn bench_get_monitor(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_monitor");
    let config = TrackingConfig {
        client_id_pattern: r"^([^-]+)-".into(),
        ..TrackingConfig::default()
    };

    for set_count in [100usize, 1_000, 10_000] {
        let stats = match ResourceSetStats::init(&config) {
            Ok(Some(stats)) => stats,
            _ => return,
        };
        let mut cache = ThreadCache::new();
        for i in 0..set_count {
            if let Ok(Some(set)) = stats.resolve(
                Some(&format!("org{}-device", i)),
                None,
                resource_stats::ResolveMode::LookupOrCreate,
            ) {
                cache.accumulate(&set, ResourceSetStat::TotalMemory, (i as i64 * 7919) % 100_000);
                cache.flush_all();
            }
        }

        group.throughput(Throughput::Elements(set_count as u64));
        group.bench_with_input(BenchmarkId::new("top_50", set_count), &stats, |b, stats| {
            b.iter(|| stats.get_monitor(MonitorType::HighestTotalMemoryBytes, 50, None));
        });
        group.bench_with_input(BenchmarkId::new("all_unsorted", set_count), &stats, |b, stats| {
            b.iter(|| stats.get_monitor(MonitorType::AllUnsorted, 0, None));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_thread_cache, bench_table, bench_get_monitor);
criterion_main!(benches);
