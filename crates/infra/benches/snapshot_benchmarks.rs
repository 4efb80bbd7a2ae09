use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use snapvault_core::{DbAddress, EntryHash};
use snapvault_events::{ConvergenceDetector, ReplicationEvent};
use snapvault_infra::log_store::{LamportClock, Log, LogEntry, LogSnapshot, ReconstructOptions};

const LOG_ID: &str = "/orbitdb/zdpuBench/events";

fn build_log(n: usize) -> Log {
    let mut log = Log::new(LOG_ID);
    for i in 0..n {
        let next = log.heads().into_iter().map(|e| e.hash.clone()).collect();
        let clock = LamportClock {
            id: "bench".to_string(),
            time: log.max_time() + 1,
        };
        let entry = LogEntry::new(LOG_ID, serde_json::json!(format!("entry{i}")), next, clock);
        log.insert(entry).unwrap();
    }
    log
}

fn replication_feed(n: usize) -> Vec<ReplicationEvent> {
    let address = DbAddress::new(LOG_ID).unwrap();
    let mut events: Vec<_> = (0..n)
        .map(|i| ReplicationEvent::Progress {
            address: address.clone(),
            entry: EntryHash::new(format!("entry-{i}")).unwrap(),
            pending: if i + 1 == n {
                Vec::new()
            } else {
                vec![EntryHash::new(format!("entry-{}", i + 1)).unwrap()]
            },
        })
        .collect();
    events.push(ReplicationEvent::Replicated { address, entries: n });
    events
}

fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_reconstruction");

    for size in [10usize, 100, 1_000] {
        let bytes = serde_json::to_vec(&build_log(size).to_snapshot()).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("decode_and_verify", size), &bytes, |b, bytes| {
            b.iter(|| {
                let snapshot: LogSnapshot = serde_json::from_slice(black_box(bytes)).unwrap();
                Log::from_snapshot(snapshot, &ReconstructOptions::default()).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_convergence(c: &mut Criterion) {
    let mut group = c.benchmark_group("convergence_detection");

    for size in [10usize, 1_000, 10_000] {
        let feed = replication_feed(size);
        group.throughput(Throughput::Elements(feed.len() as u64));

        group.bench_with_input(BenchmarkId::new("observe_feed", size), &feed, |b, feed| {
            b.iter(|| {
                let mut detector = ConvergenceDetector::new();
                feed.iter().filter(|e| detector.observe(black_box(e))).count()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reconstruction, bench_convergence);
criterion_main!(benches);
