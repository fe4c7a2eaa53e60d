use criterion::{Criterion, criterion_group, criterion_main};
use parking_lot::Mutex;
use ssidkv_core::commo::LocalCommo;
use ssidkv_core::config::ProtocolConfig;
use ssidkv_core::coordinator::{Coordinator, Piece, TxnIdGenerator, TxnRequest};
use ssidkv_core::mvcc::VersionQueue;
use ssidkv_core::scheduler::PartitionScheduler;
use ssidkv_core::types::{Decision, Value};
use std::sync::Arc;

fn bench_version_queue_cycle(c: &mut Criterion) {
    c.bench_function("version_queue_cycle_64", |b| {
        b.iter(|| {
            let mut q = VersionQueue::new(0, Value::Int(0));
            for t in 1..=64u64 {
                q.read(t + 1000, t);
                let w = q.write(Value::Int(t as i64), t, t);
                if q.validate_write(w.index, w.ssid.low, true) {
                    q.finalize(w.index, Decision::Finalized, w.ssid.low);
                } else {
                    q.finalize(w.index, Decision::Aborted, 0);
                }
            }
            q
        });
    });
}

fn bench_speculative_reads(c: &mut Criterion) {
    c.bench_function("speculative_reads", |b| {
        let mut q = VersionQueue::new(0, Value::Int(0));
        // Leave a pending write at the head.
        q.write(Value::Int(1), 0, 1);
        let mut t = 2u64;
        b.iter(|| {
            let r = q.read(t, t);
            t += 1;
            r
        });
    });
}

fn cluster(config: &ProtocolConfig) -> LocalCommo {
    let commo = LocalCommo::new();
    for p in 0..2 {
        let s = PartitionScheduler::new(p, config);
        for key in 0..100 {
            s.load_row(key, vec![Value::Int(0); 8]);
        }
        commo.add_partition(Arc::new(s));
    }
    commo
}

fn bench_two_partition_commit(c: &mut Criterion) {
    let config = ProtocolConfig::default();

    c.bench_function("two_partition_commit", |b| {
        let commo = cluster(&config);
        let coord = Coordinator::new(
            Arc::new(commo.clone()),
            config.clone(),
            Arc::new(TxnIdGenerator::new(0)),
        );
        let committed = Arc::new(Mutex::new(0u64));

        let mut i = 0u64;
        b.iter(|| {
            let key = i % 100;
            let txn = TxnRequest::new(i)
                .piece(Piece::new(1, 0).read(key, 0).write(key, 1, i as i64))
                .piece(Piece::new(2, 1).write_output(key, 0, 1, 0).after(1));
            let sink = committed.clone();
            coord
                .submit(txn, move |outcome| {
                    if outcome.decision == Decision::Finalized {
                        *sink.lock() += 1;
                    }
                })
                .unwrap();
            commo.run_until_idle();
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_version_queue_cycle,
    bench_speculative_reads,
    bench_two_partition_commit
);
criterion_main!(benches);
