//! Benchmarks for the hash-chained audit log.
//!
//! Run with: cargo bench --bench audit_log_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eks_gateway::audit::{AuditAction, AuditDraft, AuditLog};
use eks_gateway::types::Outcome;
use serde_json::json;

fn draft(i: u64) -> AuditDraft {
    AuditDraft::new("tenant-bench", AuditAction::Sign, Outcome::Success)
        .subject("key-bench")
        .correlation(format!("req-{}", i))
        .detail(json!({ "attempts": 1, "hsm_operation_id": format!("op-{}", i) }))
}

fn filled(n: u64) -> AuditLog {
    let log = AuditLog::in_memory();
    for i in 0..n {
        log.append(draft(i)).expect("append");
    }
    log
}

/// Seal and append one entry.
fn bench_append(c: &mut Criterion) {
    let log = AuditLog::in_memory();
    let mut i = 0u64;
    c.bench_function("audit_append", |b| {
        b.iter(|| {
            i += 1;
            black_box(log.append(draft(i)).expect("append"))
        })
    });
}

/// Full chain verification at different log sizes.
fn bench_verify_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit_verify_chain");
    for n in [100u64, 1_000, 10_000].iter() {
        let log = filled(*n);
        group.throughput(Throughput::Elements(*n));
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, _| {
            b.iter(|| black_box(log.verify_chain().expect("chain intact")))
        });
    }
    group.finish();
}

/// Range export with Merkle root.
fn bench_export(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit_export");
    let log = filled(10_000);
    for span in [10u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*span));
        group.bench_with_input(BenchmarkId::from_parameter(span), span, |b, &span| {
            b.iter(|| black_box(log.export(1, Some(span))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_verify_chain, bench_export);
criterion_main!(benches);
