use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use pulse_billing::{PlanTier, ResourceAmounts, ResourceKind, Subscription, UsageMetadata};
use pulse_core::{JobId, UserId};
use pulse_infra::ledger::{InMemoryLedgerStore, LedgerStore, UsageLedger};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Limits high enough that no iteration is ever denied.
fn unbounded() -> ResourceAmounts {
    ResourceKind::ALL
        .into_iter()
        .fold(ResourceAmounts::default(), |acc, kind| acc.with(kind, u64::MAX / 2))
}

fn setup_ledger(rt: &Runtime, users: usize) -> (UsageLedger, Vec<UserId>) {
    let store = InMemoryLedgerStore::arc();
    let user_ids: Vec<UserId> = (0..users).map(|_| UserId::new()).collect();
    rt.block_on(async {
        for user in &user_ids {
            let subscription = Subscription::open(*user, PlanTier::Pro, Utc::now()).with_limits(unbounded());
            store.insert_subscription(&subscription).await.unwrap();
        }
    });
    let store: Arc<dyn LedgerStore> = store;
    (UsageLedger::new(store), user_ids)
}

fn bench_admission_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("admission_latency");
    group.sample_size(1000);

    // Reserve then release: the hold never becomes usage.
    group.bench_function("reserve_release", |b| {
        let (ledger, users) = setup_ledger(&rt, 1);
        let user = users[0];
        b.iter(|| {
            rt.block_on(async {
                let job = JobId::new();
                ledger
                    .check_and_reserve(user, job, ResourceKind::Images, black_box(1))
                    .await
                    .unwrap();
                ledger.release(user, job, ResourceKind::Images).await.unwrap();
            })
        });
    });

    // Full settle path: reserve, then commit the actual amount.
    group.bench_function("reserve_record", |b| {
        let (ledger, users) = setup_ledger(&rt, 1);
        let user = users[0];
        b.iter(|| {
            rt.block_on(async {
                let job = JobId::new();
                ledger
                    .check_and_reserve(user, job, ResourceKind::ChatTokens, 500)
                    .await
                    .unwrap();
                ledger
                    .record_actual(
                        user,
                        job,
                        ResourceKind::ChatTokens,
                        black_box(420),
                        UsageMetadata::default(),
                    )
                    .await
                    .unwrap();
            })
        });
    });

    group.finish();
}

fn bench_concurrent_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrent_admission");

    for tasks in [8usize, 64, 256] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            let (ledger, users) = setup_ledger(&rt, 4);
            b.iter(|| {
                rt.block_on(async {
                    let handles: Vec<_> = (0..tasks)
                        .map(|i| {
                            let ledger = ledger.clone();
                            let user = users[i % users.len()];
                            tokio::spawn(async move {
                                ledger
                                    .check_and_reserve(user, JobId::new(), ResourceKind::Images, 1)
                                    .await
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.await.unwrap().unwrap();
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_admission_latency, bench_concurrent_admission);
criterion_main!(benches);
