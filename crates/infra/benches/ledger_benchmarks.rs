use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use geojobs_core::TenantId;
use geojobs_geocoding::{
    GeocodingJob, NewGeocodingJob, Pricing, QuotaAccount, QuotaLimit, QuotaPool, RemoteId,
    RowCounters,
};
use geojobs_infra::jobs::{CreditLedger, InMemoryAccountDirectory, InMemoryJobStore, JobStore};

fn account(tenant_id: TenantId) -> QuotaAccount {
    QuotaAccount {
        tenant_id,
        quota: 10_000,
        limit: QuotaLimit::Hard,
        pricing: Pricing::new(1500, 1000).unwrap(),
        organization: None,
    }
}

fn submitted(tenant_id: TenantId) -> GeocodingJob {
    let mut job = GeocodingJob::create(NewGeocodingJob::new(tenant_id, "addresses", "{street}")).unwrap();
    job.record_processable_rows(100).unwrap();
    job.mark_submitted(RemoteId::new("bench")).unwrap();
    job
}

fn seeded_store(tenant_id: TenantId, jobs: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for _ in 0..jobs {
        let mut job = submitted(tenant_id);
        job.mark_completed(RowCounters { processed_rows: 80, cache_hits: 20, real_rows: 90 }, 0)
            .unwrap();
        store.insert(job).unwrap();
    }
    store
}

fn bench_pool_usage(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_usage");

    for jobs in [10usize, 100, 1_000, 10_000] {
        let tenant = TenantId::new();
        let store = seeded_store(tenant, jobs);
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &store, |b, store| {
            b.iter(|| black_box(store.pool_usage(QuotaPool::Tenant(tenant), None).unwrap()))
        });
    }

    group.finish();
}

fn bench_finalize(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("ledger_finalize");

    for prior_jobs in [0usize, 100, 1_000] {
        let tenant = TenantId::new();
        let store = seeded_store(tenant, prior_jobs);
        let accounts = Arc::new(InMemoryAccountDirectory::new());
        accounts.upsert(account(tenant));
        let ledger = CreditLedger::new(store.clone(), accounts);

        group.bench_with_input(BenchmarkId::from_parameter(prior_jobs), &prior_jobs, |b, _| {
            b.iter(|| {
                let mut job = submitted(tenant);
                store.insert(job.clone()).unwrap();
                let counters = RowCounters { processed_rows: 100, cache_hits: 0, real_rows: 100 };
                black_box(runtime.block_on(ledger.finalize(&mut job, counters)).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pool_usage, bench_finalize);
criterion_main!(benches);
