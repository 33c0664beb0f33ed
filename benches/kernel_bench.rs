//! Benchmarks for the team kernel.
//!
//! Benchmarks cover:
//! - Buffer pool acquire/release per bucket size
//! - Managed object borrow/return, pooled and unpooled
//! - Team dispatch overhead per strategy
//! - End-to-end process execution through a bounded managed object pool

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use team_kernel::config::{ManagedObjectConfig, TeamConfig};
use team_kernel::core::{
    source_fn, KernelError, ManagedObjectPool, Outcome, TaskSpec, Team, TeamJob,
};
use team_kernel::infra::BufferPool;
use team_kernel::Kernel;

const WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// Helper Types
// ============================================================================

struct CountJob {
    done: Arc<AtomicUsize>,
}

impl TeamJob for CountJob {
    fn run(self: Box<Self>) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    fn cancel(self: Box<Self>, _cause: KernelError) {}
}

struct Connection {
    queries: u64,
}

fn wait_until(counter: &AtomicUsize, expected: usize) {
    while counter.load(Ordering::Acquire) < expected {
        std::thread::yield_now();
    }
}

// ============================================================================
// Buffer Pool
// ============================================================================

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");
    let pool = BufferPool::default();

    for size in [1024_usize, 8 * 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("acquire_release", size), &size, |b, &size| {
            b.iter(|| {
                let mut buf = pool.acquire(black_box(size));
                buf.extend_from_slice(b"x");
                black_box(buf.len())
            });
        });
    }

    group.bench_function("allocate_without_pool", |b| {
        b.iter(|| {
            let mut buf = bytes::BytesMut::with_capacity(black_box(8 * 1024));
            buf.extend_from_slice(b"x");
            black_box(buf.len())
        });
    });

    group.finish();
}

// ============================================================================
// Managed Object Pool
// ============================================================================

fn bench_managed_object_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("managed_object_pool");

    let policies = [
        ("pooled", ManagedObjectConfig::pooled(Some(8))),
        ("unpooled", ManagedObjectConfig::eager()),
    ];
    for (label, config) in policies {
        let pool = Arc::new(
            ManagedObjectPool::new(
                label,
                0,
                config,
                source_fn(|| Ok(Connection { queries: 0 })),
            )
            .expect("valid pool"),
        );
        group.bench_function(BenchmarkId::new("borrow_return", label), |b| {
            b.iter(|| {
                let mut object = pool.acquire(WAIT).expect("instance available");
                if let Some(conn) = object.get_mut::<Connection>() {
                    conn.queries += 1;
                }
                pool.return_instance(black_box(object)).expect("instance returns");
            });
        });
    }

    let pool = Arc::new(
        ManagedObjectPool::new(
            "contended",
            0,
            ManagedObjectConfig::pooled(Some(2)),
            source_fn(|| Ok(Connection { queries: 0 })),
        )
        .expect("valid pool"),
    );
    group.bench_function("borrow_return_4_threads", |b| {
        b.iter(|| {
            std::thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        for _ in 0..100 {
                            let object = pool.acquire(WAIT).expect("instance available");
                            pool.return_instance(object).expect("instance returns");
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

// ============================================================================
// Team Dispatch
// ============================================================================

fn bench_team_dispatch(c: &mut Criterion) {
    const JOBS: usize = 1_000;
    let mut group = c.benchmark_group("team_dispatch");
    group.throughput(Throughput::Elements(JOBS as u64));

    let configs = [
        TeamConfig::caller_runs("caller"),
        TeamConfig::single_thread("single"),
        TeamConfig::fixed_pool("fixed", 4),
    ];
    for config in configs {
        let name = config.name.clone();
        let team = Team::new(config).expect("valid team");
        team.start().expect("team starts");

        group.bench_function(BenchmarkId::new("assign", &name), |b| {
            b.iter(|| {
                let done = Arc::new(AtomicUsize::new(0));
                for _ in 0..JOBS {
                    team.assign(Box::new(CountJob {
                        done: Arc::clone(&done),
                    }))
                    .expect("team accepts jobs");
                }
                wait_until(&done, JOBS);
            });
        });

        team.stop();
    }

    group.finish();
}

// ============================================================================
// End-to-End Processes
// ============================================================================

fn bench_process_throughput(c: &mut Criterion) {
    const PROCESSES: usize = 200;
    let mut group = c.benchmark_group("process_throughput");
    group.throughput(Throughput::Elements(PROCESSES as u64));
    group.sample_size(20);

    for pool_size in [1_usize, 4, 16] {
        let kernel = Kernel::builder()
            .team(TeamConfig::fixed_pool("io", 4))
            .managed_object_with(
                "db",
                ManagedObjectConfig::pooled(Some(pool_size)),
                source_fn(|| Ok(Connection { queries: 0 })),
            )
            .task(
                TaskSpec::new("query", "io", |ctx| {
                    let conn = ctx
                        .object::<Connection>(0)
                        .ok_or_else(|| anyhow::anyhow!("db not bound"))?;
                    conn.queries += 1;
                    Ok(Outcome::next())
                })
                .depends_on("db")
                .next("respond"),
            )
            .task(TaskSpec::new("respond", "io", |_| Ok(Outcome::Finish)))
            .build()
            .expect("kernel builds");
        kernel.open_kernel().expect("kernel opens");
        let query = kernel.task_id("query").expect("query task registered");

        group.bench_with_input(
            BenchmarkId::new("query_then_respond", pool_size),
            &pool_size,
            |b, _| {
                b.iter(|| {
                    let handles: Vec<_> = (0..PROCESSES)
                        .map(|_| kernel.invoke(query, None).expect("invoke"))
                        .collect();
                    for handle in handles {
                        black_box(handle.wait(WAIT));
                    }
                });
            },
        );

        kernel.close_kernel();
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_buffer_pool,
    bench_managed_object_pool,
    bench_team_dispatch,
    bench_process_throughput
);
criterion_main!(benches);
