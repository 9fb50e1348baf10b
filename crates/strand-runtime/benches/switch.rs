//! Context switch and scheduling overhead.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use strand_runtime::{Fiber, Scheduler, Task, TimerManager};

/// One resume plus one yield back.
fn bench_resume_yield(c: &mut Criterion) {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let fiber = Fiber::new(
        move || {
            while r.load(Ordering::Relaxed) {
                Fiber::yield_current();
            }
        },
        64 * 1024,
        false,
    );

    c.bench_function("fiber/resume_yield", |b| {
        b.iter(|| {
            fiber.resume();
            black_box(fiber.state())
        })
    });

    running.store(false, Ordering::Relaxed);
    fiber.resume();
}

/// Create, run to completion and drop a fiber.
fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("fiber/spawn");
    for size in [16 * 1024usize, 128 * 1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let fiber = Fiber::new(|| {}, size, false);
                fiber.resume();
                black_box(fiber.state())
            })
        });
    }
    group.finish();
}

/// Reusing one fiber through reset, as the scheduler does for callbacks.
fn bench_reset(c: &mut Criterion) {
    let fiber = Fiber::new(|| {}, 64 * 1024, false);
    fiber.resume();
    c.bench_function("fiber/reset_resume", |b| {
        b.iter(|| {
            fiber.reset(|| {
                black_box(1 + 1);
            });
            fiber.resume();
        })
    });
}

fn bench_timers(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer/add_expire");
    for n in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mgr = TimerManager::new();
                for i in 0..n {
                    mgr.add_timer((i % 7) as u64, || {}, false);
                }
                black_box(mgr.list_expired_at(u64::MAX).len())
            })
        });
    }
    group.finish();
}

/// Submit a batch and wait for a two-worker scheduler to drain it.
fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/drain");
    group.sample_size(20);
    for n in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let sched = Scheduler::new(2, false, "bench").expect("scheduler");
                sched.start().expect("start");
                let done = Arc::new(AtomicUsize::new(0));
                sched.schedule_batch((0..n).map(|_| {
                    let d = done.clone();
                    Task::callback(move || {
                        d.fetch_add(1, Ordering::Relaxed);
                    })
                }));
                sched.stop();
                black_box(done.load(Ordering::Relaxed))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resume_yield, bench_spawn, bench_reset, bench_timers, bench_schedule);
criterion_main!(benches);
