#![allow(unsafe_code)]

//! Lock-order observer and thread launch benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use strand_core::config::{self, LockDebugLevel};
use strand_core::pthread::{GuardedMutex, MutexKind, create_thread, join_thread};

fn bench_guarded_lock_unlock(c: &mut Criterion) {
    let levels = [
        ("disabled", LockDebugLevel::Disabled),
        ("enabled", LockDebugLevel::Enabled),
        ("stacks", LockDebugLevel::CaptureCallStacks),
    ];
    let mut group = c.benchmark_group("guarded_lock_unlock");

    for (name, level) in levels {
        config::set_lock_debug_level(level);
        strand_core::lockorder::reset_for_tests();
        let a = GuardedMutex::new(MutexKind::Normal);
        let b = GuardedMutex::new(MutexKind::Normal);
        group.bench_with_input(BenchmarkId::new("nested_pair", name), &level, |bench, _| {
            bench.iter(|| {
                a.lock().ok();
                b.lock().ok();
                b.unlock().ok();
                a.unlock().ok();
            });
        });
    }
    config::set_lock_debug_level(LockDebugLevel::Disabled);
    group.finish();
}

fn bench_deep_known_chain(c: &mut Criterion) {
    config::set_lock_debug_level(LockDebugLevel::Enabled);
    strand_core::lockorder::reset_for_tests();
    let chain: Vec<GuardedMutex> = (0..32).map(|_| GuardedMutex::new(MutexKind::Normal)).collect();
    let mut group = c.benchmark_group("known_chain");

    group.bench_function("32_deep", |bench| {
        bench.iter(|| {
            for m in &chain {
                m.lock().ok();
            }
            for m in chain.iter().rev() {
                m.unlock().ok();
            }
        });
    });
    group.finish();
    config::set_lock_debug_level(LockDebugLevel::Disabled);
}

unsafe extern "C" fn identity(arg: usize) -> usize {
    arg
}

fn bench_create_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_join");
    group.bench_function("default_attr", |bench| {
        bench.iter(|| {
            // SAFETY: `identity` only returns its argument.
            if let Ok(handle) = unsafe { create_thread(None, identity, 1) } {
                criterion::black_box(join_thread(handle).ok());
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_guarded_lock_unlock,
    bench_deep_known_chain,
    bench_create_join
);
criterion_main!(benches);
