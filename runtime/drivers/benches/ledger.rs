use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use keel_drivers::*;

static BENCH_DEVICE: DriverType = DriverType::new("benchDevice", "Bench Device", Some(&HARDWARE));

struct Idle;

impl Driver for Idle {
    fn driver_type(&self) -> &'static DriverType {
        &BENCH_DEVICE
    }

    fn on_start(&self, _api: &DriverApi<'_>) -> Result<()> {
        Ok(())
    }
}

fn active_registry(drivers: usize) -> (Registry, Vec<DriverId>) {
    let registry = Registry::new();
    let ids = (0..drivers)
        .map(|_| {
            let id = registry.install(Arc::new(Idle));
            registry.start_driver(id).unwrap();
            id
        })
        .collect();
    (registry, ids)
}

fn bench_memory_claims(c: &mut Criterion) {
    let (registry, ids) = active_registry(16);

    // Give every other driver a spread of claims to check against.
    for (n, id) in ids.iter().enumerate().skip(1) {
        let api = DriverApi::new(&registry, *id);
        for page in 0..32 {
            api.subscribe_memory(0x100_0000 * n + page * 0x2000, 0x1000).unwrap();
        }
    }

    let api = DriverApi::new(&registry, ids[0]);
    c.bench_function("subscribe_unsubscribe_memory", |b| {
        b.iter(|| {
            for page in 0..64usize {
                api.subscribe_memory(black_box(page * 0x1000), 0x1000).unwrap();
            }
            api.unsubscribe_memory(0x8000, 0x10000).unwrap();
            api.unsubscribe_memory(0, 0x40000).unwrap();
        })
    });
}

fn bench_find_active(c: &mut Criterion) {
    let (registry, _) = active_registry(32);
    c.bench_function("find_active_driver", |b| {
        b.iter(|| black_box(registry.find_active::<dyn Driver>()))
    });
}

criterion_group!(benches, bench_memory_claims, bench_find_active);
criterion_main!(benches);
