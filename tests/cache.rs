#![cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use jitson::ir::Direction;
use jitson::shape::ShapeKey;
use jitson::{Config, Engine, Facet};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Log to the test writer; `RUST_LOG=jitson=debug` shows compiles and evictions.
fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init();
    });
}

#[derive(Debug, Default, PartialEq, Facet, serde::Serialize)]
#[facet(traits(Default))]
struct Order {
    id: u64,
    items: Vec<String>,
    total: f64,
}

fn order(id: u64) -> Order {
    Order {
        id,
        items: (0..id % 5).map(|i| format!("sku-{i}")).collect(),
        total: id as f64 * 1.5,
    }
}

#[test]
fn concurrent_first_use_compiles_once() {
    init_tracing();
    let engine = Engine::default();
    let barrier = Barrier::new(16);
    thread::scope(|s| {
        for t in 0..16u64 {
            let engine = &engine;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..50 {
                    let o = order(t * 100 + i);
                    let json = engine.encode(&o).unwrap();
                    assert_eq!(json, serde_json::to_vec(&o).unwrap());
                    assert_eq!(engine.decode::<Order>(&json).unwrap(), o);
                }
            });
        }
    });

    let stats = engine.cache_stats();
    assert_eq!(stats.compilations, 2, "{stats:?}");
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.entries, 2);
}

#[test]
fn compilation_is_idempotent() {
    init_tracing();
    let engine = Engine::default();
    let a = engine.routine(Order::SHAPE, Direction::Encode).unwrap();
    let b = engine.routine(Order::SHAPE, Direction::Encode).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    // A separate engine compiles its own copy that behaves the same.
    let other = Engine::default();
    let c = other.routine(Order::SHAPE, Direction::Encode).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(
        engine.encode(&order(7)).unwrap(),
        other.encode(&order(7)).unwrap()
    );
}

#[test]
fn least_recently_used_routines_are_evicted() {
    init_tracing();
    let engine = Engine::new(Config::builder().cache_max_entries(3).build());
    engine.encode(&1u8).unwrap();
    engine.encode(&1u16).unwrap();
    engine.encode(&1u32).unwrap();
    // Touch u8 so u16 is the oldest.
    engine.encode(&2u8).unwrap();
    engine.encode(&1u64).unwrap();

    let cache = engine.cache();
    let present = |shape| cache.contains(ShapeKey::new(shape), Direction::Encode);
    assert!(present(u8::SHAPE));
    assert!(!present(u16::SHAPE));
    assert!(present(u32::SHAPE));
    assert!(present(u64::SHAPE));
    assert_eq!(engine.cache_stats().evictions, 1);

    // Evicted shapes recompile transparently.
    assert_eq!(engine.encode(&9u16).unwrap(), b"9");
}

#[test]
fn ttl_sweeper_expires_entries() {
    init_tracing();
    let engine = Engine::new(
        Config::builder()
            .cache_ttl(Duration::from_millis(20))
            .sweep_interval(Duration::from_millis(10))
            .build(),
    );
    let routine = engine.routine(Order::SHAPE, Direction::Decode).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while engine.cache_stats().entries > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.cache_stats().entries, 0);
    // Handed-out routines outlive their cache entry.
    assert!(!routine.code().is_empty());
    assert_eq!(engine.decode::<u8>(b"3").unwrap(), 3);
}

#[test]
fn invalidate_all_forces_recompilation() {
    init_tracing();
    let engine = Engine::default();
    engine.encode(&order(1)).unwrap();
    engine.cache().invalidate_all();
    assert_eq!(engine.cache_stats().entries, 0);
    engine.encode(&order(2)).unwrap();
    assert_eq!(engine.cache_stats().compilations, 2);
}

mod first {
    #[derive(Default, jitson::Facet)]
    #[facet(traits(Default))]
    pub struct Point {
        pub x: u32,
    }
}

mod second {
    #[derive(jitson::Facet)]
    #[facet(traits(Default))]
    pub struct Point {
        pub x: u32,
    }

    impl Default for Point {
        fn default() -> Self {
            Point { x: 7 }
        }
    }
}

#[test]
fn routines_are_keyed_by_type() {
    init_tracing();
    let engine = Engine::default();
    let a = engine.routine(first::Point::SHAPE, Direction::Encode).unwrap();
    let again = engine.routine(first::Point::SHAPE, Direction::Encode).unwrap();
    assert!(Arc::ptr_eq(&a, &again));

    // Same layout, different type: defaults differ, so routines must too.
    let b = engine.routine(second::Point::SHAPE, Direction::Encode).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(engine.encode(&second::Point { x: 4 }).unwrap(), br#"{"x":4}"#);
    assert_eq!(engine.decode::<Vec<second::Point>>(b"[{}]").unwrap()[0].x, 7);
    assert_eq!(engine.decode::<Vec<first::Point>>(b"[{}]").unwrap()[0].x, 0);
}

#[test]
fn pool_reuses_buffers() {
    init_tracing();
    let engine = Engine::default();
    for i in 0..20 {
        engine.encode(&order(i)).unwrap();
    }
    let stats = engine.pool_stats();
    assert!(stats.buffers_reused > 0, "{stats:?}");
}
