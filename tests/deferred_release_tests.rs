//! Integration tests for deferred release of graphics buffers.

use exynos_gralloc::memory::{EmulatedIon, EmulatedSubsystem};
use exynos_gralloc::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup(delay: Duration) -> (Arc<EmulatedSubsystem>, Gralloc) {
    let ump = Arc::new(EmulatedSubsystem::new());
    let config = Config::default().with_release_delay(delay);
    let gralloc = Gralloc::new(config, ump.clone(), Arc::new(EmulatedIon::new())).unwrap();
    (ump, gralloc)
}

fn graphic_buffer(ump: &EmulatedSubsystem, gralloc: &Gralloc, id: u32) -> BufferHandle {
    ump.allocate_with_id(id, 4096).unwrap();
    let mut handle = BufferHandle::shared_memory(id, 4096).with_sharing(Sharing::GraphicBuffer);
    gralloc.register_buffer(&mut handle).unwrap();
    handle
}

// ============================================================================
// Delay Semantics
// ============================================================================

/// Unregister returns at once; the copy is torn down after the delay.
#[test]
fn test_unregister_returns_before_teardown() {
    let (ump, gralloc) = setup(Duration::from_millis(100));
    let mut handle = graphic_buffer(&ump, &gralloc, 42);

    let started = Instant::now();
    let outcome = gralloc.unregister_buffer(&mut handle).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    let ticket = outcome.into_ticket().expect("graphics buffer release is deferred");

    assert!(ticket.try_take().is_none());
    assert_eq!(ump.live_references(42), 1);

    let released = ticket.wait().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(released.base, 0);
    assert_eq!(ump.live_references(42), 0);
    assert!(gralloc.tracker().find(42).is_none());

    // The caller's handle was never touched.
    assert!(handle.is_mapped());
}

/// With the default delay nothing happens within the first moments.
#[test]
fn test_default_delay_holds_release() {
    let (ump, gralloc) = setup(Config::default().release_delay);
    let mut handle = graphic_buffer(&ump, &gralloc, 5);

    let ticket = gralloc.unregister_buffer(&mut handle).unwrap().into_ticket().unwrap();
    assert!(ticket.wait_timeout(Duration::from_millis(100)).is_none());
    assert_eq!(gralloc.pending_releases(), 1);
    assert_eq!(ump.live_references(5), 1);
}

/// Releases queued back to back all complete.
#[test]
fn test_many_deferred_releases() {
    let (ump, gralloc) = setup(Duration::from_millis(10));
    let tickets: Vec<_> = (1..=16u32)
        .map(|id| {
            let mut handle = graphic_buffer(&ump, &gralloc, id);
            gralloc.unregister_buffer(&mut handle).unwrap().into_ticket().unwrap()
        })
        .collect();

    for ticket in tickets {
        assert!(ticket.wait().is_ok());
    }
    assert_eq!(gralloc.pending_releases(), 0);
    for id in 1..=16u32 {
        assert_eq!(ump.live_references(id), 0);
    }
}

/// Dropping the module still runs releases already accepted.
#[test]
fn test_drop_runs_pending_releases() {
    let (ump, gralloc) = setup(Duration::from_millis(20));
    let mut handle = graphic_buffer(&ump, &gralloc, 77);
    let ticket = gralloc.unregister_buffer(&mut handle).unwrap().into_ticket().unwrap();

    drop(gralloc);
    assert_eq!(ump.live_references(77), 0);
    assert!(ticket.try_take().unwrap().is_ok());
}
