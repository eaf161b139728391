//! Stable-address allocation tests

use atlas_ffi::{address_of, AddressIdentity, Arena, ByteBuffer, FfiError, NativeBridge, StableView};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use std::sync::Arc;

#[test]
fn test_duplicate_key_rejected_until_freed() {
    let bridge = NativeBridge::new().unwrap();
    let first = bridge.allocate("buf1", 16, 8).unwrap();

    assert_eq!(
        bridge.allocate("buf1", 16, 8).unwrap_err(),
        FfiError::DuplicateKey("\"buf1\"".to_string())
    );
    // the live allocation is untouched by the failed request
    assert_eq!(bridge.arena().address_of_key("buf1"), Some(first.address()));

    bridge.free("buf1");
    let second = bridge.allocate("buf1", 16, 8).unwrap();
    assert!(second.is_stable());
    assert_eq!(bridge.arena().live_count(), 1);
}

#[test]
fn test_free_unknown_and_repeated() {
    let arena: Arena<String> = Arena::new();
    assert!(arena.free("never").is_none());

    arena.allocate("once".to_string(), 4, 4).unwrap();
    assert!(arena.free("once").is_some());
    assert!(arena.free("once").is_none());
    assert_eq!(arena.live_count(), 0);
}

#[rstest]
#[case(0)]
#[case(3)]
#[case(6)]
#[case(24)]
fn test_invalid_alignment(#[case] alignment: usize) {
    let arena: Arena<u32> = Arena::new();
    assert_eq!(
        arena.allocate(1, 8, alignment).unwrap_err(),
        FfiError::InvalidAlignment(alignment)
    );
}

#[test]
fn test_stable_address_survives_round_trip() {
    let arena = Arena::new();
    let buf = arena.allocate("shared", 8, 8).unwrap();
    assert_eq!(buf.identity(), AddressIdentity::Stable);

    let address = address_of(&buf);
    // rebuild a view from the bare integer, as native code would see it
    let view = unsafe { StableView::from_raw_parts(address, 8) }.unwrap();
    unsafe { view.write_at(0, &0x1122_3344_5566_7788u64.to_ne_bytes()).unwrap() };

    let snapshot = unsafe { buf.to_ephemeral() };
    assert_eq!(snapshot.scalar::<u64>(), Some(0x1122_3344_5566_7788));
    assert_eq!(address_of(&buf), address);
    assert_eq!(arena.address_of_key(&"shared"), Some(address));
}

#[test]
fn test_independent_arenas() {
    let left: Arena<&str> = Arena::new();
    let right: Arena<&str> = Arena::new().with_limit(Some(8));

    let a = left.allocate("k", 64, 8).unwrap();
    let b = right.allocate("k", 8, 8).unwrap();
    assert_ne!(a.address(), b.address());

    left.free(&"k");
    assert!(right.contains(&"k"));
    assert!(matches!(
        right.allocate("other", 1, 1),
        Err(FfiError::ArenaExhausted { .. })
    ));
    assert!(left.allocate("other", 1024, 1).is_ok());
}

#[test]
fn test_shared_across_threads() {
    let arena: Arc<Arena<String>> = Arc::new(Arena::new());
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let arena = Arc::clone(&arena);
            std::thread::spawn(move || {
                let key = format!("worker-{}", worker);
                let buf = arena.allocate(key.clone(), 32, 16).unwrap();
                let view = buf.stable_view().copied().unwrap();
                unsafe { view.write_at(0, &[worker as u8; 32]).unwrap() };
                (key, buf.address())
            })
        })
        .collect();

    for worker in workers {
        let (key, address) = worker.join().unwrap();
        let view = arena.view(key.as_str()).unwrap();
        assert_eq!(view.address(), address);
        let first = unsafe { view.as_slice() }[0];
        assert!(unsafe { view.as_slice() }.iter().all(|b| *b == first));
    }
    assert_eq!(arena.live_count(), 4);
    assert_eq!(arena.live_bytes(), 128);
}

#[test]
fn test_ephemeral_buffers_are_not_arena_backed() {
    let buf = ByteBuffer::from_scalar(1u32);
    assert_eq!(buf.identity(), AddressIdentity::Ephemeral);
    assert!(buf.stable_view().is_none());
}

proptest! {
    #[test]
    fn prop_allocation_is_aligned_and_zeroed(size in 0usize..4096, align_shift in 0u32..13) {
        let alignment = 1usize << align_shift;
        let arena = Arena::new();
        let buf = arena.allocate(0u8, size, alignment).unwrap();

        prop_assert_eq!(buf.address() % alignment, 0);
        prop_assert_eq!(buf.len(), size);
        let zeroed = unsafe { buf.as_slice() }.iter().all(|b| *b == 0);
        prop_assert!(zeroed);

        let record = arena.record(&0u8).unwrap();
        prop_assert_eq!(record.alignment, alignment);
        prop_assert_eq!(record.address, buf.address());
    }

    #[test]
    fn prop_address_is_stable_while_live(count in 1usize..16) {
        let arena = Arena::new();
        let bufs: Vec<_> = (0..count).map(|i| arena.allocate(i, 16, 16).unwrap()).collect();
        let addresses: Vec<usize> = bufs.iter().map(address_of).collect();

        // churn other keys; live addresses must not move
        for i in count..count * 2 {
            arena.allocate(i, 64, 8).unwrap();
            arena.free(&i);
        }
        for (i, buf) in bufs.iter().enumerate() {
            prop_assert_eq!(address_of(buf), addresses[i]);
            prop_assert_eq!(arena.address_of_key(&i), Some(addresses[i]));
        }
    }
}
