//! Flat Bus Tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tempo_core::bus::{Access, AccessWidth, BusController, FlatBus};

#[test]
fn images_load_only_when_they_fit() {
    let bus = FlatBus::new(0x8000, 0x10);
    assert_eq!(bus.base(), 0x8000);
    assert!(bus.load(0x8008, &[1, 2, 3, 4, 5, 6, 7, 8]));
    assert!(!bus.load(0x800c, &[0; 8]));
    assert!(!bus.load(0x7ff8, &[0; 4]));

    assert_eq!(bus.read(0x8008, AccessWidth::QuadWord, None), 0x0807_0605_0403_0201);
    assert_eq!(bus.read(0x800a, AccessWidth::Word, Some(1)), 0x0403);
}

#[test]
fn read_bytes_fails_on_unmapped_ranges() {
    let bus = FlatBus::new(0, 8);
    assert!(bus.load(0, b"tempo!!!"));

    let mut buffer = [0u8; 5];
    assert!(bus.read_bytes(1, &mut buffer));
    assert_eq!(&buffer, b"empo!");
    assert!(!bus.read_bytes(6, &mut buffer));
}

#[test]
fn watchpoints_are_kept_per_address_and_direction() {
    let bus = FlatBus::new(0, 0x100);
    let seen = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&seen);
    let watchpoint = bus.add_watchpoint(
        0x40,
        Access::Write,
        Arc::new(move |_cpu, _address, _width, value| sink.store(value, Ordering::SeqCst)),
    );
    let _ = bus.add_watchpoint(0x40, Access::Write, Arc::new(|_, _, _, _| {}));

    assert!(watchpoint.is_enabled());
    assert_eq!(bus.watchpoints_at(0x40, Access::Write).len(), 2);
    assert!(bus.watchpoints_at(0x40, Access::Read).is_empty());
    assert!(bus.watchpoints_at(0x44, Access::Write).is_empty());

    bus.watchpoints_at(0x40, Access::Write)[0].invoke(0, 0x40, AccessWidth::Byte, 7);
    assert_eq!(seen.load(Ordering::SeqCst), 7);

    watchpoint.set_enabled(false);
    assert!(!bus.watchpoints_at(0x40, Access::Write)[0].is_enabled());

    bus.remove_watchpoints(0x40, Access::Write);
    assert!(bus.watchpoints_at(0x40, Access::Write).is_empty());
}

#[test]
fn nearest_preceding_symbol_is_used() {
    let bus = FlatBus::new(0, 0x100);
    bus.add_symbol(0x100, 0x100, "outer");
    bus.add_symbol(0x140, 0x10, "inner");
    assert_eq!(bus.find_symbol(0x144).as_deref(), Some("inner"));
    // Past `inner`; only the nearest preceding symbol is considered.
    assert_eq!(bus.find_symbol(0x160), None);
    assert_eq!(bus.find_symbol(0x120).as_deref(), Some("outer"));
}
