#![no_main]
use libfuzzer_sys::fuzz_target;

use oomprobe_core::{FaultPolicy, SystemAllocationScope, TrackedAllocator};

// Each 4-byte chunk is one operation: opcode, size (le u16), alignment shift.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let policy = FaultPolicy::from_flags(
        data[0] & 1 != 0,
        usize::from(data[1]),
        data[0] & 2 != 0,
        usize::from(data[2]),
    );
    let tracker = TrackedAllocator::with_policy(policy);
    let mut live = Vec::new();

    for chunk in data[4..].chunks_exact(4) {
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let alignment = 1usize << (chunk[3] % 13);
        let scope = SystemAllocationScope(u32::from(chunk[3]));

        match op {
            0 => {
                if let Ok(ptr) = tracker.allocate(size, alignment, scope) {
                    assert_eq!(ptr.as_ptr() as usize % alignment, 0);
                    live.push((ptr, alignment));
                }
            }
            1 => {
                if let Some((ptr, _)) = live.pop() {
                    tracker.free(Some(ptr));
                }
            }
            2 => {
                if let Some((ptr, alignment)) = live.pop() {
                    match tracker.reallocate(Some(ptr), size, alignment, scope) {
                        Ok(Some(grown)) => live.push((grown, alignment)),
                        Ok(None) => {}
                        // Failed growth leaves the original live.
                        Err(_) => live.push((ptr, alignment)),
                    }
                }
            }
            _ => tracker.update_policy(FaultPolicy::never()),
        }

        assert_eq!(tracker.current_allocation_count(), live.len());
    }

    for (ptr, _) in live {
        tracker.free(Some(ptr));
    }
    assert!(tracker.is_empty());
});
