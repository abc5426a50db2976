use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sgl_protocol::registers::{offset, COMMAND_START};
use sgl_protocol::Register;
use sgl_shm::{SharedRegion, ShmRegisters};

const THREADS: usize = 8;
const ITERS: u32 = 10_000;

#[test]
fn lock_serializes_read_modify_write_across_threads() {
    let region = Arc::new(SharedRegion::heap(COMMAND_START + 0x100));
    // Counter lives in the FIFO area; updates are a separate load and store so only the
    // lock keeps them from racing.
    let counter_off = COMMAND_START;
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let regs = ShmRegisters::new(region.clone());
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let counter = regs.region().atomic_u32(counter_off);
                for _ in 0..ITERS {
                    let _guard = regs.lock().lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(
        region.atomic_u32(counter_off).load(Ordering::Acquire),
        THREADS as u32 * ITERS
    );
    assert_eq!(region.atomic_u32(offset::LOCK).load(Ordering::Acquire), 0);
}

#[test]
fn bounded_acquire_succeeds_once_holder_releases() {
    let region = Arc::new(SharedRegion::heap(COMMAND_START));
    let regs = ShmRegisters::new(region);

    let holder_regs = regs.clone();
    let held = Arc::new(Barrier::new(2));
    let holder_held = held.clone();
    let holder = thread::spawn(move || {
        let _guard = holder_regs.lock().lock();
        holder_held.wait();
        thread::sleep(Duration::from_millis(20));
    });

    held.wait();
    assert_eq!(regs.load(Register::Lock), 1);
    let guard = regs.lock().try_lock_for(Duration::from_secs(5));
    assert!(guard.is_some());
    drop(guard);
    holder.join().unwrap();
}
