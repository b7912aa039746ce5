//! Cross-thread allocation and deallocation.
//!
//! Blocks allocated on one thread and freed on another go through the
//! per-page cross-thread token and, when a full page empties remotely,
//! the per-heap free-page stack. These tests drive both paths hard.

use rsmalloc::RsMalloc;
use std::alloc::{GlobalAlloc, Layout};
use std::sync::mpsc;

#[global_allocator]
static GLOBAL: RsMalloc = RsMalloc;

#[test]
fn test_producer_consumer_churn() {
    let (sender, receiver) = mpsc::channel::<(usize, usize)>();

    let consumer = std::thread::spawn(move || {
        let mut freed = 0usize;
        while let Ok((addr, size)) = receiver.recv() {
            let ptr = addr as *mut u8;
            // Verify the producer's marker byte before freeing.
            assert_eq!(unsafe { *ptr }, (size & 0xFF) as u8);
            let layout = Layout::from_size_align(size, 8).unwrap();
            unsafe { GLOBAL.dealloc(ptr, layout) };
            freed += 1;
        }
        freed
    });

    let sizes = [24usize, 100, 500, 2048, 5000, 40_000];
    let total = 3000;
    for i in 0..total {
        let size = sizes[i % sizes.len()];
        let layout = Layout::from_size_align(size, 8).unwrap();
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { *ptr = (size & 0xFF) as u8 };
        sender.send((ptr as usize, size)).unwrap();
    }
    drop(sender);

    assert_eq!(consumer.join().unwrap(), total);
}

#[test]
fn test_allocate_reuse_after_remote_free() {
    // Thread A allocates a large batch of one class, thread B frees it
    // all, then A allocates the same volume again. The owner must recover
    // the remotely freed blocks (token adoption or page hand-back) without
    // ever handing out overlapping blocks.
    let size = 100usize;
    let count = 1000usize;
    let layout = Layout::from_size_align(size, 8).unwrap();

    let mut first: Vec<usize> = Vec::with_capacity(count);
    for _ in 0..count {
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { ptr.write_bytes(0xA1, size) };
        first.push(ptr as usize);
    }

    let batch = first.clone();
    std::thread::spawn(move || {
        for addr in batch {
            unsafe { GLOBAL.dealloc(addr as *mut u8, layout) };
        }
    })
    .join()
    .unwrap();

    let mut second: Vec<usize> = Vec::with_capacity(count);
    for _ in 0..count {
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { ptr.write_bytes(0xB2, size) };
        second.push(ptr as usize);
    }

    let mut sorted = second.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), count, "overlapping blocks handed out");

    for &addr in &second {
        let ptr = addr as *mut u8;
        for i in 0..size {
            assert_eq!(unsafe { *ptr.add(i) }, 0xB2);
        }
        unsafe { GLOBAL.dealloc(ptr, layout) };
    }
}

#[test]
fn test_ring_of_threads() {
    // Each thread allocates and hands its blocks to the next thread in the
    // ring for freeing; every block is freed by a non-owner.
    let threads = 4;
    let per_thread = 500;

    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..threads {
        let (sender, receiver) = mpsc::channel::<(usize, usize)>();
        senders.push(sender);
        receivers.push(receiver);
    }
    // Thread t sends to thread t+1.
    senders.rotate_left(1);

    let handles: Vec<_> = senders
        .into_iter()
        .zip(receivers)
        .enumerate()
        .map(|(t, (sender, receiver))| {
            std::thread::spawn(move || {
                let sizes = [32usize, 96, 224, 1024, 3000];
                for i in 0..per_thread {
                    let size = sizes[(t + i) % sizes.len()];
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    let ptr = unsafe { GLOBAL.alloc(layout) };
                    assert!(!ptr.is_null());
                    unsafe { ptr.write_bytes((t + 1) as u8, size) };
                    sender.send((ptr as usize, size)).unwrap();
                }
                drop(sender);

                let mut freed = 0;
                while let Ok((addr, size)) = receiver.recv() {
                    let ptr = addr as *mut u8;
                    let layout = Layout::from_size_align(size, 8).unwrap();
                    unsafe { GLOBAL.dealloc(ptr, layout) };
                    freed += 1;
                }
                freed
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), per_thread);
    }
}
