//! Concurrency and timing properties of the bounded buffer.

use courtier::BoundedBuffer;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// With N producers and M consumers, every pushed item is popped exactly
/// once and the observed occupancy never exceeds the capacity.
#[test]
fn concurrent_push_pop_is_exactly_once_and_bounded() {
    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: u64 = 1_000;
    const CAPACITY: usize = 64;

    let buffer = Arc::new(BoundedBuffer::with_capacity(CAPACITY));
    let received = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    // An observer hammers the size hint while traffic flows.
    let observer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut max_seen = 0;
            while !done.load(Ordering::Acquire) {
                max_seen = max_seen.max(buffer.size());
                thread::yield_now();
            }
            max_seen
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    buffer.push_front(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            let received = Arc::clone(&received);
            thread::spawn(move || loop {
                match buffer.pop_back_timeout(Duration::from_millis(200)) {
                    Ok(value) => received.lock().unwrap().push(value),
                    Err(_) => break,
                }
            })
        })
        .collect();

    for handle in producers {
        handle.join().unwrap();
    }
    for handle in consumers {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Release);
    let max_seen = observer.join().unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len() as u64, PRODUCERS * PER_PRODUCER);
    let distinct: HashSet<_> = received.iter().copied().collect();
    assert_eq!(distinct.len() as u64, PRODUCERS * PER_PRODUCER);
    assert!(
        max_seen <= CAPACITY,
        "observed occupancy {max_seen} > capacity {CAPACITY}"
    );
}

/// A timed push on a full buffer reports the timeout close to the deadline,
/// never noticeably before it.
#[test]
fn push_timeout_respects_the_deadline() {
    let buffer = BoundedBuffer::with_capacity(1);
    buffer.push_front(0u8);

    let deadline = Duration::from_millis(200);
    let start = Instant::now();
    let result = buffer.push_front_timeout(1u8, deadline);
    let elapsed = start.elapsed();

    assert!(result.is_err());
    assert!(
        elapsed >= deadline - Duration::from_millis(10),
        "returned after {elapsed:?}, before the {deadline:?} deadline"
    );
    assert!(
        elapsed <= deadline + Duration::from_millis(800),
        "returned after {elapsed:?}, far past the {deadline:?} deadline"
    );
}

/// Symmetric check for the pop side.
#[test]
fn pop_timeout_respects_the_deadline() {
    let buffer = BoundedBuffer::<u8>::with_capacity(4);

    let deadline = Duration::from_millis(200);
    let start = Instant::now();
    let result = buffer.pop_back_timeout(deadline);
    let elapsed = start.elapsed();

    assert!(result.is_err());
    assert!(elapsed >= deadline - Duration::from_millis(10));
    assert!(elapsed <= deadline + Duration::from_millis(800));
}

#[derive(Debug, Clone)]
enum Op {
    Push(u16),
    Pop,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u16>().prop_map(Op::Push), Just(Op::Pop)]
}

proptest! {
    /// Against a reference deque: FIFO order and the capacity bound hold for
    /// any sequence of non-blocking operations.
    #[test]
    fn matches_a_reference_deque(ops in prop::collection::vec(op_strategy(), 0..200)) {
        const CAPACITY: usize = 8;
        let buffer = BoundedBuffer::with_capacity(CAPACITY);
        let mut model = std::collections::VecDeque::new();

        for op in ops {
            match op {
                Op::Push(value) => {
                    let pushed = buffer.push_front_timeout(value, Duration::ZERO).is_ok();
                    prop_assert_eq!(pushed, model.len() < CAPACITY);
                    if pushed {
                        model.push_front(value);
                    }
                }
                Op::Pop => {
                    let popped = buffer.pop_back_timeout(Duration::ZERO).ok();
                    prop_assert_eq!(popped, model.pop_back());
                }
            }
            prop_assert!(buffer.size() <= CAPACITY);
            prop_assert_eq!(buffer.size(), model.len());
        }
    }
}
