//! Exercises bounded back-pressure: a queue of capacity 2 is filled, a
//! third add blocks until a consumer frees a slot, and the whole exchange
//! stays within the add timeout.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sc_queue::{QueueError, WorkQueue};

#[test]
fn third_add_blocks_until_a_slot_is_freed() {
    let queue = Arc::new(WorkQueue::<u32>::new(2).unwrap());
    queue.try_add(1).unwrap();
    queue.try_add(2).unwrap();
    assert!(queue.is_full());

    let consumer_queue = Arc::clone(&queue);
    let consumer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        consumer_queue.pop().unwrap()
    });

    let start = Instant::now();
    queue.add_timeout(3, Duration::from_secs(2)).unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed <= Duration::from_millis(2000));
    assert_eq!(consumer.join().unwrap(), 1);
    assert_eq!(queue.len(), 2);
}

#[test]
fn add_times_out_when_no_consumer_ever_pops() {
    let queue = WorkQueue::<u32>::new(1).unwrap();
    queue.try_add(0).unwrap();

    let start = Instant::now();
    let result = queue.add_timeout(1, Duration::from_millis(250));
    let elapsed = start.elapsed();

    assert_eq!(result, Err(QueueError::Timeout));
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed <= Duration::from_millis(800));
}

#[test]
fn many_producers_many_consumers_deliver_every_item_exactly_once() {
    let queue = Arc::new(WorkQueue::<u64>::new(16).unwrap());
    const PRODUCERS: u64 = 6;
    const PER_PRODUCER: u64 = 200;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.add(p * PER_PRODUCER + i).unwrap();
                }
            })
        })
        .collect();

    let (tx, rx) = std::sync::mpsc::channel();
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            thread::spawn(move || loop {
                match queue.pop_timeout(Duration::from_millis(500)) {
                    Ok(item) => tx.send(item).unwrap(),
                    Err(_) => break,
                }
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    drop(tx);

    for c in consumers {
        c.join().unwrap();
    }

    let mut received: Vec<u64> = rx.try_iter().collect();
    received.sort_unstable();
    let expected: Vec<u64> = (0..PRODUCERS * PER_PRODUCER).collect();
    assert_eq!(received, expected);
}
