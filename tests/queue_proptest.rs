use proptest::prelude::*;
use stage_pipeline::{BoundedQueue, Capacity, QueueReader, QueueWriter};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum Op {
    Write(usize),
    Read(usize),
}

fn op(max_block: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=max_block).prop_map(Op::Write),
        (1..=max_block).prop_map(Op::Read),
    ]
}

proptest! {
    /// Runs only the operations that would not block, mirroring them in a
    /// plain deque: the queue never exceeds its capacity, delivers in FIFO
    /// order and accounts for every element.
    #[test]
    fn queue_matches_fifo_model(
        capacity in 1_usize..8,
        ops in prop::collection::vec(op(8), 0..200),
    ) {
        let queue: BoundedQueue<u32> = BoundedQueue::new(capacity);
        let mut model = VecDeque::new();
        let mut next = 0u32;

        for op in ops {
            match op {
                Op::Write(n) if n <= capacity - model.len() => {
                    let mut block = queue.begin_write(n).unwrap();
                    for _ in 0..n {
                        block.push(next);
                        model.push_back(next);
                        next += 1;
                    }
                    queue.end_write(block);
                }
                Op::Read(n) if n <= model.len() => {
                    let block = queue.begin_read(n).unwrap();
                    let expected: Vec<u32> = model.drain(..n).collect();
                    prop_assert_eq!(block, expected);
                    queue.end_read(n);
                }
                _ => {}
            }

            prop_assert!(queue.len() <= queue.capacity());
            prop_assert_eq!(queue.len(), model.len());
            let metrics = queue.metrics();
            prop_assert_eq!(
                metrics.elements_written(),
                metrics.elements_read() + queue.len() as u64
            );
        }
    }

    #[test]
    fn interrupt_always_fails_blocking_calls(
        capacity in 1_usize..8,
        fill in 0_usize..8,
        repeats in 1_usize..5,
    ) {
        let queue: BoundedQueue<u8> = BoundedQueue::new(capacity);
        for _ in 0..fill.min(capacity) {
            queue.push_one(0).unwrap();
        }
        for _ in 0..repeats {
            queue.interrupt_read();
            queue.interrupt_write();
        }
        for _ in 0..repeats {
            prop_assert!(queue.begin_read(1).is_err());
            prop_assert!(queue.begin_write(1).is_err());
        }
        prop_assert_eq!(queue.len(), fill.min(capacity));
    }
}
