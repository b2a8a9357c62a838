use std::collections::BinaryHeap;

use crate::Time;

/// Min-queue keyed on time. Entries with equal times come out in insertion order.
pub struct TimeQueue<T> {
    queue: BinaryHeap<TimeQueueEntry<T>>,
    sequence: u64,
}

impl<T> TimeQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            sequence: 0,
        }
    }
    pub fn peek(&self) -> Option<(Time, &T)> {
        self.queue.peek()
            .map(|TimeQueueEntry{time, value, ..}| (*time, value))
    }
    pub fn pop(&mut self) -> Option<(Time, T)> {
       self.queue.pop()
            .map(|TimeQueueEntry{time, value, ..}| (time, value))
    }
    pub fn push(&mut self, time: Time, value: T) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.queue.push(TimeQueueEntry { time, sequence, value });
    }
    pub fn len(&self) -> usize {
        self.queue.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Default for TimeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct TimeQueueEntry<T> {
    time: Time,
    sequence: u64,
    value: T,
}

impl<T> PartialEq for TimeQueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}
impl<T> Eq for TimeQueueEntry<T> {}

impl<T> PartialOrd for TimeQueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimeQueueEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap, so both keys are reversed
        self.time.cmp(&other.time)
            .then(self.sequence.cmp(&other.sequence))
            .reverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_time_then_insertion_order() {
        let mut queue = TimeQueue::new();
        queue.push(Time::from_nanos(30), "c");
        queue.push(Time::from_nanos(10), "a");
        queue.push(Time::from_nanos(30), "d");
        queue.push(Time::from_nanos(20), "b");

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|(_, v)| v).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }
}
