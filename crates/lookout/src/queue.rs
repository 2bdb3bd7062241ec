//! Bounded multi-producer single-consumer event queue.
//!
//! Producers are the backend pump threads; the single consumer is the
//! dispatcher. The queue never blocks producers: when a capacity bound is hit
//! it discards the oldest queued event, counts the drop, and guarantees that
//! an overflow marker reaches the consumer before any event enqueued after
//! the drop. The marker is deduplicated while one is already in flight, so a
//! burst of drops surfaces as exactly one signal.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::observer::WatchId;
use crate::Event;

/// What the dispatcher pulls off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
	Event { event: Event, watch_id: WatchId },
	/// Events were lost, either in this queue or inside the kernel.
	/// Everything delivered after this marker is younger than the loss.
	Overflow,
	/// The queue was closed; no further slots will ever arrive.
	Shutdown,
}

#[derive(Debug, Default)]
struct Inner {
	slots: VecDeque<Slot>,
	/// Number of `Slot::Event`s currently queued. Markers are exempt from
	/// the capacity bound so a full queue can still signal the loss.
	event_count: usize,
	marker_queued: bool,
	dropped: u64,
	closed: bool,
}

#[derive(Debug)]
pub(crate) struct EventQueue {
	inner: Mutex<Inner>,
	not_empty: Condvar,
	capacity: Option<usize>,
}

impl EventQueue {
	pub fn new(capacity: Option<usize>) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			not_empty: Condvar::new(),
			capacity,
		}
	}

	/// Enqueues one event, dropping the oldest queued event first when the
	/// queue is at capacity. Never blocks. Events offered after close are
	/// discarded silently.
	pub fn put(&self, event: Event, watch_id: WatchId) {
		let mut inner = self.inner.lock().unwrap();
		if inner.closed {
			return;
		}

		if let Some(capacity) = self.capacity {
			while inner.event_count >= capacity {
				let oldest = inner
					.slots
					.iter()
					.position(|slot| matches!(slot, Slot::Event { .. }));
				let Some(idx) = oldest else { break };
				inner.slots.remove(idx);
				inner.event_count -= 1;
				inner.dropped += 1;

				if !inner.marker_queued {
					inner.slots.push_back(Slot::Overflow);
					inner.marker_queued = true;
				}
			}
		}

		inner.slots.push_back(Slot::Event { event, watch_id });
		inner.event_count += 1;
		drop(inner);
		self.not_empty.notify_one();
	}

	/// Queues an overflow marker, e.g. when the kernel itself reports a
	/// dropped-events condition. A no-op while a marker is already in flight.
	pub fn mark_overflow(&self) {
		let mut inner = self.inner.lock().unwrap();
		if inner.closed || inner.marker_queued {
			return;
		}
		inner.slots.push_back(Slot::Overflow);
		inner.marker_queued = true;
		drop(inner);
		self.not_empty.notify_one();
	}

	/// Blocks until a slot is available, the queue closes, or `timeout`
	/// elapses. `None` means timeout; the caller re-checks its shutdown flag
	/// and comes back.
	pub fn get(&self, timeout: Duration) -> Option<Slot> {
		let mut inner = self.inner.lock().unwrap();
		loop {
			if let Some(slot) = inner.slots.pop_front() {
				match &slot {
					Slot::Event { .. } => inner.event_count -= 1,
					Slot::Overflow => inner.marker_queued = false,
					Slot::Shutdown => {}
				}
				return Some(slot);
			}

			if inner.closed {
				return Some(Slot::Shutdown);
			}

			let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
			inner = guard;
			if result.timed_out() && inner.slots.is_empty() && !inner.closed {
				return None;
			}
		}
	}

	/// Closes the queue and wakes the consumer. Idempotent. Slots already
	/// queued are still delivered before the shutdown sentinel.
	pub fn close(&self) {
		let mut inner = self.inner.lock().unwrap();
		if !inner.closed {
			inner.closed = true;
			drop(inner);
			self.not_empty.notify_all();
		}
	}

	pub fn is_closed(&self) -> bool {
		self.inner.lock().unwrap().closed
	}

	/// Total number of events discarded due to the capacity bound.
	pub fn dropped(&self) -> u64 {
		self.inner.lock().unwrap().dropped
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::Arc;
	use std::time::Instant;

	const TICK: Duration = Duration::from_millis(50);

	fn event(n: usize) -> Event {
		Event::created(format!("/tmp/w/{n}"), false)
	}

	fn queue(capacity: impl Into<Option<usize>>) -> EventQueue {
		EventQueue::new(capacity.into())
	}

	#[test]
	fn fifo_within_capacity() {
		let q = queue(None);
		let id = WatchId::new();
		for n in 0..3 {
			q.put(event(n), id);
		}

		for n in 0..3 {
			match q.get(TICK) {
				Some(Slot::Event { event: e, watch_id }) => {
					assert_eq!(e.src_path, std::path::Path::new(&format!("/tmp/w/{n}")));
					assert_eq!(watch_id, id);
				}
				other => panic!("expected event, got {other:?}"),
			}
		}
		assert_eq!(q.get(TICK), None);
	}

	#[test]
	fn overflow_drops_oldest_and_marks_once() {
		let capacity = 8;
		let q = queue(capacity);
		let id = WatchId::new();

		// Fill past capacity while the consumer is "blocked".
		for n in 0..capacity + 10 {
			q.put(event(n), id);
		}
		assert_eq!(q.dropped(), 10);

		// First delivered slot is the overflow marker.
		assert_eq!(q.get(TICK), Some(Slot::Overflow));

		// The survivors are the newest `capacity` events, still in order.
		let mut survivors = Vec::new();
		while let Some(Slot::Event { event, .. }) = q.get(TICK) {
			survivors.push(event.src_path.clone());
		}
		let expected: Vec<_> = (10..capacity + 10)
			.map(|n| std::path::PathBuf::from(format!("/tmp/w/{n}")))
			.collect();
		assert_eq!(survivors, expected);
	}

	#[test]
	fn marker_not_repeated_without_further_drops() {
		let q = queue(2);
		let id = WatchId::new();
		for n in 0..5 {
			q.put(event(n), id);
		}

		let mut markers = 0;
		while let Some(slot) = q.get(TICK) {
			if slot == Slot::Overflow {
				markers += 1;
			}
		}
		assert_eq!(markers, 1);
	}

	#[test]
	fn marker_reappears_after_delivery_and_new_drop() {
		let q = queue(1);
		let id = WatchId::new();

		q.put(event(0), id);
		q.put(event(1), id);
		assert_eq!(q.get(TICK), Some(Slot::Overflow));
		assert!(matches!(q.get(TICK), Some(Slot::Event { .. })));

		// A fresh drop after the first marker was consumed queues a new one.
		q.put(event(2), id);
		q.put(event(3), id);
		assert_eq!(q.get(TICK), Some(Slot::Overflow));
	}

	#[test]
	fn kernel_overflow_marker_is_deduplicated() {
		let q = queue(None);
		q.mark_overflow();
		q.mark_overflow();
		assert_eq!(q.get(TICK), Some(Slot::Overflow));
		assert_eq!(q.get(TICK), None);
	}

	#[test]
	fn close_wakes_blocked_consumer_with_sentinel() {
		let q = Arc::new(queue(None));
		let consumer = {
			let q = q.clone();
			std::thread::spawn(move || q.get(Duration::from_secs(10)))
		};

		std::thread::sleep(TICK);
		q.close();
		q.close(); // idempotent

		assert_eq!(consumer.join().unwrap(), Some(Slot::Shutdown));
	}

	#[test]
	fn queued_slots_drain_before_sentinel() {
		let q = queue(None);
		q.put(event(0), WatchId::new());
		q.close();

		assert!(matches!(q.get(TICK), Some(Slot::Event { .. })));
		assert_eq!(q.get(TICK), Some(Slot::Shutdown));
	}

	#[test]
	fn get_times_out_on_empty_queue() {
		let q = queue(None);
		let start = Instant::now();
		assert_eq!(q.get(TICK), None);
		assert!(start.elapsed() >= TICK);
	}
}
