#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lookout::{Event, EventHandler, EventKind};

pub const WAIT: Duration = Duration::from_secs(5);
pub const TICK: Duration = Duration::from_millis(25);

/// One-time tracing setup so `RUST_LOG=lookout=trace` works in tests.
pub fn init_tracing() {
	static INIT: std::sync::Once = std::sync::Once::new();
	INIT.call_once(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.try_init();
	});
}

/// Records everything the dispatcher delivers, in order.
#[derive(Debug, Default)]
pub struct Collector {
	records: Mutex<Vec<Record>>,
}

#[derive(Debug, Clone)]
pub enum Record {
	Event(Event),
	Overflow,
}

impl Collector {
	pub fn records(&self) -> Vec<Record> {
		self.records.lock().unwrap().clone()
	}

	pub fn events(&self) -> Vec<Event> {
		self.records()
			.into_iter()
			.filter_map(|record| match record {
				Record::Event(event) => Some(event),
				Record::Overflow => None,
			})
			.collect()
	}

	pub fn overflow_count(&self) -> usize {
		self.records()
			.iter()
			.filter(|record| matches!(record, Record::Overflow))
			.count()
	}

	pub fn count_of(&self, kind: EventKind, path: &Path) -> usize {
		self.events()
			.iter()
			.filter(|event| event.kind == kind && event.src_path == path)
			.count()
	}

	/// Polls until `predicate` holds over the events seen so far, or the
	/// timeout elapses.
	pub fn wait_until(&self, predicate: impl Fn(&[Event]) -> bool) -> bool {
		let deadline = Instant::now() + WAIT;
		loop {
			if predicate(&self.events()) {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			std::thread::sleep(TICK);
		}
	}

	pub fn wait_for(&self, kind: EventKind, path: &Path) -> bool {
		self.wait_until(|events| {
			events
				.iter()
				.any(|event| event.kind == kind && event.src_path == path)
		})
	}
}

impl EventHandler for Collector {
	fn on_event(&self, event: &Event) {
		self.records
			.lock()
			.unwrap()
			.push(Record::Event(event.clone()));
	}

	fn on_overflow(&self) {
		self.records.lock().unwrap().push(Record::Overflow);
	}
}

/// Collector variant with a filter predicate, for exercising the
/// dispatcher's filtering hook.
#[derive(Debug, Default)]
pub struct ExtensionFilter {
	pub inner: Collector,
	pub extension: &'static str,
}

impl EventHandler for ExtensionFilter {
	fn on_event(&self, event: &Event) {
		self.inner.on_event(event);
	}

	fn accepts(&self, event: &Event) -> bool {
		event
			.src_path
			.extension()
			.is_some_and(|ext| ext == self.extension)
	}
}
