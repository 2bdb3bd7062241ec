//! Fans the queued event stream out to registered handlers.
//!
//! One dispatcher thread per observer. Handlers run here, synchronously and
//! in registration order, with no locks held: the watch table is only locked
//! long enough to snapshot the matching handlers for one event. A panicking
//! handler is caught and logged; it never takes the observer down and never
//! propagates back into the queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, trace};

use crate::handler::EventHandler;
use crate::observer::WatchTable;
use crate::queue::{EventQueue, Slot};
use crate::Event;

pub(crate) struct Dispatcher {
	queue: Arc<EventQueue>,
	table: Arc<Mutex<WatchTable>>,
	timeout: Duration,
}

impl Dispatcher {
	pub fn new(queue: Arc<EventQueue>, table: Arc<Mutex<WatchTable>>, timeout: Duration) -> Self {
		Self {
			queue,
			table,
			timeout,
		}
	}

	/// Consumes the queue until the shutdown sentinel arrives.
	pub fn run(self) {
		debug!("dispatcher started");
		loop {
			match self.queue.get(self.timeout) {
				Some(Slot::Event { event, .. }) => self.dispatch(&event),
				Some(Slot::Overflow) => self.dispatch_overflow(),
				Some(Slot::Shutdown) => break,
				// Idle tick; loop back and wait again.
				None => continue,
			}
		}
		debug!("dispatcher exited");
	}

	fn dispatch(&self, event: &Event) {
		// Snapshot the matching handlers, then invoke without the lock.
		let targets: Vec<Arc<dyn EventHandler>> = {
			let table = self.table.lock().unwrap();
			table
				.entries()
				.filter(|entry| event.paths().any(|path| entry.watch.contains(path)))
				.flat_map(|entry| entry.handlers.iter().cloned())
				.collect()
		};

		trace!(%event, handlers = targets.len(), "dispatching");
		for handler in targets {
			if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
				if handler.accepts(event) {
					handler.on_event(event);
				}
			})) {
				error!(%event, "handler panicked: {}", panic_message(&panic));
			}
		}
	}

	fn dispatch_overflow(&self) {
		let targets: Vec<Arc<dyn EventHandler>> = {
			let table = self.table.lock().unwrap();
			table
				.entries()
				.flat_map(|entry| entry.handlers.iter().cloned())
				.collect()
		};

		debug!(handlers = targets.len(), "delivering overflow signal");
		for handler in targets {
			if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_overflow())) {
				error!("handler panicked on overflow signal: {}", panic_message(&panic));
			}
		}
	}
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
	if let Some(message) = panic.downcast_ref::<&'static str>() {
		message
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message
	} else {
		"non-string panic payload"
	}
}
