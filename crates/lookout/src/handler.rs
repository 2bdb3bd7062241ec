//! The consumer-facing handler capability.
//!
//! Anything that can react to an [`Event`] is a handler: a closure, a channel
//! sender, or a hand-written type carrying its own state. Handlers run on the
//! observer's dispatcher thread, one at a time, in registration order; they
//! must not assume reentrancy and should return quickly.

use crate::Event;

/// Consumer of events, invoked by the dispatcher.
pub trait EventHandler: Send + Sync + 'static {
	/// Called for every event whose path falls inside a watch this handler
	/// is attached to and that passes [`accepts`](Self::accepts).
	fn on_event(&self, event: &Event);

	/// Called when events were lost between the kernel and this handler.
	///
	/// Handlers that require completeness should respond by recomputing
	/// their state from a fresh [`Snapshot`](crate::Snapshot); everything
	/// delivered afterwards is younger than the loss.
	fn on_overflow(&self) {}

	/// Filter predicate applied before [`on_event`](Self::on_event). The
	/// default accepts everything; wrappers that classify paths (e.g. by
	/// glob) override this.
	fn accepts(&self, _event: &Event) -> bool {
		true
	}
}

impl<F> EventHandler for F
where
	F: Fn(&Event) + Send + Sync + 'static,
{
	fn on_event(&self, event: &Event) {
		(self)(event);
	}
}

/// Sends each event down a standard channel. Send failures are ignored: a
/// disconnected receiver just means the consumer went away.
impl EventHandler for std::sync::mpsc::Sender<Event> {
	fn on_event(&self, event: &Event) {
		let _ = self.send(event.clone());
	}
}

#[cfg(feature = "tokio")]
impl EventHandler for tokio::sync::mpsc::UnboundedSender<Event> {
	fn on_event(&self, event: &Event) {
		let _ = self.send(event.clone());
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[test]
	fn closures_are_handlers() {
		let hits = Arc::new(AtomicUsize::new(0));
		let handler = {
			let hits = hits.clone();
			move |_event: &Event| {
				hits.fetch_add(1, Ordering::SeqCst);
			}
		};

		handler.on_event(&Event::created("/tmp/a", false));
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn channel_senders_are_handlers() {
		let (tx, rx) = std::sync::mpsc::channel();
		tx.on_event(&Event::deleted("/tmp/a", false));

		let received = rx.try_recv().expect("event");
		assert_eq!(received.src_path, std::path::Path::new("/tmp/a"));
	}

	#[test]
	fn send_to_dropped_receiver_is_ignored() {
		let (tx, rx) = std::sync::mpsc::channel();
		drop(rx);
		tx.on_event(&Event::modified("/tmp/a", false));
	}
}
