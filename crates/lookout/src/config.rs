//! Observer configuration.

use std::time::Duration;

/// Tunables for an [`Observer`](crate::Observer) and its notification
/// backend.
///
/// The defaults are production values; tests shrink the queue capacity and
/// the move window to exercise overflow and expiry paths deterministically.
#[derive(Debug, Clone)]
pub struct Config {
	queue_capacity: Option<usize>,
	queue_timeout: Duration,
	move_window: Duration,
	move_capacity: usize,
	stream_latency: Duration,
	poll_interval: Duration,
	stop_grace: Duration,
	follow_symlinks: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			queue_capacity: None,
			queue_timeout: Duration::from_secs(1),
			move_window: Duration::from_millis(500),
			move_capacity: 8192,
			stream_latency: Duration::from_millis(1),
			poll_interval: Duration::from_secs(1),
			stop_grace: Duration::from_secs(5),
			follow_symlinks: false,
		}
	}
}

impl Config {
	/// Bound the event queue. `None` (the default) keeps it unbounded; with a
	/// bound, the oldest queued event is discarded on overflow and handlers
	/// receive an overflow signal before the next delivered event.
	pub fn with_queue_capacity(mut self, capacity: impl Into<Option<usize>>) -> Self {
		self.queue_capacity = capacity.into();
		self
	}

	/// Maximum time the dispatcher waits on an empty queue before re-checking
	/// for shutdown.
	pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
		self.queue_timeout = timeout;
		self
	}

	/// How long a one-sided move-from is held before it degrades into a
	/// deletion.
	pub fn with_move_window(mut self, window: Duration) -> Self {
		self.move_window = window;
		self
	}

	/// Maximum number of pending move-from halves held at once; past it, the
	/// oldest pending entry is flushed as a deletion.
	pub fn with_move_capacity(mut self, capacity: usize) -> Self {
		self.move_capacity = capacity;
		self
	}

	/// FSEvents stream latency.
	pub fn with_stream_latency(mut self, latency: Duration) -> Self {
		self.stream_latency = latency;
		self
	}

	/// Snapshot interval of the polling backend.
	pub fn with_poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	/// How long `stop` waits for the pump and dispatcher threads before
	/// abandoning them with a warning.
	pub fn with_stop_grace(mut self, grace: Duration) -> Self {
		self.stop_grace = grace;
		self
	}

	/// Follow symlinks when walking trees for snapshots. Off by default;
	/// kernel backends never follow symlinks when recursing.
	pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
		self.follow_symlinks = follow;
		self
	}

	pub fn queue_capacity(&self) -> Option<usize> {
		self.queue_capacity
	}

	pub fn queue_timeout(&self) -> Duration {
		self.queue_timeout
	}

	pub fn move_window(&self) -> Duration {
		self.move_window
	}

	pub fn move_capacity(&self) -> usize {
		self.move_capacity
	}

	pub fn stream_latency(&self) -> Duration {
		self.stream_latency
	}

	pub fn poll_interval(&self) -> Duration {
		self.poll_interval
	}

	pub fn stop_grace(&self) -> Duration {
		self.stop_grace
	}

	pub fn follow_symlinks(&self) -> bool {
		self.follow_symlinks
	}
}
