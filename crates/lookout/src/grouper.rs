//! Joins the two halves of a rename into one move event.
//!
//! inotify reports a rename as separate move-from / move-to records tied
//! together by a correlation cookie, and nothing guarantees the second half
//! ever arrives: the destination may be outside every watched directory. Each
//! pending move-from is therefore held for a bounded window and degrades into
//! a deletion when it expires. An arriving move-to with no pending partner is
//! the mirror image (the source was out of scope) and degrades into a
//! creation.
//!
//! The pending map is bounded. Under pressure the oldest entry is flushed
//! early, as a deletion, so a flood of one-sided renames cannot grow memory
//! without limit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::Event;

#[derive(Debug)]
struct PendingMove {
	path: PathBuf,
	is_directory: bool,
	seen_at: Instant,
}

/// Single-threaded state machine run on the backend pump thread.
#[derive(Debug)]
pub(crate) struct MoveGrouper {
	window: Duration,
	capacity: usize,
	pending: HashMap<u32, PendingMove>,
	/// Cookie arrival order for capacity eviction. May contain cookies that
	/// were since matched; stale entries are skipped when popped.
	arrivals: VecDeque<u32>,
}

impl MoveGrouper {
	pub fn new(window: Duration, capacity: usize) -> Self {
		Self {
			window,
			capacity: capacity.max(1),
			pending: HashMap::new(),
			arrivals: VecDeque::new(),
		}
	}

	/// Records the from-half of a rename. Returns the deletion flushed to
	/// make room, if the map was at capacity.
	pub fn push_move_from(
		&mut self,
		cookie: u32,
		path: PathBuf,
		is_directory: bool,
	) -> Option<Event> {
		let mut flushed = None;
		if self.pending.len() >= self.capacity {
			flushed = self.evict_oldest();
		}

		self.pending.insert(
			cookie,
			PendingMove {
				path,
				is_directory,
				seen_at: Instant::now(),
			},
		);
		self.arrivals.push_back(cookie);
		flushed
	}

	/// Resolves the to-half of a rename: a move when the cookie is known, a
	/// creation when the source was never seen.
	pub fn push_move_to(&mut self, cookie: u32, path: PathBuf, is_directory: bool) -> Event {
		match self.pending.remove(&cookie) {
			Some(from) => {
				trace!(
					cookie,
					from = %from.path.display(),
					to = %path.display(),
					"paired rename",
				);
				Event::moved(from.path, path, is_directory)
			}
			None => Event::created(path, is_directory),
		}
	}

	/// Degrades every pending move-from older than the window into a
	/// deletion. Called from the pump's timer tick.
	pub fn evict_expired(&mut self) -> Vec<Event> {
		let window = self.window;
		let mut expired = Vec::new();
		self.pending.retain(|_, from| {
			if from.seen_at.elapsed() > window {
				expired.push(Event::deleted(std::mem::take(&mut from.path), from.is_directory));
				false
			} else {
				true
			}
		});
		expired
	}

	/// Time until the oldest pending entry expires, if any. Lets the pump
	/// size its poll timeout instead of ticking blindly.
	pub fn next_deadline(&self) -> Option<Duration> {
		self.pending
			.values()
			.map(|from| {
				self.window
					.checked_sub(from.seen_at.elapsed())
					.unwrap_or(Duration::ZERO)
			})
			.min()
	}

	/// Flushes everything still pending as deletions. Called on backend stop.
	pub fn flush(&mut self) -> Vec<Event> {
		self.arrivals.clear();
		self.pending
			.drain()
			.map(|(_, from)| Event::deleted(from.path, from.is_directory))
			.collect()
	}

	fn evict_oldest(&mut self) -> Option<Event> {
		while let Some(cookie) = self.arrivals.pop_front() {
			if let Some(from) = self.pending.remove(&cookie) {
				trace!(cookie, path = %from.path.display(), "pending move map full, flushing oldest");
				return Some(Event::deleted(from.path, from.is_directory));
			}
		}
		None
	}

	#[cfg(test)]
	fn pending_len(&self) -> usize {
		self.pending.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::EventKind;

	use std::path::Path;

	fn grouper(window: Duration) -> MoveGrouper {
		MoveGrouper::new(window, 8192)
	}

	#[test]
	fn pairs_from_and_to_into_one_move() {
		let mut g = grouper(Duration::from_millis(500));
		assert!(g.push_move_from(7, "/w/a.txt".into(), false).is_none());

		let event = g.push_move_to(7, "/w/b.txt".into(), false);
		assert_eq!(event.kind, EventKind::Moved);
		assert_eq!(event.src_path, Path::new("/w/a.txt"));
		assert_eq!(event.dest_path.as_deref(), Some(Path::new("/w/b.txt")));
		assert_eq!(g.pending_len(), 0);
	}

	#[test]
	fn unknown_cookie_becomes_creation() {
		let mut g = grouper(Duration::from_millis(500));
		let event = g.push_move_to(99, "/w/incoming.txt".into(), false);
		assert_eq!(event.kind, EventKind::Created);
		assert_eq!(event.src_path, Path::new("/w/incoming.txt"));
	}

	#[test]
	fn expired_from_becomes_deletion() {
		let mut g = grouper(Duration::from_millis(10));
		g.push_move_from(7, "/w/gone.txt".into(), false);

		assert!(g.evict_expired().is_empty());
		std::thread::sleep(Duration::from_millis(30));

		let expired = g.evict_expired();
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].kind, EventKind::Deleted);
		assert_eq!(expired[0].src_path, Path::new("/w/gone.txt"));

		// The cookie is spent; a late to-half now reads as a creation.
		let event = g.push_move_to(7, "/elsewhere/gone.txt".into(), false);
		assert_eq!(event.kind, EventKind::Created);
	}

	#[test]
	fn capacity_pressure_flushes_oldest_as_deletion() {
		let mut g = MoveGrouper::new(Duration::from_secs(60), 2);
		assert!(g.push_move_from(1, "/w/1".into(), false).is_none());
		assert!(g.push_move_from(2, "/w/2".into(), false).is_none());

		let flushed = g.push_move_from(3, "/w/3".into(), false).expect("flush");
		assert_eq!(flushed.kind, EventKind::Deleted);
		assert_eq!(flushed.src_path, Path::new("/w/1"));
		assert_eq!(g.pending_len(), 2);

		// Cookies 2 and 3 are still pairable.
		assert_eq!(g.push_move_to(2, "/w/2b".into(), false).kind, EventKind::Moved);
		assert_eq!(g.push_move_to(3, "/w/3b".into(), false).kind, EventKind::Moved);
	}

	#[test]
	fn eviction_skips_cookies_already_matched() {
		let mut g = MoveGrouper::new(Duration::from_secs(60), 2);
		g.push_move_from(1, "/w/1".into(), false);
		g.push_move_from(2, "/w/2".into(), false);
		let _ = g.push_move_to(1, "/w/1b".into(), false);

		// Cookie 1 is stale in the arrival order; the flush must hit 2.
		g.push_move_from(3, "/w/3".into(), false);
		let flushed = g.push_move_from(4, "/w/4".into(), false).expect("flush");
		assert_eq!(flushed.src_path, Path::new("/w/2"));
	}

	#[test]
	fn stop_flushes_all_pending_as_deletions() {
		let mut g = grouper(Duration::from_secs(60));
		g.push_move_from(1, "/w/1".into(), true);
		g.push_move_from(2, "/w/2".into(), false);

		let mut flushed = g.flush();
		flushed.sort_by(|a, b| a.src_path.cmp(&b.src_path));
		assert_eq!(flushed.len(), 2);
		assert!(flushed.iter().all(|e| e.kind == EventKind::Deleted));
		assert!(flushed[0].is_directory);
		assert_eq!(g.pending_len(), 0);
	}

	#[test]
	fn next_deadline_tracks_oldest_entry() {
		let mut g = grouper(Duration::from_millis(500));
		assert!(g.next_deadline().is_none());

		g.push_move_from(1, "/w/1".into(), false);
		let deadline = g.next_deadline().expect("deadline");
		assert!(deadline <= Duration::from_millis(500));
	}
}
