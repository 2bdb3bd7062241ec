//! Snapshot-diff polling backend.
//!
//! The fallback for platforms and filesystems without native notification:
//! every interval each watch re-captures a [`Snapshot`] and emits the diff
//! against the previous one. All events are synthetic by construction, and a
//! rename is only reported as a move when the inode survived between two
//! looks at the tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use super::{Adapter, AdapterKind};
use crate::observer::{EventSink, ThreadSlot, WatchId};
use crate::{Config, Result, Snapshot};

struct PollWatch {
	path: PathBuf,
	recursive: bool,
	snapshot: Snapshot,
}

pub(crate) struct PollingAdapter {
	interval: Duration,
	follow_symlinks: bool,
	watches: Arc<Mutex<HashMap<WatchId, PollWatch>>>,
	pump: Option<(ThreadSlot, mpsc::Sender<()>)>,
}

impl PollingAdapter {
	pub fn new(config: &Config) -> Self {
		Self {
			interval: config.poll_interval(),
			follow_symlinks: config.follow_symlinks(),
			watches: Arc::new(Mutex::new(HashMap::new())),
			pump: None,
		}
	}
}

impl Adapter for PollingAdapter {
	fn start(&mut self, sink: EventSink) -> Result<()> {
		let (stop_tx, stop_rx) = mpsc::channel();
		let watches = self.watches.clone();
		let interval = self.interval;
		let follow_symlinks = self.follow_symlinks;

		let slot = ThreadSlot::spawn("lookout-poll", move || {
			debug!(interval_ms = interval.as_millis() as u64, "polling pump started");
			loop {
				match stop_rx.recv_timeout(interval) {
					Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
					Err(mpsc::RecvTimeoutError::Timeout) => {
						poll_once(&watches, follow_symlinks, &sink);
					}
				}
			}
			debug!("polling pump exited");
		})?;

		self.pump = Some((slot, stop_tx));
		Ok(())
	}

	fn stop(&mut self, grace: Duration) {
		if let Some((slot, stop_tx)) = self.pump.take() {
			let _ = stop_tx.send(());
			slot.join_with_grace(grace);
		}
	}

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		let snapshot = Snapshot::capture(path, recursive, self.follow_symlinks)?;
		self.watches.lock().unwrap().insert(
			id,
			PollWatch {
				path: path.to_path_buf(),
				recursive,
				snapshot,
			},
		);
		Ok(())
	}

	fn remove_watch(&mut self, id: WatchId) -> Result<()> {
		self.watches.lock().unwrap().remove(&id);
		Ok(())
	}

	fn watch_count(&self) -> usize {
		self.watches.lock().unwrap().len()
	}

	fn kind(&self) -> AdapterKind {
		AdapterKind::Polling
	}
}

fn poll_once(
	watches: &Mutex<HashMap<WatchId, PollWatch>>,
	follow_symlinks: bool,
	sink: &EventSink,
) {
	let targets: Vec<(WatchId, PathBuf, bool)> = {
		let watches = watches.lock().unwrap();
		watches
			.iter()
			.map(|(id, w)| (*id, w.path.clone(), w.recursive))
			.collect()
	};

	for (id, path, recursive) in targets {
		// A vanished root diffs against the empty tree: everything previously
		// seen is reported deleted, and the watch keeps looking so a
		// reappearing root surfaces as creations.
		let current = Snapshot::capture(&path, recursive, follow_symlinks).unwrap_or_default();

		let mut watches = watches.lock().unwrap();
		// Unscheduled while we were off the lock capturing.
		let Some(watch) = watches.get_mut(&id) else {
			continue;
		};

		let events = watch.snapshot.diff(&current);
		watch.snapshot = current;
		drop(watches);

		if !events.is_empty() {
			trace!(watch = %id, count = events.len(), "polling diff produced events");
		}
		sink.emit_all(id, events);
	}
}
