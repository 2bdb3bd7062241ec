//! The public observation facade.
//!
//! An [`Observer`] binds one notification backend to one dispatcher and owns
//! the lifecycle of watches and handlers. Its life is linear: created, then
//! started, then stopped, never restarted. `schedule`, `unschedule` and friends
//! are safe to call from any thread at any time after start; the watch table
//! lock is held only across table mutation, never across handler invocation
//! or kernel I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::handler::EventHandler;
use crate::platform::{self, Adapter, AdapterKind};
use crate::queue::EventQueue;
use crate::{Config, Error, Event, Result};

/// Handle uniquely identifying a watch within one observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(Uuid);

impl WatchId {
	pub(crate) fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl std::fmt::Display for WatchId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

/// A registered request to observe a path, possibly with its descendants.
#[derive(Debug, Clone)]
pub struct Watch {
	id: WatchId,
	path: PathBuf,
	recursive: bool,
}

impl Watch {
	pub fn id(&self) -> WatchId {
		self.id
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn is_recursive(&self) -> bool {
		self.recursive
	}

	/// Whether `path` falls inside this watch's scope: the watched path
	/// itself, its direct children for flat watches, any descendant for
	/// recursive ones.
	pub fn contains(&self, path: &Path) -> bool {
		if path == self.path {
			return true;
		}
		if self.recursive {
			path.starts_with(&self.path)
		} else {
			path.parent() == Some(self.path.as_path())
		}
	}
}

pub(crate) struct WatchEntry {
	pub watch: Watch,
	pub handlers: Vec<Arc<dyn EventHandler>>,
}

/// Registration-ordered watch table; iteration order is dispatch order.
#[derive(Default)]
pub(crate) struct WatchTable {
	entries: Vec<WatchEntry>,
}

impl WatchTable {
	pub fn entries(&self) -> impl Iterator<Item = &WatchEntry> {
		self.entries.iter()
	}

	fn push(&mut self, entry: WatchEntry) {
		self.entries.push(entry);
	}

	fn find_equivalent_mut(&mut self, path: &Path, recursive: bool) -> Option<&mut WatchEntry> {
		self.entries
			.iter_mut()
			.find(|entry| entry.watch.path == path && entry.watch.recursive == recursive)
	}

	fn find_mut(&mut self, id: WatchId) -> Option<&mut WatchEntry> {
		self.entries.iter_mut().find(|entry| entry.watch.id == id)
	}

	fn remove(&mut self, id: WatchId) -> Option<WatchEntry> {
		let idx = self.entries.iter().position(|entry| entry.watch.id == id)?;
		Some(self.entries.remove(idx))
	}

	fn drain(&mut self) -> Vec<WatchEntry> {
		std::mem::take(&mut self.entries)
	}
}

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Producer-side handle the backends emit through: normalized events into
/// the queue, overflow signals, and the one-shot terminal error.
#[derive(Clone)]
pub(crate) struct EventSink {
	queue: Arc<EventQueue>,
	terminal: Arc<Mutex<Option<Error>>>,
	state: Arc<AtomicU8>,
}

impl EventSink {
	pub fn emit(&self, watch_id: WatchId, event: Event) {
		self.queue.put(event, watch_id);
	}

	pub fn emit_all(&self, watch_id: WatchId, events: impl IntoIterator<Item = Event>) {
		for event in events {
			self.emit(watch_id, event);
		}
	}

	/// Signals that events were lost inside the kernel or the backend.
	pub fn overflow(&self) {
		warn!("kernel notification queue overflowed, some events were lost");
		self.queue.mark_overflow();
	}

	/// One-shot terminal failure: records the error, stops observation.
	/// Later calls only log.
	pub fn fail(&self, error: Error) {
		error!(%error, "terminal backend failure, observation stops");
		{
			let mut slot = self.terminal.lock().unwrap();
			if slot.is_none() {
				*slot = Some(error);
			}
		}
		self.state.store(STOPPED, Ordering::SeqCst);
		self.queue.close();
	}
}

/// A spawned thread plus the channel that reports its exit, so shutdown can
/// wait with a bound instead of blocking forever on `join`.
pub(crate) struct ThreadSlot {
	handle: thread::JoinHandle<()>,
	done_rx: mpsc::Receiver<()>,
}

impl ThreadSlot {
	pub fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<Self> {
		let (done_tx, done_rx) = mpsc::channel::<()>();
		let handle = thread::Builder::new()
			.name(name.to_string())
			.spawn(move || {
				// Dropping the sender is the exit signal, panics included.
				let _done_tx = done_tx;
				body();
			})
			.map_err(|source| Error::os(name, source))?;
		Ok(Self { handle, done_rx })
	}

	/// Whether the thread exited within `timeout`. Safe to call repeatedly.
	#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
	pub fn wait(&self, timeout: Duration) -> bool {
		!matches!(
			self.done_rx.recv_timeout(timeout),
			Err(mpsc::RecvTimeoutError::Timeout)
		)
	}

	/// Waits up to `grace` for the thread to exit, then joins it. Past the
	/// grace period the thread is deliberately abandoned rather than
	/// forcibly freed, with a warning.
	pub fn join_with_grace(self, grace: Duration) {
		let name = self.handle.thread().name().unwrap_or("worker").to_string();
		match self.done_rx.recv_timeout(grace) {
			Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
				if self.handle.join().is_err() {
					error!(thread = %name, "thread exited by panic");
				}
			}
			Err(mpsc::RecvTimeoutError::Timeout) => {
				warn!(
					thread = %name,
					grace_ms = grace.as_millis() as u64,
					"thread did not exit within the grace period, abandoning it",
				);
			}
		}
	}
}

/// Observes filesystem changes through one notification backend and fans the
/// resulting event stream out to registered handlers.
///
/// ```no_run
/// use std::sync::Arc;
/// use lookout::{Config, Event, Observer};
///
/// fn main() -> lookout::Result<()> {
/// 	let observer = Observer::recommended(Config::default())?;
/// 	observer.start()?;
///
/// 	let handler = Arc::new(|event: &Event| println!("{event}"));
/// 	let watch = observer.schedule(handler, "/tmp", true)?;
///
/// 	std::thread::sleep(std::time::Duration::from_secs(5));
/// 	observer.unschedule(&watch)?;
/// 	observer.stop()
/// }
/// ```
pub struct Observer {
	config: Config,
	adapter: Mutex<Box<dyn Adapter>>,
	queue: Arc<EventQueue>,
	table: Arc<Mutex<WatchTable>>,
	state: Arc<AtomicU8>,
	terminal: Arc<Mutex<Option<Error>>>,
	dispatcher: Mutex<Option<ThreadSlot>>,
}

impl Observer {
	/// Builds an observer on the best backend available for this platform.
	pub fn recommended(config: Config) -> Result<Self> {
		Self::with_backend(AdapterKind::recommended(), config)
	}

	/// Builds an observer on an explicitly chosen backend; mostly useful for
	/// tests and for forcing the polling fallback.
	pub fn with_backend(kind: AdapterKind, config: Config) -> Result<Self> {
		let adapter = platform::new_adapter(kind, &config)?;
		Ok(Self {
			queue: Arc::new(EventQueue::new(config.queue_capacity())),
			config,
			adapter: Mutex::new(adapter),
			table: Arc::new(Mutex::new(WatchTable::default())),
			state: Arc::new(AtomicU8::new(CREATED)),
			terminal: Arc::new(Mutex::new(None)),
			dispatcher: Mutex::new(None),
		})
	}

	/// Shorthand for an observer on the polling backend.
	pub fn polling(config: Config) -> Result<Self> {
		Self::with_backend(AdapterKind::Polling, config)
	}

	pub fn backend(&self) -> AdapterKind {
		self.adapter.lock().unwrap().kind()
	}

	pub fn is_running(&self) -> bool {
		self.state.load(Ordering::SeqCst) == STARTED
	}

	/// Spawns the backend pump and the dispatcher thread.
	pub fn start(&self) -> Result<()> {
		self.state
			.compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
			.map_err(|_| Error::AlreadyRunning)?;

		let sink = EventSink {
			queue: self.queue.clone(),
			terminal: self.terminal.clone(),
			state: self.state.clone(),
		};

		{
			let mut adapter = self.adapter.lock().unwrap();
			if let Err(e) = adapter.start(sink) {
				self.state.store(STOPPED, Ordering::SeqCst);
				return Err(e);
			}

			// Watches scheduled before start are registered now, in
			// registration order.
			let recorded: Vec<Watch> = {
				let table = self.table.lock().unwrap();
				table.entries().map(|entry| entry.watch.clone()).collect()
			};
			for watch in recorded {
				if let Err(e) = adapter.add_watch(watch.id, &watch.path, watch.recursive) {
					adapter.stop(self.config.stop_grace());
					self.state.store(STOPPED, Ordering::SeqCst);
					return Err(e);
				}
			}
		}

		let dispatcher = Dispatcher::new(
			self.queue.clone(),
			self.table.clone(),
			self.config.queue_timeout(),
		);
		let slot = match ThreadSlot::spawn("lookout-dispatcher", move || dispatcher.run()) {
			Ok(slot) => slot,
			Err(e) => {
				self.adapter.lock().unwrap().stop(self.config.stop_grace());
				self.state.store(STOPPED, Ordering::SeqCst);
				return Err(e);
			}
		};
		*self.dispatcher.lock().unwrap() = Some(slot);

		debug!(backend = ?self.backend(), "observer started");
		Ok(())
	}

	/// Stops observation: kicks the backend pump, closes the queue, joins
	/// both threads within the configured grace period. Queued events are
	/// still delivered before the dispatcher exits. Idempotent once started.
	pub fn stop(&self) -> Result<()> {
		match self.state.swap(STOPPED, Ordering::SeqCst) {
			CREATED => {
				self.state.store(CREATED, Ordering::SeqCst);
				return Err(Error::NotRunning);
			}
			STARTED => {}
			_ => {
				// Already stopped, possibly by a terminal backend failure.
				// Fall through so threads get reaped exactly once.
			}
		}

		let grace = self.config.stop_grace();
		self.adapter.lock().unwrap().stop(grace);
		self.queue.close();

		if let Some(slot) = self.dispatcher.lock().unwrap().take() {
			slot.join_with_grace(grace);
		}

		debug!("observer stopped");
		Ok(())
	}

	/// Attaches `handler` to a watch on `path`.
	///
	/// An equivalent watch (same path, same recursive flag) is reused;
	/// otherwise a new kernel registration is created. Fails with
	/// [`Error::WatchPathDoesNotExist`] when `path` is absent, without
	/// touching any backend state.
	pub fn schedule(
		&self,
		handler: Arc<dyn EventHandler>,
		path: impl AsRef<Path>,
		recursive: bool,
	) -> Result<Watch> {
		let path = normalize_watch_path(path.as_ref())?;

		if let Some(watch) = self.try_attach(handler.clone(), &path, recursive) {
			return Ok(watch);
		}

		let watch = Watch {
			id: WatchId::new(),
			path,
			recursive,
		};

		if self.is_running() {
			let result = {
				let mut adapter = self.adapter.lock().unwrap();
				adapter.add_watch(watch.id, &watch.path, watch.recursive)
			};
			match result {
				Ok(()) => {}
				Err(Error::WatchAlreadyExists(_)) => {
					// Lost a race with a concurrent schedule of the same
					// path; attach to the winner.
					if let Some(existing) = self.try_attach(handler, &watch.path, recursive) {
						return Ok(existing);
					}
					return Err(Error::WatchAlreadyExists(watch.path));
				}
				Err(e) => return Err(e),
			}
		}

		self.table.lock().unwrap().push(WatchEntry {
			watch: watch.clone(),
			handlers: vec![handler],
		});

		debug!(watch = %watch.id, path = %watch.path.display(), recursive, "scheduled watch");
		Ok(watch)
	}

	fn try_attach(
		&self,
		handler: Arc<dyn EventHandler>,
		path: &Path,
		recursive: bool,
	) -> Option<Watch> {
		let mut table = self.table.lock().unwrap();
		let entry = table.find_equivalent_mut(path, recursive)?;
		entry.handlers.push(handler);
		Some(entry.watch.clone())
	}

	/// Removes the watch, all its handlers and the underlying kernel
	/// registration.
	pub fn unschedule(&self, watch: &Watch) -> Result<()> {
		let removed = self.table.lock().unwrap().remove(watch.id);
		if removed.is_some() && self.is_running() {
			self.adapter.lock().unwrap().remove_watch(watch.id)?;
		}
		debug!(watch = %watch.id, "unscheduled watch");
		Ok(())
	}

	/// Removes every watch and every handler.
	pub fn unschedule_all(&self) -> Result<()> {
		let drained = self.table.lock().unwrap().drain();
		if self.is_running() {
			let mut adapter = self.adapter.lock().unwrap();
			for entry in &drained {
				adapter.remove_watch(entry.watch.id)?;
			}
		}
		Ok(())
	}

	/// Attaches another handler to an existing watch. Unknown watches are
	/// ignored with a log line.
	pub fn add_handler_for_watch(&self, handler: Arc<dyn EventHandler>, watch: &Watch) {
		let mut table = self.table.lock().unwrap();
		match table.find_mut(watch.id) {
			Some(entry) => entry.handlers.push(handler),
			None => debug!(watch = %watch.id, "add_handler_for_watch on unknown watch"),
		}
	}

	/// Detaches a handler (by identity) from a watch. The watch itself is
	/// unscheduled when its last handler goes away.
	pub fn remove_handler_for_watch(&self, handler: &Arc<dyn EventHandler>, watch: &Watch) {
		let now_empty = {
			let mut table = self.table.lock().unwrap();
			match table.find_mut(watch.id) {
				Some(entry) => {
					entry.handlers.retain(|h| !Arc::ptr_eq(h, handler));
					entry.handlers.is_empty()
				}
				None => false,
			}
		};

		if now_empty {
			if let Err(e) = self.unschedule(watch) {
				warn!(watch = %watch.id, "failed to unschedule empty watch: {e}");
			}
		}
	}

	/// The terminal backend failure, if one occurred. Taking it resets the
	/// slot; after a terminal error the observer is stopped.
	pub fn take_terminal_error(&self) -> Option<Error> {
		self.terminal.lock().unwrap().take()
	}

	/// Number of live kernel-level registrations held by the backend.
	/// Diagnostic; recursive watches may map to many kernel watches.
	pub fn kernel_watch_count(&self) -> usize {
		self.adapter.lock().unwrap().watch_count()
	}
}

impl Drop for Observer {
	fn drop(&mut self) {
		if self.state.load(Ordering::SeqCst) != CREATED {
			let _ = self.stop();
		}
	}
}

#[cfg(test)]
pub(crate) fn test_sink(queue: Arc<EventQueue>) -> EventSink {
	EventSink {
		queue,
		terminal: Arc::new(Mutex::new(None)),
		state: Arc::new(AtomicU8::new(STARTED)),
	}
}

/// Validates existence and normalizes to an absolute path with no trailing
/// separator.
fn normalize_watch_path(path: &Path) -> Result<PathBuf> {
	if std::fs::symlink_metadata(path).is_err() {
		return Err(Error::WatchPathDoesNotExist(path.to_path_buf()));
	}
	let absolute = std::path::absolute(path).map_err(|source| Error::os(path, source))?;
	Ok(absolute.components().collect())
}
