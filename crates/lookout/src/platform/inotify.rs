//! Linux backend over inotify.
//!
//! inotify is the best behaved of the native sources: per-operation records,
//! rename halves tied together by a cookie, and explicit open/close
//! visibility no other platform offers. Its one real gap is recursion (the
//! kernel watches single directories only), so descent is done in userspace:
//! every directory in a recursive tree gets its own kernel watch, newly
//! created subdirectories are registered as soon as their creation is seen,
//! and watches are torn down again when a directory leaves the tree. A
//! directory moved out of scope takes all descendant watches with it and
//! surfaces as synthetic deletions, since the kernel will never tell us what
//! happened to it afterwards.
//!
//! The pump blocks in `poll(2)` on the inotify descriptor plus an eventfd
//! that `stop` kicks, with the timeout bounded by the move grouper's next
//! expiry deadline.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::{Adapter, AdapterKind};
use crate::grouper::MoveGrouper;
use crate::observer::{EventSink, ThreadSlot, WatchId};
use crate::{Config, Error, Event, Result};

fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::DELETE_SELF
		| WatchMask::ATTRIB
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::MOVE_SELF
		| WatchMask::CLOSE_WRITE
		| WatchMask::CLOSE_NOWRITE
		| WatchMask::OPEN
		| WatchMask::MODIFY
}

/// One kernel watch: a single directory (or the root file) of some
/// scheduled watch.
#[derive(Debug, Clone)]
struct Node {
	watch_id: WatchId,
	path: PathBuf,
	is_root: bool,
	is_dir: bool,
	/// Whether new subdirectories seen under this node get registered too;
	/// inherited from the scheduled watch.
	recursive: bool,
}

#[derive(Debug, Default)]
struct Registry {
	by_wd: HashMap<WatchDescriptor, Node>,
	by_path: HashMap<PathBuf, WatchDescriptor>,
}

impl Registry {
	fn insert(&mut self, wd: WatchDescriptor, node: Node) {
		self.by_path.insert(node.path.clone(), wd.clone());
		self.by_wd.insert(wd, node);
	}

	fn remove_wd(&mut self, wd: &WatchDescriptor) -> Option<Node> {
		let node = self.by_wd.remove(wd)?;
		self.by_path.remove(&node.path);
		Some(node)
	}

	/// All kernel watches belonging to `watch_id`.
	fn descriptors_of(&self, watch_id: WatchId) -> Vec<WatchDescriptor> {
		self.by_wd
			.iter()
			.filter(|(_, node)| node.watch_id == watch_id)
			.map(|(wd, _)| wd.clone())
			.collect()
	}

	/// Kernel watches at or under `prefix`, deepest first so children are
	/// dropped before their parents.
	fn descriptors_under(&self, prefix: &Path) -> Vec<(WatchDescriptor, Node)> {
		let mut nodes: Vec<_> = self
			.by_wd
			.iter()
			.filter(|(_, node)| node.path.starts_with(prefix))
			.map(|(wd, node)| (wd.clone(), node.clone()))
			.collect();
		nodes.sort_by(|a, b| b.1.path.cmp(&a.1.path));
		nodes
	}

	/// After a directory moved within scope, its registered descendants are
	/// still watching the same inodes; only their recorded paths change.
	fn rewrite_prefix(&mut self, old: &Path, new: &Path) {
		let affected: Vec<WatchDescriptor> = self
			.by_wd
			.iter()
			.filter(|(_, node)| node.path.starts_with(old))
			.map(|(wd, _)| wd.clone())
			.collect();

		for wd in affected {
			let Some(node) = self.by_wd.get_mut(&wd) else {
				continue;
			};
			let suffix = node.path.strip_prefix(old).unwrap_or(&node.path).to_path_buf();
			let rewritten = new.join(suffix);
			self.by_path.remove(&node.path);
			self.by_path.insert(rewritten.clone(), wd.clone());
			node.path = rewritten;
		}
	}
}

/// The eventfd `stop` uses to interrupt the pump's `poll(2)`.
#[derive(Debug)]
struct WakeFd(RawFd);

impl WakeFd {
	fn new() -> io::Result<Self> {
		let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(Self(fd))
	}

	fn kick(&self) {
		let one: u64 = 1;
		let rc = unsafe {
			libc::write(
				self.0,
				std::ptr::addr_of!(one).cast(),
				std::mem::size_of::<u64>(),
			)
		};
		if rc < 0 {
			warn!("failed to kick pump wake fd: {}", io::Error::last_os_error());
		}
	}
}

impl Drop for WakeFd {
	fn drop(&mut self) {
		unsafe { libc::close(self.0) };
	}
}

pub(crate) struct InotifyAdapter {
	move_window: Duration,
	move_capacity: usize,
	registry: Arc<Mutex<Registry>>,
	watches: Option<Watches>,
	wake: Option<Arc<WakeFd>>,
	pump: Option<ThreadSlot>,
}

impl InotifyAdapter {
	pub fn new(config: &Config) -> Self {
		Self {
			move_window: config.move_window(),
			move_capacity: config.move_capacity(),
			registry: Arc::new(Mutex::new(Registry::default())),
			watches: None,
			wake: None,
			pump: None,
		}
	}
}

impl Adapter for InotifyAdapter {
	fn start(&mut self, sink: EventSink) -> Result<()> {
		let inotify = Inotify::init().map_err(|source| Error::os("inotify", source))?;
		let wake = Arc::new(WakeFd::new().map_err(|source| Error::os("eventfd", source))?);

		let watches = inotify.watches();
		self.watches = Some(watches.clone());

		let pump = Pump {
			inotify,
			watches,
			registry: self.registry.clone(),
			grouper: MoveGrouper::new(self.move_window, self.move_capacity),
			sink,
			wake: wake.clone(),
		};
		self.pump = Some(ThreadSlot::spawn("lookout-inotify", move || pump.run())?);
		self.wake = Some(wake);
		Ok(())
	}

	fn stop(&mut self, grace: Duration) {
		if let Some(wake) = self.wake.take() {
			wake.kick();
		}
		if let Some(pump) = self.pump.take() {
			pump.join_with_grace(grace);
		}
		self.watches = None;
		// The kernel watches died with the inotify descriptor.
		let mut registry = self.registry.lock().unwrap();
		registry.by_wd.clear();
		registry.by_path.clear();
	}

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		let Some(watches) = self.watches.as_mut() else {
			return Err(Error::NotRunning);
		};

		{
			let registry = self.registry.lock().unwrap();
			if registry.by_path.contains_key(path) {
				return Err(Error::WatchAlreadyExists(path.to_path_buf()));
			}
		}

		let is_dir = path.is_dir();
		let wd = watches
			.add(path, watch_mask())
			.map_err(|source| Error::os(path, source))?;
		self.registry.lock().unwrap().insert(
			wd,
			Node {
				watch_id: id,
				path: path.to_path_buf(),
				is_root: true,
				is_dir,
				recursive,
			},
		);

		if recursive && is_dir {
			register_subtree(watches, &self.registry, id, path, None);
		}
		Ok(())
	}

	fn remove_watch(&mut self, id: WatchId) -> Result<()> {
		let Some(watches) = self.watches.as_mut() else {
			return Err(Error::NotRunning);
		};

		let descriptors = {
			let registry = self.registry.lock().unwrap();
			registry.descriptors_of(id)
		};

		for wd in descriptors {
			// The kernel drops watches on its own when directories vanish;
			// EINVAL here just means it beat us to it.
			if let Err(e) = watches.remove(wd.clone()) {
				trace!("remove of kernel watch failed (likely already gone): {e}");
			}
			self.registry.lock().unwrap().remove_wd(&wd);
		}
		Ok(())
	}

	fn watch_count(&self) -> usize {
		self.registry.lock().unwrap().by_wd.len()
	}

	fn kind(&self) -> AdapterKind {
		AdapterKind::Inotify
	}
}

/// Registers kernel watches for every directory under `root` (exclusive).
/// With `sink` present, also emits synthetic creations for the entries
/// found: they may predate their directory's watch and would otherwise go
/// unreported.
fn register_subtree(
	watches: &mut Watches,
	registry: &Mutex<Registry>,
	watch_id: WatchId,
	root: &Path,
	sink: Option<&EventSink>,
) {
	for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
		let entry = match entry {
			Ok(entry) => entry,
			Err(e) => {
				trace!("skipping unreadable entry while registering subtree: {e}");
				continue;
			}
		};

		let is_dir = entry.file_type().is_dir();
		if is_dir {
			let path = entry.path();
			let already = registry.lock().unwrap().by_path.contains_key(path);
			if !already {
				match watches.add(path, watch_mask() | WatchMask::DONT_FOLLOW) {
					Ok(wd) => registry.lock().unwrap().insert(
						wd,
						Node {
							watch_id,
							path: path.to_path_buf(),
							is_root: false,
							is_dir: true,
							recursive: true,
						},
					),
					// Races with concurrent deletion are routine here.
					Err(e) => trace!(
						"could not register subdirectory {}: {e}",
						path.display()
					),
				}
			}
		}

		if let Some(sink) = sink {
			sink.emit(
				watch_id,
				Event::created(entry.path(), is_dir).into_synthetic(),
			);
		}
	}
}

struct Pump {
	inotify: Inotify,
	watches: Watches,
	registry: Arc<Mutex<Registry>>,
	grouper: MoveGrouper,
	sink: EventSink,
	wake: Arc<WakeFd>,
}

impl Pump {
	fn run(mut self) {
		debug!("inotify pump started");
		let inotify_fd = self.inotify.as_raw_fd();
		let mut buffer = [0u8; 4096];

		loop {
			let timeout_ms = self
				.grouper
				.next_deadline()
				.map(|d| d.as_millis().min(i32::MAX as u128) as i32)
				.unwrap_or(-1);

			let mut fds = [
				libc::pollfd {
					fd: inotify_fd,
					events: libc::POLLIN,
					revents: 0,
				},
				libc::pollfd {
					fd: self.wake.0,
					events: libc::POLLIN,
					revents: 0,
				},
			];

			let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
			if rc < 0 {
				let e = io::Error::last_os_error();
				if e.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				self.sink.fail(Error::os("inotify poll", e));
				return;
			}

			if fds[1].revents & libc::POLLIN != 0 {
				break;
			}

			if fds[0].revents & libc::POLLIN != 0 && !self.drain(&mut buffer) {
				return;
			}

			for expired in self.grouper.evict_expired() {
				self.resolve_departed(expired);
			}
		}

		// Dangling move-froms become deletions when observation ends.
		for event in self.grouper.flush() {
			self.resolve_departed(event);
		}
		debug!("inotify pump exited");
	}

	/// Reads until the kernel has nothing more. Returns `false` on terminal
	/// failure.
	fn drain(&mut self, buffer: &mut [u8]) -> bool {
		loop {
			let events = match self.inotify.read_events(buffer) {
				Ok(events) => events,
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
				Err(e) => {
					self.sink.fail(Error::os("inotify read", e));
					return false;
				}
			};

			let raw: Vec<(WatchDescriptor, EventMask, u32, Option<PathBuf>)> = events
				.map(|event| {
					(
						event.wd.clone(),
						event.mask,
						event.cookie,
						event.name.map(PathBuf::from),
					)
				})
				.collect();

			for (wd, mask, cookie, name) in raw {
				self.translate(wd, mask, cookie, name);
			}
		}
	}

	fn translate(&mut self, wd: WatchDescriptor, mask: EventMask, cookie: u32, name: Option<PathBuf>) {
		if mask.contains(EventMask::Q_OVERFLOW) {
			self.sink.overflow();
			return;
		}

		let node = {
			let registry = self.registry.lock().unwrap();
			registry.by_wd.get(&wd).cloned()
		};
		// Events may trail behind a removed watch; nothing to attribute
		// them to anymore.
		let Some(node) = node else {
			return;
		};

		if mask.contains(EventMask::IGNORED) {
			self.registry.lock().unwrap().remove_wd(&wd);
			return;
		}

		let path = match &name {
			Some(name) => node.path.join(name),
			None => node.path.clone(),
		};
		let is_dir = mask.contains(EventMask::ISDIR);
		trace!(?mask, path = %path.display(), cookie, "raw inotify event");

		if mask.contains(EventMask::CREATE) {
			self.sink.emit(node.watch_id, Event::created(&path, is_dir));
			if is_dir && node.recursive {
				register_subtree(
					&mut self.watches,
					&self.registry,
					node.watch_id,
					&path,
					Some(&self.sink),
				);
			}
		} else if mask.contains(EventMask::DELETE) {
			self.sink.emit(node.watch_id, Event::deleted(&path, is_dir));
		} else if mask.contains(EventMask::DELETE_SELF) {
			self.drop_node(&wd, &node, node.is_root);
		} else if mask.contains(EventMask::MOVE_SELF) {
			// Only meaningful for the root: subdirectory moves are tracked
			// through the parent's rename halves.
			if node.is_root {
				self.departed_subtree(&node.path);
				self.sink.emit(
					node.watch_id,
					Event::deleted(&node.path, node.is_dir).into_synthetic(),
				);
			}
		} else if mask.contains(EventMask::MOVED_FROM) {
			if let Some(flushed) = self.grouper.push_move_from(cookie, path, is_dir) {
				self.resolve_departed(flushed);
			}
		} else if mask.contains(EventMask::MOVED_TO) {
			let event = self.grouper.push_move_to(cookie, path.clone(), is_dir);
			let arrived_unpaired = event.dest_path.is_none();
			if !arrived_unpaired {
				if is_dir {
					self.registry
						.lock()
						.unwrap()
						.rewrite_prefix(&event.src_path, &path);
				}
				self.sink.emit(node.watch_id, event);
			} else {
				// Moved in from outside every watched tree.
				self.sink.emit(node.watch_id, event);
				if is_dir && node.recursive {
					register_subtree(
						&mut self.watches,
						&self.registry,
						node.watch_id,
						&path,
						Some(&self.sink),
					);
				}
			}
		} else if mask.contains(EventMask::ATTRIB) || mask.contains(EventMask::MODIFY) {
			self.sink.emit(node.watch_id, Event::modified(&path, is_dir));
		} else if mask.contains(EventMask::OPEN) {
			self.sink.emit(node.watch_id, Event::opened(&path, is_dir));
		} else if mask.contains(EventMask::CLOSE_WRITE) {
			self.sink.emit(node.watch_id, Event::closed_write(&path));
		} else if mask.contains(EventMask::CLOSE_NOWRITE) {
			self.sink
				.emit(node.watch_id, Event::closed_no_write(&path, is_dir));
		} else {
			trace!(?mask, "unhandled inotify mask");
		}
	}

	/// A move-from that will never pair: the object left every watched tree.
	/// Emits the deletion, and for directories also tears down descendant
	/// watches with one synthetic deletion each.
	fn resolve_departed(&mut self, deleted: Event) {
		let watch_id = {
			let registry = self.registry.lock().unwrap();
			registry
				.by_path
				.get(&deleted.src_path)
				.and_then(|wd| registry.by_wd.get(wd))
				.map(|node| node.watch_id)
		};

		let had_watches = watch_id.is_some();
		if had_watches {
			self.departed_subtree(&deleted.src_path);
		}
		// Attribution falls back to any live watch over the path's parent
		// when the object itself was not a watched directory.
		let watch_id = watch_id.or_else(|| self.owner_of(&deleted.src_path));
		if let Some(watch_id) = watch_id {
			self.sink.emit(watch_id, deleted);
		}
	}

	/// Removes every kernel watch at or under `prefix`, deepest first, and
	/// emits a synthetic deletion per descendant watch path.
	fn departed_subtree(&mut self, prefix: &Path) {
		let nodes = {
			let registry = self.registry.lock().unwrap();
			registry.descriptors_under(prefix)
		};

		for (wd, node) in nodes {
			if node.path != prefix {
				self.sink
					.emit(node.watch_id, Event::deleted(&node.path, true).into_synthetic());
			}
			if let Err(e) = self.watches.remove(wd.clone()) {
				trace!("remove of departed kernel watch failed: {e}");
			}
			self.registry.lock().unwrap().remove_wd(&wd);
		}
	}

	fn drop_node(&mut self, wd: &WatchDescriptor, node: &Node, emit: bool) {
		if emit {
			self.sink
				.emit(node.watch_id, Event::deleted(&node.path, node.is_dir));
		}
		self.registry.lock().unwrap().remove_wd(wd);
	}

	fn owner_of(&self, path: &Path) -> Option<WatchId> {
		let registry = self.registry.lock().unwrap();
		path.ancestors().skip(1).find_map(|ancestor| {
			registry
				.by_path
				.get(ancestor)
				.and_then(|wd| registry.by_wd.get(wd))
				.map(|node| node.watch_id)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(watch_id: WatchId, path: &str) -> Node {
		Node {
			watch_id,
			path: PathBuf::from(path),
			is_root: false,
			is_dir: true,
			recursive: true,
		}
	}

	fn descriptor(inotify: &Inotify, dir: &Path) -> WatchDescriptor {
		let mut watches = inotify.watches();
		watches.add(dir, WatchMask::CREATE).expect("kernel watch")
	}

	#[test]
	fn registry_rewrites_paths_after_directory_move() {
		let tmp = tempfile::tempdir().unwrap();
		let inotify = Inotify::init().unwrap();
		let id = WatchId::new();

		let mut registry = Registry::default();
		let wd = descriptor(&inotify, tmp.path());
		registry.insert(wd.clone(), node(id, "/w/old/sub"));

		registry.rewrite_prefix(Path::new("/w/old"), Path::new("/w/new"));
		assert_eq!(registry.by_wd[&wd].path, Path::new("/w/new/sub"));
		assert!(registry.by_path.contains_key(Path::new("/w/new/sub")));
		assert!(!registry.by_path.contains_key(Path::new("/w/old/sub")));
	}

	#[test]
	fn descriptors_under_orders_children_first() {
		let tmp = tempfile::tempdir().unwrap();
		let sub = tmp.path().join("sub");
		std::fs::create_dir(&sub).unwrap();
		let inotify = Inotify::init().unwrap();
		let id = WatchId::new();

		let mut registry = Registry::default();
		registry.insert(descriptor(&inotify, tmp.path()), node(id, "/w/dir"));
		registry.insert(descriptor(&inotify, &sub), node(id, "/w/dir/sub"));

		let under = registry.descriptors_under(Path::new("/w/dir"));
		let paths: Vec<_> = under.iter().map(|(_, n)| n.path.clone()).collect();
		assert_eq!(
			paths,
			vec![PathBuf::from("/w/dir/sub"), PathBuf::from("/w/dir")]
		);
	}

	#[test]
	fn adapter_counts_kernel_watches_across_subtree() {
		let tmp = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();

		let mut adapter = InotifyAdapter::new(&Config::default());
		let queue = Arc::new(crate::queue::EventQueue::new(None));
		let sink = crate::observer::test_sink(queue);
		adapter.start(sink).unwrap();

		let id = WatchId::new();
		adapter.add_watch(id, tmp.path(), true).unwrap();
		// Root, a, a/b.
		assert_eq!(adapter.watch_count(), 3);

		adapter.remove_watch(id).unwrap();
		assert_eq!(adapter.watch_count(), 0);

		adapter.stop(Duration::from_secs(5));
	}
}
