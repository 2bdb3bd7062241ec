//! kqueue backend for the BSDs, and the macOS fallback.
//!
//! kqueue watches open file descriptors, not paths: every watched file and
//! directory holds an fd registered for `EVFILT_VNODE`, and the kernel only
//! says that *something* happened to that descriptor. Directory-level change
//! detail is recovered by re-listing the directory on every write
//! notification and diffing against the previous listing: creations and
//! deletions fall out of the name sets, renames out of matching inode
//! numbers across the two listings. Events derived this way are synthetic.
//!
//! Watch registration runs on the pump thread itself (callers hand over a
//! control message and wait for the reply), so descriptors are only ever
//! touched from one thread. Descriptors never outlive their watch, and
//! children are closed before their parent. The pump blocks in `kevent`;
//! `stop` and the control path wake it through a self-pipe registered in the
//! same kqueue.

use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{Adapter, AdapterKind};
use crate::observer::{EventSink, ThreadSlot, WatchId};
use crate::{Config, Error, Event, Result};

#[cfg(target_os = "macos")]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY;
#[cfg(not(target_os = "macos"))]
const OPEN_FLAGS: libc::c_int = libc::O_RDONLY;

const VNODE_FLAGS: u32 = libc::NOTE_DELETE
	| libc::NOTE_WRITE
	| libc::NOTE_EXTEND
	| libc::NOTE_ATTRIB
	| libc::NOTE_RENAME
	| libc::NOTE_REVOKE;

enum Control {
	Add {
		id: WatchId,
		path: PathBuf,
		recursive: bool,
		reply: mpsc::Sender<Result<()>>,
	},
	Remove {
		id: WatchId,
		reply: mpsc::Sender<Result<()>>,
	},
}

struct PipeWake {
	read_fd: libc::c_int,
	write_fd: libc::c_int,
}

impl PipeWake {
	fn new() -> io::Result<Self> {
		let mut fds = [0 as libc::c_int; 2];
		if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
			return Err(io::Error::last_os_error());
		}
		for fd in fds {
			unsafe {
				libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
				libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
			}
		}
		Ok(Self {
			read_fd: fds[0],
			write_fd: fds[1],
		})
	}

	fn kick(&self) {
		let byte = 1u8;
		let rc = unsafe { libc::write(self.write_fd, std::ptr::addr_of!(byte).cast(), 1) };
		if rc < 0 {
			warn!("failed to kick kqueue pump: {}", io::Error::last_os_error());
		}
	}

	fn drain(&self) {
		let mut buf = [0u8; 64];
		while unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
	}
}

impl Drop for PipeWake {
	fn drop(&mut self) {
		unsafe {
			libc::close(self.read_fd);
			libc::close(self.write_fd);
		}
	}
}

pub(crate) struct KqueueAdapter {
	control_tx: Option<mpsc::Sender<Control>>,
	wake: Option<Arc<PipeWake>>,
	stopping: Arc<AtomicBool>,
	pump: Option<ThreadSlot>,
	watch_count: Arc<AtomicUsize>,
}

impl KqueueAdapter {
	pub fn new(_config: &Config) -> Self {
		Self {
			control_tx: None,
			wake: None,
			stopping: Arc::new(AtomicBool::new(false)),
			pump: None,
			watch_count: Arc::new(AtomicUsize::new(0)),
		}
	}

	fn roundtrip(&self, message: impl FnOnce(mpsc::Sender<Result<()>>) -> Control) -> Result<()> {
		let (control_tx, wake) = match (&self.control_tx, &self.wake) {
			(Some(tx), Some(wake)) => (tx, wake),
			_ => return Err(Error::NotRunning),
		};

		let (reply_tx, reply_rx) = mpsc::channel();
		control_tx
			.send(message(reply_tx))
			.map_err(|_| Error::NotRunning)?;
		wake.kick();

		reply_rx
			.recv_timeout(Duration::from_secs(5))
			.map_err(|_| Error::NotRunning)?
	}
}

impl Adapter for KqueueAdapter {
	fn start(&mut self, sink: EventSink) -> Result<()> {
		let kq = unsafe { libc::kqueue() };
		if kq < 0 {
			return Err(Error::os("kqueue", io::Error::last_os_error()));
		}

		let wake = Arc::new(PipeWake::new().map_err(|source| Error::os("pipe", source))?);
		let (control_tx, control_rx) = mpsc::channel();

		let mut pump = Pump {
			kq,
			sink,
			control_rx,
			wake: wake.clone(),
			stopping: self.stopping.clone(),
			nodes: HashMap::new(),
			by_path: HashMap::new(),
			watch_count: self.watch_count.clone(),
		};
		pump.register_wake_pipe()
			.map_err(|source| Error::os("kqueue", source))?;

		self.pump = Some(ThreadSlot::spawn("lookout-kqueue", move || pump.run())?);
		self.control_tx = Some(control_tx);
		self.wake = Some(wake);
		Ok(())
	}

	fn stop(&mut self, grace: Duration) {
		self.stopping.store(true, Ordering::SeqCst);
		self.control_tx = None;
		if let Some(wake) = self.wake.take() {
			wake.kick();
		}
		if let Some(pump) = self.pump.take() {
			pump.join_with_grace(grace);
		}
	}

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		let path = path.to_path_buf();
		self.roundtrip(move |reply| Control::Add {
			id,
			path,
			recursive,
			reply,
		})
	}

	fn remove_watch(&mut self, id: WatchId) -> Result<()> {
		self.roundtrip(move |reply| Control::Remove { id, reply })
	}

	fn watch_count(&self) -> usize {
		self.watch_count.load(Ordering::SeqCst)
	}

	fn kind(&self) -> AdapterKind {
		AdapterKind::Kqueue
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildStat {
	ino: u64,
	is_dir: bool,
}

struct Node {
	fd: libc::c_int,
	path: PathBuf,
	watch_id: WatchId,
	is_root: bool,
	recursive: bool,
	/// Name → stat of each direct child; `None` for file nodes.
	listing: Option<HashMap<OsString, ChildStat>>,
}

struct Pump {
	kq: libc::c_int,
	sink: EventSink,
	control_rx: mpsc::Receiver<Control>,
	wake: Arc<PipeWake>,
	stopping: Arc<AtomicBool>,
	nodes: HashMap<libc::c_int, Node>,
	by_path: HashMap<PathBuf, libc::c_int>,
	watch_count: Arc<AtomicUsize>,
}

impl Pump {
	fn run(mut self) {
		debug!("kqueue pump started");
		let mut events: [libc::kevent; 16] = unsafe { std::mem::zeroed() };

		'pump: loop {
			let count = unsafe {
				libc::kevent(
					self.kq,
					std::ptr::null(),
					0,
					events.as_mut_ptr(),
					events.len() as libc::c_int,
					std::ptr::null(),
				)
			};
			if count < 0 {
				let e = io::Error::last_os_error();
				if e.kind() == io::ErrorKind::Interrupted {
					continue;
				}
				self.sink.fail(Error::os("kqueue wait", e));
				break;
			}

			for event in &events[..count as usize] {
				let ident = event.ident as libc::c_int;
				if ident == self.wake.read_fd {
					self.wake.drain();
					self.handle_control();
					if self.stopping.load(Ordering::SeqCst) {
						break 'pump;
					}
				} else {
					self.handle_vnode(ident, event.fflags as u32);
				}
			}
		}

		self.teardown();
		debug!("kqueue pump exited");
	}

	fn handle_control(&mut self) {
		while let Ok(control) = self.control_rx.try_recv() {
			match control {
				Control::Add {
					id,
					path,
					recursive,
					reply,
				} => {
					let result = self.add_root(id, &path, recursive);
					let _ = reply.send(result);
				}
				Control::Remove { id, reply } => {
					self.remove_all_of(id);
					let _ = reply.send(Ok(()));
				}
			}
		}
	}

	fn add_root(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		if self.by_path.contains_key(path) {
			return Err(Error::WatchAlreadyExists(path.to_path_buf()));
		}
		self.register(id, path, true, recursive)
			.map_err(|source| Error::os(path, source))?;
		Ok(())
	}

	/// Opens a descriptor for `path`, registers it with the kqueue, and for
	/// directories also registers the children (the whole subtree when
	/// recursive). Emits nothing; callers decide what the registration
	/// means.
	fn register(&mut self, id: WatchId, path: &Path, is_root: bool, recursive: bool) -> io::Result<()> {
		if self.by_path.contains_key(path) {
			return Ok(());
		}

		let c_path = CString::new(path.as_os_str().as_bytes())
			.map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
		let fd = unsafe { libc::open(c_path.as_ptr(), OPEN_FLAGS) };
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		if let Err(e) = self.kevent_register(fd) {
			unsafe { libc::close(fd) };
			return Err(e);
		}

		let metadata = std::fs::symlink_metadata(path)?;
		let is_dir = metadata.is_dir();
		let listing = if is_dir { Some(list_children(path)) } else { None };

		self.nodes.insert(
			fd,
			Node {
				fd,
				path: path.to_path_buf(),
				watch_id: id,
				is_root,
				recursive,
				listing,
			},
		);
		self.by_path.insert(path.to_path_buf(), fd);
		self.watch_count.fetch_add(1, Ordering::SeqCst);

		if is_dir {
			let children: Vec<(OsString, ChildStat)> = self
				.nodes
				.get(&fd)
				.and_then(|node| node.listing.as_ref())
				.map(|listing| listing.iter().map(|(k, v)| (k.clone(), *v)).collect())
				.unwrap_or_default();

			for (name, stat) in children {
				if stat.is_dir && !recursive {
					continue;
				}
				let child = path.join(&name);
				// Files always get a descriptor (that is the only way
				// kqueue can see their modifications); subdirectories only
				// inside recursive watches.
				if let Err(e) = self.register(id, &child, false, recursive) {
					trace!("could not register child {}: {e}", child.display());
				}
			}
		}
		Ok(())
	}

	fn kevent_register(&self, fd: libc::c_int) -> io::Result<()> {
		let mut change: libc::kevent = unsafe { std::mem::zeroed() };
		change.ident = fd as _;
		change.filter = libc::EVFILT_VNODE as _;
		change.flags = (libc::EV_ADD | libc::EV_CLEAR) as _;
		change.fflags = VNODE_FLAGS as _;

		let rc = unsafe {
			libc::kevent(
				self.kq,
				&change,
				1,
				std::ptr::null_mut(),
				0,
				std::ptr::null(),
			)
		};
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(())
	}

	fn register_wake_pipe(&mut self) -> io::Result<()> {
		let mut change: libc::kevent = unsafe { std::mem::zeroed() };
		change.ident = self.wake.read_fd as _;
		change.filter = libc::EVFILT_READ as _;
		change.flags = libc::EV_ADD as _;

		let rc = unsafe {
			libc::kevent(
				self.kq,
				&change,
				1,
				std::ptr::null_mut(),
				0,
				std::ptr::null(),
			)
		};
		if rc < 0 {
			return Err(io::Error::last_os_error());
		}
		Ok(())
	}

	fn handle_vnode(&mut self, fd: libc::c_int, fflags: u32) {
		let Some(node) = self.nodes.get(&fd) else {
			return;
		};
		let path = node.path.clone();
		let watch_id = node.watch_id;
		let is_dir = node.listing.is_some();
		let is_root = node.is_root;
		trace!(path = %path.display(), fflags, "raw kqueue event");

		if fflags & (libc::NOTE_DELETE | libc::NOTE_REVOKE) != 0 {
			self.drop_subtree(&path);
			self.sink.emit(watch_id, Event::deleted(&path, is_dir));
			return;
		}

		if fflags & libc::NOTE_RENAME != 0 {
			if is_root {
				// The watch root left our view; where it went is unknowable
				// through the descriptor alone.
				self.drop_subtree(&path);
				self.sink
					.emit(watch_id, Event::deleted(&path, is_dir).into_synthetic());
			}
			// Non-root renames are resolved by the parent directory's
			// write notification and its listing diff.
			return;
		}

		if is_dir && fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND) != 0 {
			self.rediff_directory(fd);
			return;
		}

		if fflags & (libc::NOTE_WRITE | libc::NOTE_EXTEND | libc::NOTE_ATTRIB) != 0 {
			self.sink.emit(watch_id, Event::modified(&path, is_dir));
		}
	}

	/// Something changed inside a watched directory: take a fresh child
	/// listing and derive events from the difference.
	fn rediff_directory(&mut self, fd: libc::c_int) {
		let (dir_path, watch_id, recursive, old_listing) = {
			let Some(node) = self.nodes.get(&fd) else {
				return;
			};
			(
				node.path.clone(),
				node.watch_id,
				node.recursive,
				node.listing.clone().unwrap_or_default(),
			)
		};

		let new_listing = list_children(&dir_path);
		if let Some(node) = self.nodes.get_mut(&fd) {
			node.listing = Some(new_listing.clone());
		}

		// Renames keep their inode across the two listings.
		let mut moved: Vec<(OsString, OsString, bool)> = Vec::new();
		for (old_name, old_stat) in &old_listing {
			if new_listing.contains_key(old_name) {
				continue;
			}
			if let Some((new_name, _)) = new_listing
				.iter()
				.find(|(name, stat)| stat.ino == old_stat.ino && !old_listing.contains_key(*name))
			{
				moved.push((old_name.clone(), new_name.clone(), old_stat.is_dir));
			}
		}

		for (old_name, old_stat) in &old_listing {
			if new_listing.contains_key(old_name)
				|| moved.iter().any(|(from, _, _)| from == old_name)
			{
				continue;
			}
			let gone = dir_path.join(old_name);
			self.drop_subtree(&gone);
			self.sink.emit(
				watch_id,
				Event::deleted(&gone, old_stat.is_dir).into_synthetic(),
			);
		}

		for (from_name, to_name, was_dir) in &moved {
			let from = dir_path.join(from_name);
			let to = dir_path.join(to_name);
			self.rewrite_prefix(&from, &to);
			self.sink
				.emit(watch_id, Event::moved(&from, &to, *was_dir).into_synthetic());
		}

		for (new_name, new_stat) in &new_listing {
			if old_listing.contains_key(new_name)
				|| moved.iter().any(|(_, to, _)| to == new_name)
			{
				continue;
			}
			let arrived = dir_path.join(new_name);
			self.sink.emit(
				watch_id,
				Event::created(&arrived, new_stat.is_dir).into_synthetic(),
			);
			if !new_stat.is_dir || recursive {
				if let Err(e) = self.register(watch_id, &arrived, false, recursive) {
					trace!("could not register new entry {}: {e}", arrived.display());
				}
			}
		}
	}

	/// Closes every descriptor at or under `prefix`, children before
	/// parents.
	fn drop_subtree(&mut self, prefix: &Path) {
		let mut victims: Vec<(libc::c_int, PathBuf)> = self
			.nodes
			.values()
			.filter(|node| node.path.starts_with(prefix))
			.map(|node| (node.fd, node.path.clone()))
			.collect();
		victims.sort_by(|a, b| b.1.cmp(&a.1));

		for (fd, path) in victims {
			self.nodes.remove(&fd);
			self.by_path.remove(&path);
			unsafe { libc::close(fd) };
			self.watch_count.fetch_sub(1, Ordering::SeqCst);
		}
	}

	fn rewrite_prefix(&mut self, old: &Path, new: &Path) {
		let affected: Vec<libc::c_int> = self
			.nodes
			.values()
			.filter(|node| node.path.starts_with(old))
			.map(|node| node.fd)
			.collect();

		for fd in affected {
			let Some(node) = self.nodes.get_mut(&fd) else {
				continue;
			};
			let suffix = node.path.strip_prefix(old).unwrap_or(&node.path).to_path_buf();
			let rewritten = new.join(suffix);
			self.by_path.remove(&node.path);
			self.by_path.insert(rewritten.clone(), fd);
			node.path = rewritten;
		}
	}

	fn remove_all_of(&mut self, id: WatchId) {
		let mut victims: Vec<PathBuf> = self
			.nodes
			.values()
			.filter(|node| node.watch_id == id)
			.map(|node| node.path.clone())
			.collect();
		// Children close before their parent.
		victims.sort_by(|a, b| b.cmp(a));

		for path in victims {
			if let Some(fd) = self.by_path.remove(&path) {
				self.nodes.remove(&fd);
				unsafe { libc::close(fd) };
				self.watch_count.fetch_sub(1, Ordering::SeqCst);
			}
		}
	}

	fn teardown(&mut self) {
		let mut paths: Vec<PathBuf> = self.nodes.values().map(|node| node.path.clone()).collect();
		paths.sort_by(|a, b| b.cmp(a));
		for path in paths {
			if let Some(fd) = self.by_path.remove(&path) {
				self.nodes.remove(&fd);
				unsafe { libc::close(fd) };
				self.watch_count.fetch_sub(1, Ordering::SeqCst);
			}
		}
		unsafe { libc::close(self.kq) };
	}
}

fn list_children(dir: &Path) -> HashMap<OsString, ChildStat> {
	let mut listing = HashMap::new();
	let Ok(entries) = std::fs::read_dir(dir) else {
		return listing;
	};
	for entry in entries.flatten() {
		if let Ok(metadata) = entry.path().symlink_metadata() {
			listing.insert(
				entry.file_name(),
				ChildStat {
					ino: metadata.ino(),
					is_dir: metadata.is_dir(),
				},
			);
		}
	}
	listing
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn listing_reports_names_inodes_and_kinds() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("file"), b"x").unwrap();
		std::fs::create_dir(dir.path().join("sub")).unwrap();

		let listing = list_children(dir.path());
		assert_eq!(listing.len(), 2);
		assert!(!listing[&OsString::from("file")].is_dir);
		assert!(listing[&OsString::from("sub")].is_dir);
	}

	#[test]
	fn missing_directory_lists_empty() {
		assert!(list_children(Path::new("/lookout/gone")).is_empty());
	}
}
