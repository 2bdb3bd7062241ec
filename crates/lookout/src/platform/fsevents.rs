//! macOS backend over the FSEvents API.
//!
//! FSEvents trades precision for throughput: each notification carries a
//! flag mask into which the kernel may have coalesced several distinct
//! changes to the same item, and a rename arrives as two independent
//! notifications with no cookie tying them together. This backend expands
//! every mask into uniform events in a fixed order (delete, move, create,
//! modify) and pairs rename halves within one callback batch, resolving the
//! unpaired leftovers by checking whether the path still exists: present
//! means something moved in, absent means it moved out.
//!
//! Streams are inherently recursive, so one stream is attached per watch
//! root. A non-recursive watch attaches at the parent instead and filters to
//! the watched path and its direct children. Each stream runs on its own
//! run-loop thread; `stop` stops the run loop and the thread tears the
//! stream down on its way out.

#![allow(non_upper_case_globals)]

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use tracing::{debug, trace, warn};

use super::{Adapter, AdapterKind};
use crate::observer::{EventSink, ThreadSlot, WatchId};
use crate::{Config, Error, Event, Result};

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct StreamFlags: u32 {
		const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
		const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
		const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
		const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
		const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
		const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
		const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
		const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
		const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
		const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
		const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
		const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
		const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
		const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
	}
}

impl StreamFlags {
	fn is_dir(self) -> bool {
		self.contains(Self::IS_DIR)
	}

	fn is_modified(self) -> bool {
		self.intersects(
			Self::ITEM_MODIFIED
				| Self::INODE_META_MOD
				| Self::FINDER_INFO_MOD
				| Self::ITEM_CHANGE_OWNER
				| Self::ITEM_XATTR_MOD,
		)
	}
}

#[derive(Debug, Clone)]
struct RawEntry {
	path: PathBuf,
	flags: StreamFlags,
}

#[derive(Debug, PartialEq, Eq)]
enum BatchItem {
	Event(Event),
	Overflow,
	RootChanged,
}

/// Expands one callback batch into uniform events.
///
/// Per entry the emission order is fixed: delete, move, create, modify.
/// Rename halves are paired within the batch (the earlier entry is the
/// source); an unpaired rename is resolved through `exists`: a live path is
/// the destination half of a move from outside the watched tree, a dead one
/// the source half of a move out of it.
fn normalize_batch(entries: &[RawEntry], exists: &dyn Fn(&Path) -> bool) -> Vec<BatchItem> {
	let mut items = Vec::new();

	// Pair up rename halves first.
	let renamed: Vec<usize> = entries
		.iter()
		.enumerate()
		.filter(|(_, e)| e.flags.contains(StreamFlags::ITEM_RENAMED))
		.map(|(idx, _)| idx)
		.collect();

	// rename_role[i]: what entry i's ITEM_RENAMED flag turned out to mean.
	let mut rename_role: HashMap<usize, RenameRole> = HashMap::new();
	let mut cursor = 0;
	while cursor < renamed.len() {
		let from = renamed[cursor];
		if cursor + 1 < renamed.len() {
			let to = renamed[cursor + 1];
			if !exists(&entries[from].path) && exists(&entries[to].path) {
				rename_role.insert(from, RenameRole::Source(entries[to].path.clone()));
				rename_role.insert(to, RenameRole::Destination);
				cursor += 2;
				continue;
			}
		}
		let role = if exists(&entries[from].path) {
			RenameRole::MovedIn
		} else {
			RenameRole::MovedOut
		};
		rename_role.insert(from, role);
		cursor += 1;
	}

	for (idx, entry) in entries.iter().enumerate() {
		let flags = entry.flags;
		if flags.contains(StreamFlags::HISTORY_DONE) {
			continue;
		}
		if flags.contains(StreamFlags::MUST_SCAN_SUBDIRS) {
			items.push(BatchItem::Overflow);
			continue;
		}
		if flags.contains(StreamFlags::ROOT_CHANGED) {
			items.push(BatchItem::RootChanged);
			continue;
		}

		let is_dir = flags.is_dir();
		let role = rename_role.get(&idx);

		if flags.contains(StreamFlags::ITEM_REMOVED) {
			items.push(BatchItem::Event(Event::deleted(&entry.path, is_dir)));
		}

		match role {
			Some(RenameRole::Source(dest)) => {
				items.push(BatchItem::Event(Event::moved(&entry.path, dest, is_dir)));
			}
			Some(RenameRole::MovedOut) => {
				items.push(BatchItem::Event(Event::deleted(&entry.path, is_dir)));
			}
			Some(RenameRole::MovedIn) => {
				items.push(BatchItem::Event(Event::created(&entry.path, is_dir)));
			}
			Some(RenameRole::Destination) | None => {}
		}

		// The destination half's created flag is an artifact of the rename
		// already reported above.
		if flags.contains(StreamFlags::ITEM_CREATED)
			&& !matches!(role, Some(RenameRole::Destination | RenameRole::MovedIn))
		{
			items.push(BatchItem::Event(Event::created(&entry.path, is_dir)));
		}

		if flags.is_modified() {
			items.push(BatchItem::Event(Event::modified(&entry.path, is_dir)));
		}
	}

	items
}

#[derive(Debug, Clone)]
enum RenameRole {
	/// First half of an in-scope rename; payload is the destination.
	Source(PathBuf),
	/// Second half of an in-scope rename, already reported at the source.
	Destination,
	/// Unpaired and the path exists: moved in from outside.
	MovedIn,
	/// Unpaired and the path is gone: moved out.
	MovedOut,
}

/// Context handed to the C callback, owned by the stream and released with
/// it.
struct StreamContext {
	sink: EventSink,
	watch_id: WatchId,
	watch_path: PathBuf,
	recursive: bool,
}

impl StreamContext {
	fn in_scope(&self, path: &Path) -> bool {
		if self.recursive {
			path.starts_with(&self.watch_path)
		} else {
			path == self.watch_path || path.parent() == Some(self.watch_path.as_path())
		}
	}
}

extern "C" fn release_context(info: *const c_void) {
	unsafe {
		drop(Box::from_raw(info as *mut StreamContext));
	}
}

extern "C" fn stream_callback(
	_stream_ref: fs::FSEventStreamRef,
	info: *mut c_void,
	num_events: usize,
	event_paths: *mut c_void,
	event_flags: *const fs::FSEventStreamEventFlags,
	_event_ids: *const fs::FSEventStreamEventId,
) {
	let result = std::panic::catch_unwind(move || {
		let ctx = unsafe { &*(info as *const StreamContext) };
		let paths = event_paths as *const *const c_char;

		let mut entries = Vec::with_capacity(num_events);
		for idx in 0..num_events {
			let path = unsafe { CStr::from_ptr(*paths.add(idx)) };
			let Ok(path) = path.to_str() else {
				continue;
			};
			let path = PathBuf::from(path);
			let flags = StreamFlags::from_bits_truncate(unsafe { *event_flags.add(idx) });

			trace!(path = %path.display(), ?flags, "raw fsevents entry");
			if ctx.in_scope(&path) || flags.contains(StreamFlags::ROOT_CHANGED) {
				entries.push(RawEntry { path, flags });
			}
		}

		for item in normalize_batch(&entries, &|path| path.symlink_metadata().is_ok()) {
			match item {
				BatchItem::Event(event) => ctx.sink.emit(ctx.watch_id, event),
				BatchItem::Overflow => ctx.sink.overflow(),
				BatchItem::RootChanged => {
					// Root renamed or deleted out from under the stream;
					// all we can honestly report is that it is gone.
					ctx.sink.emit(
						ctx.watch_id,
						Event::deleted(&ctx.watch_path, true).into_synthetic(),
					);
				}
			}
		}
	});
	if result.is_err() {
		warn!("panic inside fsevents stream callback");
	}
}

struct SendWrapper<T>(T);

// CFRunLoop references may be used from other threads per the Core
// Foundation threading rules.
unsafe impl<T> Send for SendWrapper<T> {}

struct StreamHandle {
	runloop: SendWrapper<cf::CFRunLoopRef>,
	thread: ThreadSlot,
}

impl StreamHandle {
	/// Stops the run loop and waits for the stream thread. The stop is
	/// re-issued until the thread reports exit, since a stop delivered
	/// before the loop enters its run state would be lost.
	fn stop(self, grace: Duration) {
		let deadline = Instant::now() + grace;
		loop {
			unsafe { cf::CFRunLoopStop(self.runloop.0) };
			if self.thread.wait(Duration::from_millis(50)) {
				self.thread.join_with_grace(Duration::ZERO);
				return;
			}
			if Instant::now() >= deadline {
				warn!("fsevents stream thread did not exit within the grace period");
				return;
			}
		}
	}
}

pub(crate) struct FsEventsAdapter {
	latency: Duration,
	stop_grace: Duration,
	sink: Option<EventSink>,
	streams: HashMap<WatchId, StreamHandle>,
}

impl FsEventsAdapter {
	pub fn new(config: &Config) -> Self {
		Self {
			latency: config.stream_latency(),
			stop_grace: config.stop_grace(),
			sink: None,
			streams: HashMap::new(),
		}
	}

	fn spawn_stream(&self, id: WatchId, path: &Path, recursive: bool) -> Result<StreamHandle> {
		let sink = self.sink.clone().ok_or(Error::NotRunning)?;

		// Streams are recursive by nature; a flat watch attaches one level
		// up and filters back down to direct children.
		let stream_root = if recursive {
			path.to_path_buf()
		} else {
			path.parent().unwrap_or(path).to_path_buf()
		};
		let root_str = stream_root
			.to_str()
			.ok_or_else(|| {
				Error::os(
					path,
					std::io::Error::new(std::io::ErrorKind::InvalidInput, "non-UTF-8 watch path"),
				)
			})?
			.to_string();

		let context = Box::into_raw(Box::new(StreamContext {
			sink,
			watch_id: id,
			watch_path: path.to_path_buf(),
			recursive,
		}));

		let latency = self.latency.as_secs_f64();
		let (runloop_tx, runloop_rx) = mpsc::channel();

		let thread = ThreadSlot::spawn("lookout-fsevents", move || {
			let stream_context = fs::FSEventStreamContext {
				version: 0,
				info: context as *mut c_void,
				retain: None,
				release: Some(release_context),
				copy_description: None,
			};

			unsafe {
				let paths = cf::CFArrayCreateMutable(
					cf::kCFAllocatorDefault,
					0,
					&cf::kCFTypeArrayCallBacks,
				);
				let mut err: cf::CFErrorRef = std::ptr::null_mut();
				let cf_path = cf::str_path_to_cfstring_ref(&root_str, &mut err);
				if cf_path.is_null() {
					if !err.is_null() {
						cf::CFRelease(err as cf::CFRef);
					}
					cf::CFRelease(paths);
					warn!("could not express stream root as CFString, stream not started");
					drop(Box::from_raw(context));
					return;
				}
				cf::CFArrayAppendValue(paths, cf_path);
				cf::CFRelease(cf_path);

				let stream = fs::FSEventStreamCreate(
					cf::kCFAllocatorDefault,
					stream_callback,
					&stream_context,
					paths,
					fs::kFSEventStreamEventIdSinceNow,
					latency,
					fs::kFSEventStreamCreateFlagFileEvents
						| fs::kFSEventStreamCreateFlagNoDefer
						| fs::kFSEventStreamCreateFlagWatchRoot,
				);
				cf::CFRelease(paths);

				let runloop = cf::CFRunLoopGetCurrent();
				fs::FSEventStreamScheduleWithRunLoop(stream, runloop, cf::kCFRunLoopDefaultMode);
				if fs::FSEventStreamStart(stream) == 0 {
					fs::FSEventStreamInvalidate(stream);
					fs::FSEventStreamRelease(stream);
					warn!("fsevents stream failed to start");
					return;
				}

				if runloop_tx.send(SendWrapper(runloop)).is_ok() {
					cf::CFRunLoopRun();
				}

				fs::FSEventStreamStop(stream);
				fs::FSEventStreamInvalidate(stream);
				fs::FSEventStreamRelease(stream);
			}
		})?;

		let runloop = runloop_rx
			.recv_timeout(Duration::from_secs(5))
			.map_err(|_| {
				Error::os(
					path,
					std::io::Error::new(
						std::io::ErrorKind::TimedOut,
						"fsevents stream thread failed to report its run loop",
					),
				)
			})?;

		debug!(watch = %id, root = %stream_root.display(), "fsevents stream attached");
		Ok(StreamHandle { runloop, thread })
	}
}

impl Adapter for FsEventsAdapter {
	fn start(&mut self, sink: EventSink) -> Result<()> {
		self.sink = Some(sink);
		Ok(())
	}

	fn stop(&mut self, grace: Duration) {
		for (_, handle) in self.streams.drain() {
			handle.stop(grace);
		}
		self.sink = None;
	}

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		if self.streams.contains_key(&id) {
			return Err(Error::WatchAlreadyExists(path.to_path_buf()));
		}
		let handle = self.spawn_stream(id, path, recursive)?;
		self.streams.insert(id, handle);
		Ok(())
	}

	fn remove_watch(&mut self, id: WatchId) -> Result<()> {
		if let Some(handle) = self.streams.remove(&id) {
			handle.stop(self.stop_grace);
		}
		Ok(())
	}

	fn watch_count(&self) -> usize {
		self.streams.len()
	}

	fn kind(&self) -> AdapterKind {
		AdapterKind::FsEvents
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::EventKind;

	fn entry(path: &str, flags: StreamFlags) -> RawEntry {
		RawEntry {
			path: PathBuf::from(path),
			flags,
		}
	}

	fn events(items: Vec<BatchItem>) -> Vec<Event> {
		items
			.into_iter()
			.filter_map(|item| match item {
				BatchItem::Event(event) => Some(event),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn coalesced_mask_expansion_order() {
		// One mask carrying removal, creation and modification expands into
		// distinct events, delete first, then create, then modify.
		let batch = [entry(
			"/w/f",
			StreamFlags::ITEM_REMOVED | StreamFlags::ITEM_CREATED | StreamFlags::ITEM_MODIFIED,
		)];
		let events = events(normalize_batch(&batch, &|_| true));

		let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
		assert_eq!(
			kinds,
			vec![EventKind::Deleted, EventKind::Created, EventKind::Modified]
		);
	}

	#[test]
	fn rename_halves_pair_into_one_move() {
		let batch = [
			entry("/w/a", StreamFlags::ITEM_RENAMED | StreamFlags::IS_FILE),
			entry("/w/b", StreamFlags::ITEM_RENAMED | StreamFlags::IS_FILE),
		];
		// Source is gone, destination exists.
		let events = events(normalize_batch(&batch, &|path| {
			path == Path::new("/w/b")
		}));

		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Moved);
		assert_eq!(events[0].src_path, Path::new("/w/a"));
		assert_eq!(events[0].dest_path.as_deref(), Some(Path::new("/w/b")));
	}

	#[test]
	fn unpaired_rename_of_live_path_is_a_creation() {
		let batch = [entry("/w/incoming", StreamFlags::ITEM_RENAMED)];
		let events = events(normalize_batch(&batch, &|_| true));
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Created);
	}

	#[test]
	fn unpaired_rename_of_dead_path_is_a_deletion() {
		let batch = [entry("/w/departed", StreamFlags::ITEM_RENAMED)];
		let events = events(normalize_batch(&batch, &|_| false));
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].kind, EventKind::Deleted);
	}

	#[test]
	fn must_scan_subdirs_surfaces_as_overflow() {
		let batch = [entry("/w", StreamFlags::MUST_SCAN_SUBDIRS)];
		let items = normalize_batch(&batch, &|_| true);
		assert_eq!(items, vec![BatchItem::Overflow]);
	}

	#[test]
	fn directory_flag_is_carried_through() {
		let batch = [entry(
			"/w/dir",
			StreamFlags::ITEM_CREATED | StreamFlags::IS_DIR,
		)];
		let events = events(normalize_batch(&batch, &|_| true));
		assert!(events[0].is_directory);
	}
}
