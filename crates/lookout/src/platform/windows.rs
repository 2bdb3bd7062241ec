//! Windows backend over overlapped `ReadDirectoryChangesW`.
//!
//! Each watched directory holds one overlapped read into a reusable buffer,
//! all completions funneled through a single I/O completion port the pump
//! thread blocks on. When a read completes its variable-length record list
//! is decoded, the rename halves (an old name immediately followed by a new
//! name in the same buffer) are paired into one move, and the read is
//! re-issued.
//! A zero-length completion is the kernel saying the buffer overflowed and
//! changes were dropped, which surfaces as an overflow signal.
//!
//! `stop` cancels every outstanding read and posts a wake packet; the pump
//! drains the aborted completions (freeing each watch's state exactly once)
//! and exits.

use std::collections::HashMap;
use std::ffi::{c_void, OsString};
use std::io;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};
use windows_sys::Win32::Foundation::{
	CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION_ADDED,
	FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
	FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS,
	FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
	FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
	FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
	FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
	CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
	OVERLAPPED,
};

use super::{Adapter, AdapterKind};
use crate::observer::{EventSink, ThreadSlot, WatchId};
use crate::{Config, Error, Event, Result};

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE
	| FILE_NOTIFY_CHANGE_SECURITY;

const BUFFER_LEN: usize = 64 * 1024;

/// The completion key reserved for the stop wake-up packet.
const WAKE_KEY: usize = 0;

/// `ReadDirectoryChangesW` wants a DWORD-aligned buffer.
#[repr(C, align(4))]
struct AlignedBuffer([u8; BUFFER_LEN]);

/// Per-directory state. Boxed and leaked at registration; the raw pointer
/// doubles as the completion key, and the pump frees it when the final
/// (cancelled) completion for the handle drains.
struct WatchState {
	handle: HANDLE,
	path: PathBuf,
	recursive: bool,
	watch_id: WatchId,
	cancelled: AtomicBool,
	overlapped: OVERLAPPED,
	buffer: AlignedBuffer,
}

struct SendHandle(HANDLE);
unsafe impl Send for SendHandle {}

pub(crate) struct ReadDirectoryChangesAdapter {
	port: Option<SendHandle>,
	sink: Option<EventSink>,
	watches: Mutex<HashMap<WatchId, usize>>,
	live_states: Arc<AtomicUsize>,
	pump: Option<ThreadSlot>,
}

impl ReadDirectoryChangesAdapter {
	pub fn new(_config: &Config) -> Self {
		Self {
			port: None,
			sink: None,
			watches: Mutex::new(HashMap::new()),
			live_states: Arc::new(AtomicUsize::new(0)),
			pump: None,
		}
	}
}

impl Adapter for ReadDirectoryChangesAdapter {
	fn start(&mut self, sink: EventSink) -> Result<()> {
		let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
		if port.is_null() {
			return Err(Error::os(
				"completion port",
				io::Error::last_os_error(),
			));
		}

		let pump = Pump {
			port: SendHandle(port),
			sink: sink.clone(),
			live_states: self.live_states.clone(),
		};
		self.pump = Some(ThreadSlot::spawn("lookout-rdcw", move || pump.run())?);
		self.port = Some(SendHandle(port));
		self.sink = Some(sink);
		Ok(())
	}

	fn stop(&mut self, grace: Duration) {
		let keys: Vec<usize> = {
			let mut watches = self.watches.lock().unwrap();
			watches.drain().map(|(_, key)| key).collect()
		};
		for key in keys {
			cancel_watch(key);
		}

		if let Some(port) = self.port.take() {
			unsafe {
				PostQueuedCompletionStatus(port.0, 0, WAKE_KEY, std::ptr::null_mut());
			}
			if let Some(pump) = self.pump.take() {
				pump.join_with_grace(grace);
			}
			unsafe { CloseHandle(port.0) };
		}
		self.sink = None;
	}

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()> {
		let port = self.port.as_ref().ok_or(Error::NotRunning)?;

		{
			let watches = self.watches.lock().unwrap();
			if watches.contains_key(&id) {
				return Err(Error::WatchAlreadyExists(path.to_path_buf()));
			}
		}

		let wide: Vec<u16> = path
			.as_os_str()
			.encode_wide()
			.chain(std::iter::once(0))
			.collect();
		let handle = unsafe {
			CreateFileW(
				wide.as_ptr(),
				FILE_LIST_DIRECTORY,
				FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
				std::ptr::null(),
				OPEN_EXISTING,
				FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
				std::ptr::null_mut(),
			)
		};
		if handle == INVALID_HANDLE_VALUE {
			return Err(Error::os(path, io::Error::last_os_error()));
		}

		let state = Box::into_raw(Box::new(WatchState {
			handle,
			path: path.to_path_buf(),
			recursive,
			watch_id: id,
			cancelled: AtomicBool::new(false),
			overlapped: unsafe { std::mem::zeroed() },
			buffer: AlignedBuffer([0; BUFFER_LEN]),
		}));
		let key = state as usize;

		let assoc = unsafe { CreateIoCompletionPort(handle, port.0, key, 0) };
		if assoc.is_null() {
			let e = io::Error::last_os_error();
			unsafe {
				CloseHandle(handle);
				drop(Box::from_raw(state));
			}
			return Err(Error::os(path, e));
		}

		if let Err(e) = unsafe { issue_read(&mut *state) } {
			unsafe {
				CloseHandle(handle);
				drop(Box::from_raw(state));
			}
			return Err(Error::os(path, e));
		}

		self.live_states.fetch_add(1, Ordering::SeqCst);
		self.watches.lock().unwrap().insert(id, key);
		debug!(watch = %id, path = %path.display(), "directory change read issued");
		Ok(())
	}

	fn remove_watch(&mut self, id: WatchId) -> Result<()> {
		let key = self.watches.lock().unwrap().remove(&id);
		if let Some(key) = key {
			cancel_watch(key);
		}
		Ok(())
	}

	fn watch_count(&self) -> usize {
		self.watches.lock().unwrap().len()
	}

	fn kind(&self) -> AdapterKind {
		AdapterKind::ReadDirectoryChanges
	}
}

/// Marks the state cancelled and aborts its outstanding read. The pump frees
/// the state when the aborted completion drains.
fn cancel_watch(key: usize) {
	let state = key as *mut WatchState;
	unsafe {
		(*state).cancelled.store(true, Ordering::SeqCst);
		CancelIoEx((*state).handle, std::ptr::null());
		CloseHandle((*state).handle);
	}
}

unsafe fn issue_read(state: &mut WatchState) -> io::Result<()> {
	state.overlapped = std::mem::zeroed();
	let ok = ReadDirectoryChangesW(
		state.handle,
		state.buffer.0.as_mut_ptr() as *mut c_void,
		BUFFER_LEN as u32,
		i32::from(state.recursive),
		NOTIFY_FILTER,
		std::ptr::null_mut(),
		&mut state.overlapped,
		None,
	);
	if ok == 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(())
}

struct Pump {
	port: SendHandle,
	sink: EventSink,
	live_states: Arc<AtomicUsize>,
}

impl Pump {
	fn run(self) {
		debug!("completion port pump started");
		let mut draining = false;

		loop {
			let mut bytes: u32 = 0;
			let mut key: usize = 0;
			let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();

			let ok = unsafe {
				GetQueuedCompletionStatus(self.port.0, &mut bytes, &mut key, &mut overlapped, INFINITE)
			};

			if key == WAKE_KEY {
				if overlapped.is_null() && ok == 0 {
					// The port itself died.
					self.sink
						.fail(Error::os("completion port", io::Error::last_os_error()));
					return;
				}
				draining = true;
				if self.live_states.load(Ordering::SeqCst) == 0 {
					break;
				}
				continue;
			}

			let state = key as *mut WatchState;

			if ok == 0 {
				let code = unsafe { GetLastError() };
				let cancelled = unsafe { (*state).cancelled.load(Ordering::SeqCst) };
				if !cancelled && code != ERROR_OPERATION_ABORTED {
					// The directory handle went bad underneath us, usually
					// because the watched directory itself was deleted.
					let path = unsafe { (*state).path.clone() };
					let watch_id = unsafe { (*state).watch_id };
					warn!(path = %path.display(), code, "directory watch failed, dropping it");
					self.sink.emit(watch_id, Event::deleted(&path, true));
				}
				unsafe { drop(Box::from_raw(state)) };
				if self.live_states.fetch_sub(1, Ordering::SeqCst) == 1 && draining {
					break;
				}
				continue;
			}

			if unsafe { (*state).cancelled.load(Ordering::SeqCst) } {
				unsafe { drop(Box::from_raw(state)) };
				if self.live_states.fetch_sub(1, Ordering::SeqCst) == 1 && draining {
					break;
				}
				continue;
			}

			if bytes == 0 {
				// Zero-length completion: the kernel dropped changes because
				// our buffer was full.
				self.sink.overflow();
			} else {
				let state_ref = unsafe { &*state };
				for event in decode_buffer(
					&state_ref.buffer.0[..bytes as usize],
					&state_ref.path,
				) {
					self.sink.emit(state_ref.watch_id, event);
				}
			}

			if let Err(e) = unsafe { issue_read(&mut *state) } {
				let path = unsafe { (*state).path.clone() };
				let watch_id = unsafe { (*state).watch_id };
				warn!(path = %path.display(), "could not re-issue directory read: {e}");
				self.sink.fail(Error::os(path, e));
				unsafe { drop(Box::from_raw(state)) };
				self.live_states.fetch_sub(1, Ordering::SeqCst);
				let _ = watch_id;
				return;
			}
		}

		debug!("completion port pump exited");
	}
}

/// Walks one completed notification buffer into uniform events.
///
/// Rename halves only pair when the new name immediately follows the old
/// name within this buffer; anything else degrades to independent deletion
/// and creation.
fn decode_buffer(buffer: &[u8], root: &Path) -> Vec<Event> {
	let mut events = Vec::new();
	let mut pending_old: Option<PathBuf> = None;
	let mut offset = 0usize;

	loop {
		if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > buffer.len() {
			break;
		}
		let record = unsafe { &*(buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
		let name_len = record.FileNameLength as usize / 2;
		let name_ptr = unsafe {
			std::slice::from_raw_parts(record.FileName.as_ptr(), name_len)
		};
		let name = OsString::from_wide(name_ptr);
		let path = root.join(name);

		// A pending old name pairs only with the record directly after it.
		if record.Action != FILE_ACTION_RENAMED_NEW_NAME {
			if let Some(old) = pending_old.take() {
				events.push(Event::deleted(&old, false));
			}
		}

		match record.Action {
			FILE_ACTION_ADDED => {
				events.push(Event::created(&path, is_directory(&path)));
			}
			FILE_ACTION_REMOVED => {
				// The object is gone; whether it was a directory is no
				// longer observable.
				events.push(Event::deleted(&path, false));
			}
			FILE_ACTION_MODIFIED => {
				events.push(Event::modified(&path, is_directory(&path)));
			}
			FILE_ACTION_RENAMED_OLD_NAME => {
				pending_old = Some(path);
			}
			FILE_ACTION_RENAMED_NEW_NAME => match pending_old.take() {
				Some(old) => events.push(Event::moved(&old, &path, is_directory(&path))),
				None => events.push(Event::created(&path, is_directory(&path))),
			},
			other => {
				trace!(action = other, path = %path.display(), "unhandled directory change action");
			}
		}

		if record.NextEntryOffset == 0 {
			break;
		}
		offset += record.NextEntryOffset as usize;
	}

	if let Some(old) = pending_old {
		events.push(Event::deleted(&old, false));
	}
	events
}

fn is_directory(path: &Path) -> bool {
	let wide: Vec<u16> = path
		.as_os_str()
		.encode_wide()
		.chain(std::iter::once(0))
		.collect();
	let attributes = unsafe { GetFileAttributesW(wide.as_ptr()) };
	attributes != INVALID_FILE_ATTRIBUTES && attributes & FILE_ATTRIBUTE_DIRECTORY != 0
}
