//! Notification backends, one per platform.
//!
//! Every backend speaks the same capability set (start, stop, add and
//! remove watches) and pushes normalized events into the observer's queue
//! through an [`EventSink`]. What differs per platform is how raw kernel
//! notifications are obtained and how much massaging they need before they
//! fit the uniform model; those quirks live entirely inside the backend
//! modules and never leak into the observer.

use std::path::Path;
use std::time::Duration;

use crate::observer::{EventSink, WatchId};
use crate::{Config, Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;

#[cfg(target_os = "macos")]
mod fsevents;

#[cfg(any(
	target_os = "macos",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
mod kqueue;

#[cfg(windows)]
mod windows;

mod poll;

/// The backend engines available across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AdapterKind {
	/// inotify (Linux, Android).
	Inotify,
	/// FSEvents (macOS).
	FsEvents,
	/// kqueue (BSDs; macOS fallback).
	Kqueue,
	/// `ReadDirectoryChangesW` (Windows).
	ReadDirectoryChanges,
	/// Snapshot-diff polling; works anywhere.
	Polling,
}

impl AdapterKind {
	/// The best backend available on the current platform.
	pub const fn recommended() -> Self {
		#[cfg(any(target_os = "linux", target_os = "android"))]
		return Self::Inotify;
		#[cfg(target_os = "macos")]
		return Self::FsEvents;
		#[cfg(any(
			target_os = "freebsd",
			target_os = "openbsd",
			target_os = "netbsd",
			target_os = "dragonfly"
		))]
		return Self::Kqueue;
		#[cfg(windows)]
		return Self::ReadDirectoryChanges;
		#[cfg(not(any(
			target_os = "linux",
			target_os = "android",
			target_os = "macos",
			target_os = "freebsd",
			target_os = "openbsd",
			target_os = "netbsd",
			target_os = "dragonfly",
			windows
		)))]
		return Self::Polling;
	}

	/// What this backend can and cannot report.
	pub const fn capabilities(self) -> Capabilities {
		match self {
			Self::Inotify => Capabilities {
				open_close_events: true,
				native_moves: true,
				synthetic_events: false,
			},
			Self::FsEvents => Capabilities {
				open_close_events: false,
				native_moves: true,
				synthetic_events: false,
			},
			Self::Kqueue => Capabilities {
				open_close_events: false,
				native_moves: true,
				synthetic_events: true,
			},
			Self::ReadDirectoryChanges => Capabilities {
				open_close_events: false,
				native_moves: true,
				synthetic_events: false,
			},
			Self::Polling => Capabilities {
				open_close_events: false,
				native_moves: true,
				synthetic_events: true,
			},
		}
	}
}

/// Per-backend support table.
///
/// `opened`/`closed` events only exist where the kernel reports them
/// (inotify); no other backend can synthesize them honestly. Backends with
/// `synthetic_events` derive part of their stream from snapshot diffing, so
/// a rename there may surface as a move or as delete + create depending on
/// what survived between two looks at the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
	pub open_close_events: bool,
	pub native_moves: bool,
	pub synthetic_events: bool,
}

/// The capability set every notification backend implements.
///
/// Implementations own their pump thread: `start` spawns it (or registers
/// with a platform-managed loop), `stop` kicks the kernel object the pump
/// blocks on and joins within the grace period. `stop` must be idempotent.
pub(crate) trait Adapter: Send {
	fn start(&mut self, sink: EventSink) -> Result<()>;

	fn stop(&mut self, grace: Duration);

	fn add_watch(&mut self, id: WatchId, path: &Path, recursive: bool) -> Result<()>;

	fn remove_watch(&mut self, id: WatchId) -> Result<()>;

	/// Number of kernel-level registrations currently held.
	fn watch_count(&self) -> usize;

	fn kind(&self) -> AdapterKind;
}

pub(crate) fn new_adapter(kind: AdapterKind, config: &Config) -> Result<Box<dyn Adapter>> {
	match kind {
		AdapterKind::Polling => Ok(Box::new(poll::PollingAdapter::new(config))),

		#[cfg(any(target_os = "linux", target_os = "android"))]
		AdapterKind::Inotify => Ok(Box::new(inotify::InotifyAdapter::new(config))),

		#[cfg(target_os = "macos")]
		AdapterKind::FsEvents => Ok(Box::new(fsevents::FsEventsAdapter::new(config))),

		#[cfg(any(
			target_os = "macos",
			target_os = "freebsd",
			target_os = "openbsd",
			target_os = "netbsd",
			target_os = "dragonfly"
		))]
		AdapterKind::Kqueue => Ok(Box::new(kqueue::KqueueAdapter::new(config))),

		#[cfg(windows)]
		AdapterKind::ReadDirectoryChanges => {
			Ok(Box::new(windows::ReadDirectoryChangesAdapter::new(config)))
		}

		other => Err(Error::os(
			format!("{other:?}"),
			std::io::Error::new(
				std::io::ErrorKind::Unsupported,
				"backend not available on this platform",
			),
		)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_inotify_reports_open_close() {
		for kind in [
			AdapterKind::FsEvents,
			AdapterKind::Kqueue,
			AdapterKind::ReadDirectoryChanges,
			AdapterKind::Polling,
		] {
			assert!(!kind.capabilities().open_close_events, "{kind:?}");
		}
		assert!(AdapterKind::Inotify.capabilities().open_close_events);
	}

	#[test]
	fn recommended_backend_is_constructible() {
		let adapter = new_adapter(AdapterKind::recommended(), &Config::default()).unwrap();
		assert_eq!(adapter.kind(), AdapterKind::recommended());
		assert_eq!(adapter.watch_count(), 0);
	}

	#[test]
	fn polling_backend_is_constructible_everywhere() {
		let adapter = new_adapter(AdapterKind::Polling, &Config::default()).unwrap();
		assert_eq!(adapter.kind(), AdapterKind::Polling);
	}
}
