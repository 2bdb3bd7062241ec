//! The unified event model every notification backend normalizes into.
//!
//! Backends differ wildly in what they report natively: inotify hands out
//! per-operation records with rename cookies, FSEvents coalesces several
//! changes into one flag mask, kqueue only says "something happened to this
//! descriptor" and Windows delivers variable-length action buffers. Whatever
//! the source, consumers always see the same shape: one [`Event`] per logical
//! change, with an absolute source path and, for moves only, a destination.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What happened to the filesystem object at [`Event::src_path`].
///
/// `Opened`, `ClosedWrite` and `ClosedNoWrite` are only produced by the
/// inotify backend; no other platform reports them. See
/// [`Capabilities`](crate::Capabilities) for the per-backend support table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Created,
	Deleted,
	Modified,
	Moved,
	Opened,
	ClosedWrite,
	ClosedNoWrite,
}

impl EventKind {
	/// Stable string token for this kind.
	///
	/// These tokens are part of the public surface and never change:
	/// `"created"`, `"deleted"`, `"modified"`, `"moved"`, `"opened"`,
	/// `"closed"`, `"closed_no_write"`.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Created => "created",
			Self::Deleted => "deleted",
			Self::Modified => "modified",
			Self::Moved => "moved",
			Self::Opened => "opened",
			Self::ClosedWrite => "closed",
			Self::ClosedNoWrite => "closed_no_write",
		}
	}
}

impl std::fmt::Display for EventKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A single filesystem change.
///
/// `src_path` is always absolute and normalized (no trailing separator except
/// for the root). `dest_path` is present iff `kind == Moved`, in which case
/// it differs from `src_path` and is absolute as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub kind: EventKind,
	pub src_path: PathBuf,
	pub dest_path: Option<PathBuf>,
	pub is_directory: bool,
	/// `true` when this event was produced by snapshot diffing (polling
	/// backend, overflow recovery, descendant expansion of a directory move)
	/// rather than by a live kernel notification.
	pub is_synthetic: bool,
}

impl Event {
	pub fn created(path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self::new(EventKind::Created, path, is_directory)
	}

	pub fn deleted(path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self::new(EventKind::Deleted, path, is_directory)
	}

	pub fn modified(path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self::new(EventKind::Modified, path, is_directory)
	}

	pub fn opened(path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self::new(EventKind::Opened, path, is_directory)
	}

	pub fn closed_write(path: impl Into<PathBuf>) -> Self {
		Self::new(EventKind::ClosedWrite, path, false)
	}

	pub fn closed_no_write(path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self::new(EventKind::ClosedNoWrite, path, is_directory)
	}

	pub fn moved(
		src_path: impl Into<PathBuf>,
		dest_path: impl Into<PathBuf>,
		is_directory: bool,
	) -> Self {
		let src_path = src_path.into();
		let dest_path = dest_path.into();
		debug_assert!(src_path != dest_path);

		Self {
			kind: EventKind::Moved,
			src_path,
			dest_path: Some(dest_path),
			is_directory,
			is_synthetic: false,
		}
	}

	fn new(kind: EventKind, path: impl Into<PathBuf>, is_directory: bool) -> Self {
		Self {
			kind,
			src_path: path.into(),
			dest_path: None,
			is_directory,
			is_synthetic: false,
		}
	}

	/// Marks this event as derived from a snapshot diff.
	pub fn into_synthetic(mut self) -> Self {
		self.is_synthetic = true;
		self
	}

	/// Every path this event touches: the source, plus the destination for
	/// moves.
	pub fn paths(&self) -> impl Iterator<Item = &Path> {
		std::iter::once(self.src_path.as_path()).chain(self.dest_path.as_deref())
	}
}

impl std::fmt::Display for Event {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.dest_path {
			Some(dest) => write!(
				f,
				"{}: {} -> {}",
				self.kind,
				self.src_path.display(),
				dest.display()
			),
			None => write!(f, "{}: {}", self.kind, self.src_path.display()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_tokens_are_stable() {
		assert_eq!(EventKind::Created.as_str(), "created");
		assert_eq!(EventKind::Deleted.as_str(), "deleted");
		assert_eq!(EventKind::Modified.as_str(), "modified");
		assert_eq!(EventKind::Moved.as_str(), "moved");
		assert_eq!(EventKind::Opened.as_str(), "opened");
		assert_eq!(EventKind::ClosedWrite.as_str(), "closed");
		assert_eq!(EventKind::ClosedNoWrite.as_str(), "closed_no_write");
	}

	#[test]
	fn moved_carries_both_paths() {
		let event = Event::moved("/tmp/a", "/tmp/b", false);
		assert_eq!(event.kind, EventKind::Moved);
		assert_eq!(event.src_path, Path::new("/tmp/a"));
		assert_eq!(event.dest_path.as_deref(), Some(Path::new("/tmp/b")));
		assert_eq!(event.paths().count(), 2);
	}

	#[test]
	fn non_move_has_no_dest() {
		for event in [
			Event::created("/tmp/a", false),
			Event::deleted("/tmp/a", true),
			Event::modified("/tmp/a", false),
		] {
			assert!(event.dest_path.is_none());
			assert_eq!(event.paths().count(), 1);
		}
	}
}
