//! Point-in-time inventory of a directory tree, keyed by inode identity.
//!
//! Snapshots are the diff basis whenever the raw kernel stream is lossy or
//! unavailable: the polling backend lives on them, and any consumer that
//! receives an overflow signal can rebuild its view by capturing a fresh
//! snapshot and diffing against its previous one. Because entries are keyed
//! by `(device, inode)` rather than by path, a rename that preserves the
//! inode shows up as a single move instead of a delete/create pair.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::trace;
use walkdir::WalkDir;

use crate::{Error, Event, Result};

/// Stable identity of a filesystem object: device id plus inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeIdentity {
	pub dev: u64,
	pub ino: u64,
}

impl InodeIdentity {
	#[cfg(unix)]
	fn of(metadata: &Metadata, _path: &Path) -> Self {
		use std::os::unix::fs::MetadataExt;

		Self {
			dev: metadata.dev(),
			ino: metadata.ino(),
		}
	}

	// Stable std exposes no volume serial / file index on Windows, so
	// identity degrades to a hash of the path there and cross-path moves
	// surface as delete + create.
	#[cfg(not(unix))]
	fn of(_metadata: &Metadata, path: &Path) -> Self {
		use std::hash::{Hash, Hasher};

		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		path.hash(&mut hasher);
		Self {
			dev: 0,
			ino: hasher.finish(),
		}
	}
}

/// Stat info retained per entry, enough to detect content changes.
#[derive(Debug, Clone)]
pub struct EntryInfo {
	pub path: PathBuf,
	pub is_directory: bool,
	pub size: u64,
	pub modified: Option<SystemTime>,
}

impl EntryInfo {
	fn of(path: PathBuf, metadata: &Metadata) -> Self {
		Self {
			is_directory: metadata.is_dir(),
			size: metadata.len(),
			modified: metadata.modified().ok(),
			path,
		}
	}
}

/// Inode-keyed inventory of a directory tree.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
	by_identity: HashMap<InodeIdentity, EntryInfo>,
	by_path: HashMap<PathBuf, InodeIdentity>,
}

impl Snapshot {
	/// Walks `root` and records every entry found, including `root` itself.
	///
	/// With `recursive` unset only `root` and its direct children are
	/// inventoried. Entries that vanish mid-walk are skipped; only a missing
	/// or unreadable root is an error.
	pub fn capture(root: &Path, recursive: bool, follow_symlinks: bool) -> Result<Self> {
		let root_metadata =
			std::fs::symlink_metadata(root).map_err(|source| Error::os(root, source))?;

		let mut snapshot = Self::default();
		snapshot.insert(root.to_path_buf(), &root_metadata);

		if !root_metadata.is_dir() {
			return Ok(snapshot);
		}

		let max_depth = if recursive { usize::MAX } else { 1 };
		let walker = WalkDir::new(root)
			.min_depth(1)
			.max_depth(max_depth)
			.follow_links(follow_symlinks);

		for entry in walker {
			let entry = match entry {
				Ok(entry) => entry,
				// Raced with a concurrent mutation; the next snapshot will
				// see the settled state.
				Err(e) => {
					trace!("skipping unreadable entry during snapshot: {e}");
					continue;
				}
			};

			match entry.metadata() {
				Ok(metadata) => snapshot.insert(entry.into_path(), &metadata),
				Err(e) => trace!("skipping unstatable entry during snapshot: {e}"),
			}
		}

		Ok(snapshot)
	}

	fn insert(&mut self, path: PathBuf, metadata: &Metadata) {
		let identity = InodeIdentity::of(metadata, &path);
		self.by_path.insert(path.clone(), identity);
		self.by_identity.insert(identity, EntryInfo::of(path, metadata));
	}

	pub fn len(&self) -> usize {
		self.by_identity.len()
	}

	pub fn is_empty(&self) -> bool {
		self.by_identity.is_empty()
	}

	pub fn contains_path(&self, path: &Path) -> bool {
		self.by_path.contains_key(path)
	}

	pub fn identity_of(&self, path: &Path) -> Option<InodeIdentity> {
		self.by_path.get(path).copied()
	}

	pub fn entry(&self, identity: InodeIdentity) -> Option<&EntryInfo> {
		self.by_identity.get(&identity)
	}

	/// Computes the synthetic events that transform `self` into `new`.
	///
	/// Emission order is deterministic: deletions, then moves, then
	/// creations, then modifications; within each kind, path-lexicographic
	/// (moves by source path). Consumers replaying the result against a
	/// mirror therefore never observe two live entries for one path.
	pub fn diff(&self, new: &Snapshot) -> Vec<Event> {
		let mut deleted = Vec::new();
		let mut moved = Vec::new();
		let mut created = Vec::new();
		let mut modified = Vec::new();

		for (identity, old_info) in &self.by_identity {
			match new.by_identity.get(identity) {
				None => deleted.push(Event::deleted(&old_info.path, old_info.is_directory)),
				Some(new_info) if new_info.path != old_info.path => {
					moved.push(Event::moved(
						&old_info.path,
						&new_info.path,
						new_info.is_directory,
					));
				}
				Some(new_info) => {
					if new_info.modified != old_info.modified || new_info.size != old_info.size {
						modified.push(Event::modified(&new_info.path, new_info.is_directory));
					}
				}
			}
		}

		for (identity, new_info) in &new.by_identity {
			if !self.by_identity.contains_key(identity) {
				created.push(Event::created(&new_info.path, new_info.is_directory));
			}
		}

		deleted.sort_by(|a, b| a.src_path.cmp(&b.src_path));
		moved.sort_by(|a, b| a.src_path.cmp(&b.src_path));
		created.sort_by(|a, b| a.src_path.cmp(&b.src_path));
		modified.sort_by(|a, b| a.src_path.cmp(&b.src_path));

		deleted
			.into_iter()
			.chain(moved)
			.chain(created)
			.chain(modified)
			.map(Event::into_synthetic)
			.collect()
	}
}
