//! Error types for the observation library.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for observation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by observers and their notification backends.
///
/// Queue overflow is deliberately not represented here: dropped events are
/// reported in-band through the overflow signal delivered to handlers, since
/// consumers need to see it in event order to know *when* their view of the
/// tree went stale.
#[derive(Debug, Error)]
pub enum Error {
	/// The target path was missing at registration time.
	#[error("watched path does not exist: {}", .0.display())]
	WatchPathDoesNotExist(PathBuf),

	/// A duplicate registration the backend cannot coalesce with an existing
	/// kernel subscription.
	#[error("watch already exists for path: {}", .0.display())]
	WatchAlreadyExists(PathBuf),

	/// Kernel-level failure: descriptor exhaustion, permission denied,
	/// unsupported filesystem, a dying notification stream.
	#[error("os observation failure at {}: {source}", .path.display())]
	OsObservation {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	/// The observer was already started.
	#[error("observer is already running")]
	AlreadyRunning,

	/// The operation requires a started observer.
	#[error("observer is not running")]
	NotRunning,
}

impl Error {
	pub(crate) fn os(path: impl Into<PathBuf>, source: io::Error) -> Self {
		Self::OsObservation {
			path: path.into(),
			source,
		}
	}
}
