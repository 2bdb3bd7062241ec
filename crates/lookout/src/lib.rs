//! Cross-platform filesystem observation.
//!
//! `lookout` reports changes to files and directories (creation, deletion,
//! modification, moves, attribute changes) in near-real time, using the
//! best native mechanism each operating system offers: inotify on Linux,
//! FSEvents on macOS, kqueue on the BSDs, `ReadDirectoryChangesW` on
//! Windows, and a snapshot-diff polling fallback anywhere else.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Platform backends** translate raw kernel notifications into the
//!   uniform [`Event`] model, including the state machines that pair rename
//!   halves and expand coalesced flag masks.
//! - **Event queue**: a bounded multi-producer single-consumer queue between
//!   the backend pump and the dispatcher, with first-class overflow
//!   signaling instead of silent loss.
//! - **Dispatcher**: one thread per observer that routes each event to every
//!   handler whose watch scope contains the event's path.
//! - **[`Observer`]**: the public facade binding one backend to one
//!   dispatcher and managing the lifecycle of watches and handlers.
//! - **[`Snapshot`]**: an inode-keyed inventory of a directory tree used as
//!   the diff basis by the polling backend and by consumers recovering from
//!   an overflow.
//!
//! # Guarantees, and non-guarantees
//!
//! Events from one backend reach handlers in the order the backend emitted
//! them, a move's source and destination are delivered atomically in one
//! event, and an overflow signal is never reordered past events that
//! followed the loss. Events from before an observation starts or after it
//! stops are not captured, kernel identifiers (cookies, inodes) are not
//! exposed, and a rename may surface as one move or as a deletion plus a
//! creation depending on what the platform reports and on watch scope.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lookout::{Config, Event, Observer};
//!
//! fn main() -> lookout::Result<()> {
//! 	let observer = Observer::recommended(Config::default())?;
//! 	observer.start()?;
//!
//! 	let handler = Arc::new(|event: &Event| {
//! 		println!("{} {}", event.kind, event.src_path.display());
//! 	});
//! 	observer.schedule(handler, "/some/directory", true)?;
//!
//! 	std::thread::sleep(std::time::Duration::from_secs(10));
//! 	observer.stop()
//! }
//! ```

mod config;
mod dispatcher;
mod error;
mod event;
mod grouper;
mod handler;
mod observer;
mod platform;
mod queue;
mod snapshot;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use handler::EventHandler;
pub use observer::{Observer, Watch, WatchId};
pub use platform::{AdapterKind, Capabilities};
pub use snapshot::{EntryInfo, InodeIdentity, Snapshot};
