//! Change notifications over KV long-poll watches.

mod cursor;
mod events;
mod watcher;

pub use cursor::WatchCursor;
pub use events::ChangeEvent;
pub use watcher::{ChangeWatcher, WatchKind, WatchSettings};
