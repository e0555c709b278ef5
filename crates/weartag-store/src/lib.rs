//! Persistent registry of known wearable tags.
//!
//! [`Store`] keeps every tag that has connected before in a SQLite
//! database and implements [`weartag_core::TagRegistry`], so it can be
//! handed to a [`Tag`](weartag_core::Tag) or
//! [`TagManager`](weartag_core::TagManager) in place of the in-memory
//! registry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weartag_core::{BleTransportFactory, TagManager};
//! use weartag_store::Store;
//!
//! let store = Arc::new(Store::open_default()?);
//! let manager = TagManager::new(Arc::new(BleTransportFactory::default()), store.clone());
//!
//! for tag in store.list_tags()? {
//!     println!("{} ({})", tag.display_name, tag.identifier);
//! }
//! # Ok::<(), weartag_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::StoredTag;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/weartag/registry.db`
/// - macOS: `~/Library/Application Support/weartag/registry.db`
/// - Windows: `C:\Users\<user>\AppData\Local\weartag\registry.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("weartag")
        .join("registry.db")
}
