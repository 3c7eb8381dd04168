//! Channel-backed keystore
//!
//! Named JSON stores persisted as messages in a Discord text channel. Values
//! are paginated across messages by [`codec`], rebuilt and de-duplicated by
//! [`index`], and served from memory by [`Keystore`].

pub mod backend;
pub mod codec;
mod debounce;
pub mod index;
mod store;

pub use backend::{ChannelInfo, MessageBackend, StoredMessage};
pub use codec::ChunkRecord;
pub use debounce::Debouncer;
pub use index::{LoadedStore, Reconstruction, ScanOptions};
pub use store::{Clock, Keystore, KeystoreStats, SyncReport};
