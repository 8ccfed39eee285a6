//! Key directory for end-to-end encrypted messaging.
//!
//! Stores each user's identity key, signed pre-keys and one-time pre-keys,
//! and serves pre-key bundles so a peer can run X3DH against a user who may be
//! offline. Only public key material ever reaches this service.

pub mod api;
pub mod bundle;
pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod monitor;
pub mod store;

pub use bundle::{BundleAssemblyService, PreKeyBundle};
pub use config::{DirectoryConfig, ServerArgs};
pub use error::{DirectoryError, StoreError};
pub use ingestion::{KeyIngestionService, KeyUpload, SignedPreKeyRotation, UploadReceipt};
pub use monitor::{
    ChannelNotifier, ExhaustionMonitor, LogNotifier, ReplenishmentEvent, ReplenishmentNotifier,
    ReplenishmentStatus,
};
pub use store::{Claim, Deadline, KeyStore, Lookup, MemoryKeyStore, Missing, SqliteKeyStore};
