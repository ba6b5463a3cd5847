//! civitai-sync - Keep local model files in step with the Civitai catalog
//!
//! Discovers safetensors files, validates and hashes them, and caches what the
//! catalog knows about each hash in a JSON sidecar next to the file, along with
//! an optional preview image.

pub mod config;
pub mod engine;
pub mod error;
pub mod maintenance;
pub mod models;
pub mod remote;
pub mod storage;

pub use config::SyncConfig;
pub use engine::{Reconciler, RunContext, RunStatus, SyncOptions, SyncReport, SyncStats};
pub use error::{SyncError, SyncResult};
pub use models::{ContentHash, LocalScanner, ModelFile, SidecarRecord};
pub use remote::{HttpCatalogClient, Lookup, ModelVersion, RemoteCatalog, RemoteError};
pub use storage::{FileSystemStorage, SidecarWriter, StorageBackend};
