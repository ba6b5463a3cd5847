//! Local model file handling
//!
//! Provides functionality for:
//! - Discovering safetensors files and their sidecar records
//! - Validating container headers before trusting a file
//! - Computing content hashes
//! - Deciding when cached metadata is stale
//! - Naming and locating preview images

pub mod hash;
pub mod preview;
pub mod scanner;
pub mod sidecar;
pub mod validate;

pub use hash::{ContentHash, compute_hash};
pub use scanner::{HashPartition, LocalScanner, MetadataPartition, ModelFile};
pub use sidecar::{Freshness, FreshnessPolicy, ModelInfo, SidecarRecord, StaleReason, extract_hash};
pub use validate::validate_container;
