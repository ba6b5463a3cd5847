//! Reconciliation of local model files with the remote catalog
//!
//! One run moves every discovered file through the same pipeline:
//!
//! ```text
//! discover -> hash (validate first) -> metadata check -> fetch -> persist -> preview
//! ```
//!
//! Files are handled one at a time in discovery order and every result is
//! written as soon as it is known, so an interrupted run only leaves
//! unfinished files for the next one. Per-file failures are counted and
//! reported; only input errors and unexpected failures end a run early.

use crate::error::{SyncError, SyncResult};
use crate::models::preview::{has_preview, model_stem};
use crate::models::scanner::{
    known_hashes, partition_by_freshness, partition_by_hash, sidecar_path_for,
};
use crate::models::validate::{Rejection, inspect_container};
use crate::models::{ContentHash, FreshnessPolicy, LocalScanner, ModelFile, SidecarRecord, compute_hash};
use crate::remote::{Lookup, RemoteCatalog};
use crate::storage::{FileSystemStorage, SidecarWriter, StorageBackend};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

// ============================================================================
// Run Inputs
// ============================================================================

/// Parameters for one run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    pub root: PathBuf,
    pub max_age_days: u32,
    /// Treat every record as stale and replace existing previews
    pub force_refresh: bool,
    pub download_images: bool,
    /// Re-validate and re-hash files even when a hash is cached
    pub verify_hashes: bool,
    /// Files hashed concurrently; remote access stays sequential
    pub hash_workers: usize,
}

impl SyncOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age_days: 30,
            force_refresh: false,
            download_images: false,
            verify_hashes: false,
            hash_workers: 1,
        }
    }

    pub fn freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy::new(self.max_age_days, self.force_refresh)
    }
}

/// State scoped to a single invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    started: Instant,
    started_at: DateTime<Utc>,
    interrupt: Arc<AtomicBool>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::with_interrupt(Arc::new(AtomicBool::new(false)))
    }

    /// Use an externally owned interrupt flag, e.g. one set by a signal handler
    pub fn with_interrupt(interrupt: Arc<AtomicBool>) -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            interrupt,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wall-clock start, used as "now" for freshness decisions
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Run Results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub total_files: usize,
    pub files_needing_hash: usize,
    pub files_with_existing_hash: usize,
    pub files_needing_metadata: usize,
    pub hashes_computed: usize,
    /// Failed structural validation
    pub files_excluded: usize,
    /// No hash available to query with
    pub files_skipped: usize,
    /// Lookups that returned a model version
    pub metadata_fetched: usize,
    /// Full records written
    pub files_saved: usize,
    /// Not-found records written
    pub not_found: usize,
    pub images_downloaded: usize,
    pub errors: Vec<String>,
}

impl SyncStats {
    fn record_error(&mut self, file: &ModelFile, message: impl fmt::Display) {
        tracing::error!(file = %file.name(), error = %message, "File failed");
        self.errors.push(format!("{}: {}", file.name(), message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The folder holds no model files
    NothingToDo,
    /// Every file that needed hashing failed validation
    NoValidFiles,
    /// Stopped between files on request
    Interrupted,
    /// An unexpected error ended the run
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::NothingToDo => write!(f, "nothing to do"),
            RunStatus::NoValidFiles => write!(f, "no valid files"),
            RunStatus::Interrupted => write!(f, "interrupted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub status: RunStatus,
    pub stats: SyncStats,
    /// False only when an unexpected error escaped per-file handling
    pub success: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "Status:               {}", self.status)?;
        writeln!(f, "Elapsed:              {:.1}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Files found:          {}", s.total_files)?;
        writeln!(f, "Hashes computed:      {}", s.hashes_computed)?;
        writeln!(f, "Files excluded:       {}", s.files_excluded)?;
        writeln!(f, "Metadata fetched:     {}", s.metadata_fetched)?;
        writeln!(f, "Files saved:          {}", s.files_saved)?;
        writeln!(f, "Not found on remote:  {}", s.not_found)?;
        writeln!(f, "Images downloaded:    {}", s.images_downloaded)?;
        write!(f, "Errors:               {}", s.errors.len())?;
        for error in &s.errors {
            write!(f, "\n  - {}", error)?;
        }
        if let Some(error) = &self.error {
            write!(f, "\nRun aborted: {}", error)?;
        }
        Ok(())
    }
}

// ============================================================================
// Hashing
// ============================================================================

#[derive(Debug, Default)]
struct HashBatch {
    hashes: BTreeMap<PathBuf, ContentHash>,
    /// Files left out of everything downstream for this run
    excluded: BTreeSet<PathBuf>,
}

#[derive(Debug)]
enum HashOutcome {
    Hashed(ContentHash),
    Excluded(Rejection),
    Failed(SyncError),
}

/// Validate, then hash. Blocking.
fn hash_one(path: &Path) -> HashOutcome {
    match inspect_container(path) {
        Err(reason) => HashOutcome::Excluded(reason),
        Ok(header) => {
            if !header.has_metadata {
                tracing::warn!(file = %path.display(), "Safetensors header has no __metadata__ entry");
            }
            tracing::debug!(
                file = %path.display(),
                header_len = header.header_len,
                tensors = header.tensor_count,
                "Container validated"
            );
            match compute_hash(path) {
                Ok(hash) => HashOutcome::Hashed(hash),
                Err(e) => HashOutcome::Failed(e),
            }
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Drives one folder through hashing, metadata refresh and preview download
pub struct Reconciler {
    options: SyncOptions,
    catalog: Arc<dyn RemoteCatalog>,
    writer: SidecarWriter,
}

impl Reconciler {
    pub fn new(options: SyncOptions, catalog: Arc<dyn RemoteCatalog>) -> Self {
        Self::new_with_storage(options, catalog, Arc::new(FileSystemStorage::new()))
    }

    pub fn new_with_storage(
        options: SyncOptions,
        catalog: Arc<dyn RemoteCatalog>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            options,
            catalog,
            writer: SidecarWriter::new(storage),
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run a full reconciliation
    ///
    /// Fails before doing any work when the root is missing or not a
    /// directory. Anything that goes wrong later is reported in the returned
    /// [`SyncReport`].
    pub async fn run(&self, ctx: &RunContext) -> SyncResult<SyncReport> {
        let scanner = LocalScanner::new(&self.options.root)?;
        tracing::info!(
            root = %scanner.root().display(),
            images = self.options.download_images,
            force_refresh = self.options.force_refresh,
            verify_hashes = self.options.verify_hashes,
            max_age_days = self.options.max_age_days,
            "Starting sync"
        );

        let mut stats = SyncStats::default();
        let (status, success, error) = match self.reconcile(&scanner, ctx, &mut stats).await {
            Ok(status) => (status, true, None),
            Err(e) => {
                tracing::error!(error = %e, "Sync aborted");
                (RunStatus::Failed, false, Some(e.to_string()))
            }
        };

        let report = SyncReport {
            status,
            stats,
            success,
            error,
            elapsed: ctx.elapsed(),
        };
        tracing::info!(
            status = %report.status,
            total = report.stats.total_files,
            hashed = report.stats.hashes_computed,
            excluded = report.stats.files_excluded,
            fetched = report.stats.metadata_fetched,
            saved = report.stats.files_saved,
            not_found = report.stats.not_found,
            images = report.stats.images_downloaded,
            errors = report.stats.errors.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Sync finished"
        );
        Ok(report)
    }

    async fn reconcile(
        &self,
        scanner: &LocalScanner,
        ctx: &RunContext,
        stats: &mut SyncStats,
    ) -> SyncResult<RunStatus> {
        let files = scanner.discover()?;
        stats.total_files = files.len();
        if files.is_empty() {
            tracing::info!("No model files found");
            return Ok(RunStatus::NothingToDo);
        }

        // Hashes
        let partition = partition_by_hash(&files);
        let cached = known_hashes(&files);
        let to_hash = if self.options.verify_hashes {
            files.clone()
        } else {
            partition.need_hash
        };
        stats.files_needing_hash = to_hash.len();
        stats.files_with_existing_hash = partition.have_hash.len();

        let mut status = RunStatus::Completed;
        let batch = match self.hash_files(&to_hash, ctx, stats).await {
            Ok(batch) => batch,
            Err(SyncError::NoValidFiles { rejected }) => {
                tracing::warn!(rejected, "No valid files among those needing a hash");
                // Files with a cached hash can still be synced
                if rejected == files.len() {
                    status = RunStatus::NoValidFiles;
                }
                HashBatch {
                    hashes: BTreeMap::new(),
                    excluded: to_hash.iter().map(|f| f.path.clone()).collect(),
                }
            }
            Err(e) => return Err(e),
        };
        if ctx.is_interrupted() {
            self.keep_hashes(&batch.hashes, &cached, &BTreeSet::new()).await;
            return Ok(RunStatus::Interrupted);
        }
        ensure_root(scanner)?;

        // Cached metadata describes other bytes when the content changed
        let changed: BTreeSet<PathBuf> = batch
            .hashes
            .iter()
            .filter(|(path, hash)| cached.get(*path).is_some_and(|old| old != *hash))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &changed {
            tracing::warn!(file = %path.display(), "Content hash changed, refreshing metadata");
        }

        // Metadata
        let candidates: Vec<ModelFile> = files
            .into_iter()
            .filter(|f| !batch.excluded.contains(&f.path))
            .collect();
        let freshness = partition_by_freshness(
            &candidates,
            &self.options.freshness_policy(),
            ctx.started_at(),
        );
        let stale: BTreeSet<&Path> = freshness
            .need_metadata
            .iter()
            .map(|f| f.path.as_path())
            .collect();
        let need_metadata: Vec<&ModelFile> = candidates
            .iter()
            .filter(|f| stale.contains(f.path.as_path()) || changed.contains(&f.path))
            .collect();
        stats.files_needing_metadata = need_metadata.len();

        let mut refreshed: BTreeSet<PathBuf> = BTreeSet::new();
        for file in need_metadata {
            if ctx.is_interrupted() {
                self.keep_hashes(&batch.hashes, &cached, &refreshed).await;
                return Ok(RunStatus::Interrupted);
            }
            self.refresh_metadata(
                file,
                batch.hashes.get(&file.path),
                cached.get(&file.path),
                stats,
            )
            .await;
            refreshed.insert(file.path.clone());
        }

        // Previews
        if self.options.download_images {
            ensure_root(scanner)?;
            for file in &candidates {
                if ctx.is_interrupted() {
                    return Ok(RunStatus::Interrupted);
                }
                self.refresh_preview(
                    file,
                    batch.hashes.get(&file.path),
                    changed.contains(&file.path),
                    stats,
                )
                .await;
            }
        }

        Ok(status)
    }

    /// Validate and hash `files`, at most `hash_workers` at a time
    ///
    /// Fails with [`SyncError::NoValidFiles`] when every file was rejected by
    /// validation.
    async fn hash_files(
        &self,
        files: &[ModelFile],
        ctx: &RunContext,
        stats: &mut SyncStats,
    ) -> SyncResult<HashBatch> {
        let mut batch = HashBatch::default();
        if files.is_empty() {
            return Ok(batch);
        }

        let workers = self.options.hash_workers.max(1);
        let mut queue = files.iter().cloned();
        let mut tasks: JoinSet<(ModelFile, HashOutcome)> = JoinSet::new();
        let mut rejected = 0usize;

        loop {
            while tasks.len() < workers && !ctx.is_interrupted() {
                let Some(file) = queue.next() else { break };
                tasks.spawn_blocking(move || {
                    let outcome = hash_one(&file.path);
                    (file, outcome)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (file, outcome) = joined.map_err(|e| SyncError::Task(e.to_string()))?;

            match outcome {
                HashOutcome::Hashed(hash) => {
                    tracing::info!(file = %file.name(), hash = %hash.short(), "Hash computed");
                    stats.hashes_computed += 1;
                    batch.hashes.insert(file.path, hash);
                }
                HashOutcome::Excluded(reason) => {
                    tracing::warn!(file = %file.name(), reason = %reason, "Excluding invalid safetensors file");
                    stats.files_excluded += 1;
                    rejected += 1;
                    batch.excluded.insert(file.path);
                }
                HashOutcome::Failed(e) => {
                    stats.record_error(&file, format_args!("hashing failed: {}", e));
                    batch.excluded.insert(file.path);
                }
            }
        }

        if rejected == files.len() {
            return Err(SyncError::NoValidFiles { rejected });
        }
        Ok(batch)
    }

    /// Query the catalog for one file and persist the answer
    async fn refresh_metadata(
        &self,
        file: &ModelFile,
        computed: Option<&ContentHash>,
        cached: Option<&ContentHash>,
        stats: &mut SyncStats,
    ) {
        let Some(hash) = computed.or(cached) else {
            tracing::warn!(file = %file.name(), "No hash available, skipping metadata lookup");
            stats.files_skipped += 1;
            return;
        };
        let sidecar = file.sidecar_path();

        let lookup = match self.catalog.lookup_by_hash(hash).await {
            Ok(lookup) => lookup,
            Err(e) => {
                stats.record_error(file, format_args!("metadata lookup failed: {}", e));
                // Keep a new hash on disk so the next run does not recompute it
                if computed.is_some() && computed != cached {
                    let record = SidecarRecord::hash_only(hash);
                    if let Err(e) = self.writer.write(&sidecar, &record).await {
                        tracing::warn!(file = %file.name(), error = %e, "Failed to save hash");
                    }
                }
                return;
            }
        };

        let found = matches!(lookup, Lookup::Found(_));
        if found {
            stats.metadata_fetched += 1;
        }
        let record = SidecarRecord::refreshed(hash, &lookup, Utc::now());
        match self.writer.write(&sidecar, &record).await {
            Ok(()) if found => {
                tracing::info!(file = %file.name(), "Metadata saved");
                stats.files_saved += 1;
            }
            Ok(()) => {
                tracing::info!(file = %file.name(), "Recorded as not found on remote");
                stats.not_found += 1;
            }
            Err(e) => stats.record_error(file, format_args!("failed to save sidecar: {:#}", e)),
        }
    }

    /// Persist hashes computed this run that no sidecar holds yet
    ///
    /// Used when a run stops early, so the next run skips rehashing them.
    async fn keep_hashes(
        &self,
        computed: &BTreeMap<PathBuf, ContentHash>,
        cached: &BTreeMap<PathBuf, ContentHash>,
        done: &BTreeSet<PathBuf>,
    ) {
        for (path, hash) in computed {
            if done.contains(path) || cached.get(path) == Some(hash) {
                continue;
            }
            let sidecar = sidecar_path_for(path);
            match self.writer.write(&sidecar, &SidecarRecord::hash_only(hash)).await {
                Ok(()) => tracing::debug!(file = %path.display(), "Hash kept for next run"),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "Failed to save hash"),
            }
        }
    }

    /// Download a preview for one file when it has catalog metadata and no
    /// preview yet
    async fn refresh_preview(
        &self,
        file: &ModelFile,
        computed: Option<&ContentHash>,
        content_changed: bool,
        stats: &mut SyncStats,
    ) {
        let Some(record) = LocalScanner::load_sidecar(&file.path) else {
            return;
        };
        if !record.has_remote_metadata() {
            return;
        }
        if has_preview(&file.path) && !self.options.force_refresh && !content_changed {
            return;
        }
        let Some(hash) = computed.cloned().or_else(|| record.hash()) else {
            tracing::warn!(file = %file.name(), "No hash available, skipping preview");
            stats.files_skipped += 1;
            return;
        };

        let version = match self.catalog.lookup_by_hash(&hash).await {
            Ok(Lookup::Found(version)) => version,
            Ok(Lookup::NotFound) => {
                tracing::info!(file = %file.name(), "Model no longer on remote, no preview");
                return;
            }
            Err(e) => {
                stats.record_error(file, format_args!("preview lookup failed: {}", e));
                return;
            }
        };

        let Some(url) = self.catalog.primary_image_url(&version).await else {
            tracing::info!(file = %file.name(), "No image available");
            return;
        };

        match self
            .catalog
            .download_image(&url, &model_stem(&file.path))
            .await
        {
            Ok(path) => {
                tracing::info!(file = %file.name(), preview = %path.display(), "Preview saved");
                stats.images_downloaded += 1;
            }
            Err(e) => stats.record_error(file, format_args!("image download failed: {}", e)),
        }
    }
}

fn ensure_root(scanner: &LocalScanner) -> SyncResult<()> {
    if scanner.root().is_dir() {
        Ok(())
    } else {
        Err(SyncError::RootNotFound(scanner.root().to_path_buf()))
    }
}
