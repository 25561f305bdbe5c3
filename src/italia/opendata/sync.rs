//! Refresh controller: owns the current catalog, opens the store on first use
//! and serialises refresh cycles behind a single lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::italia::opendata::config::Config;
use crate::italia::opendata::error::{DatasetError, FetchError, Result};
use crate::italia::opendata::merge::{SourceCoverage, merge};
use crate::italia::opendata::model::{
    CoverageStats, MunicipalityRecord, MunicipalitySummary, ProvinceSummary, RegionSummary,
};
use crate::italia::opendata::query::{Catalog, validate_postal_code, validate_query};
use crate::italia::opendata::sources::{self, HttpTransport, SourceFetch, SourceKind, Transport};
use crate::italia::opendata::store::{self, Snapshot, SourceSyncRecord};

/// Lifecycle of the local store as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    /// Nothing has been opened yet.
    Uninitialized,
    /// The store is being opened or built; queries wait for it.
    Loading,
    /// A snapshot is loaded and within its maximum age.
    Ready,
    /// A snapshot is loaded but older than the configured maximum age. It is
    /// still served.
    Stale,
}

/// Summary of one completed refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub built_at: DateTime<Utc>,
    pub coverage: Vec<SourceCoverage>,
    /// Non-anchor sources whose fetch failed; their fields are absent.
    pub failed_sources: Vec<SourceKind>,
}

/// Store freshness plus the sync record of every source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStatus {
    pub state: StoreState,
    pub path: PathBuf,
    pub size_bytes: Option<u64>,
    pub built_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub max_age_days: u64,
    pub coverage: Option<CoverageStats>,
    pub sources: Vec<SourceSyncRecord>,
}

/// Result of [`DatasetManager::refresh_dataset`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// The store was already fresh; nothing was fetched or written.
    AlreadyFresh { dataset: DatasetStatus },
    /// A new snapshot was built and swapped in.
    Refreshed {
        report: RefreshReport,
        dataset: DatasetStatus,
    },
    /// Another refresh finished while this one waited for the lock; its
    /// result is reused.
    Coalesced {
        report: RefreshReport,
        dataset: DatasetStatus,
    },
}

#[derive(Debug)]
enum Slot {
    Uninitialized,
    Loading,
    Loaded(Arc<Catalog>),
}

/// Handle on the local dataset. Create one per process and share it; all
/// queries and refreshes go through it.
pub struct DatasetManager {
    config: Config,
    transport: Arc<dyn Transport>,
    slot: RwLock<Slot>,
    /// Held for the whole of a store open or refresh cycle. Keeps the report
    /// of the last successful refresh for coalesced callers.
    refresh: tokio::sync::Mutex<Option<RefreshReport>>,
    /// Bumped after every successful refresh.
    generation: AtomicU64,
    attempts: Mutex<BTreeMap<SourceKind, SourceSyncRecord>>,
}

impl DatasetManager {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            slot: RwLock::new(Slot::Uninitialized),
            refresh: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Manager fetching the sources over HTTP.
    pub fn with_http(config: Config) -> Result<Self> {
        Ok(Self::new(config, Arc::new(HttpTransport::new()?)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> StoreState {
        match &*self.slot.read() {
            Slot::Uninitialized => StoreState::Uninitialized,
            Slot::Loading => StoreState::Loading,
            Slot::Loaded(catalog) if self.is_stale(catalog.snapshot().built_at) => {
                StoreState::Stale
            }
            Slot::Loaded(_) => StoreState::Ready,
        }
    }

    /// Current catalog, opening the store first if needed. An absent store is
    /// built from the sources and a corrupt one is discarded and rebuilt.
    pub async fn catalog(&self) -> Result<Arc<Catalog>> {
        if let Some(catalog) = self.current() {
            return Ok(catalog);
        }
        let mut last_report = self.refresh.lock().await;
        if let Some(catalog) = self.current() {
            return Ok(catalog);
        }
        if let Some(catalog) = self.open_existing().await? {
            return Ok(catalog);
        }
        info!("no local store, building it");
        *last_report = Some(self.run_cycle().await?);
        self.current().ok_or_else(|| {
            DatasetError::NotFound("dataset unavailable after refresh".into())
        })
    }

    pub async fn list_regions(&self) -> Result<Vec<RegionSummary>> {
        Ok(self.catalog().await?.list_regions())
    }

    pub async fn list_provinces(&self, region: Option<&str>) -> Result<Vec<ProvinceSummary>> {
        self.catalog().await?.list_provinces(region)
    }

    pub async fn list_municipalities(
        &self,
        region: Option<&str>,
        province: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MunicipalitySummary>> {
        Ok(self
            .catalog()
            .await?
            .list_municipalities(region, province, limit))
    }

    pub async fn get_municipality(&self, query: &str) -> Result<MunicipalityRecord> {
        let query = validate_query(query)?;
        self.catalog().await?.get_municipality(query)
    }

    pub async fn get_by_postal_code(&self, postal_code: &str) -> Result<Vec<MunicipalityRecord>> {
        let postal_code = validate_postal_code(postal_code)?;
        self.catalog().await?.get_by_postal_code(postal_code)
    }

    /// Rebuilds the store from the sources.
    ///
    /// Without `force`, a fresh store is left untouched and a call that
    /// waited on a refresh finishing meanwhile reuses that refresh's result.
    /// Fails with [`DatasetError::AnchorFetch`] when the registry cannot be
    /// fetched; the previous snapshot stays in place.
    #[instrument(level = "info", skip(self))]
    pub async fn refresh_dataset(&self, force: bool) -> Result<RefreshOutcome> {
        let observed = self.generation.load(Ordering::Acquire);
        let mut last_report = self.refresh.lock().await;

        if !force && self.generation.load(Ordering::Acquire) != observed {
            if let Some(report) = last_report.clone() {
                info!("reusing the refresh that completed while waiting");
                return Ok(RefreshOutcome::Coalesced {
                    report,
                    dataset: self.status(),
                });
            }
        }

        // The snapshot on disk keeps serving queries while the cycle runs.
        let current = match self.current() {
            Some(catalog) => Some(catalog),
            None => self.open_existing().await?,
        };
        if let Some(catalog) = current.filter(|_| !force) {
            if !self.is_stale(catalog.snapshot().built_at) {
                info!("store is fresh, nothing to do");
                return Ok(RefreshOutcome::AlreadyFresh {
                    dataset: self.status(),
                });
            }
        }

        let report = self.run_cycle().await?;
        *last_report = Some(report.clone());
        Ok(RefreshOutcome::Refreshed {
            report,
            dataset: self.status(),
        })
    }

    /// Reports store freshness and the sync record of every source. Opens an
    /// existing store to read it but never fetches.
    pub async fn datasets_status(&self) -> DatasetStatus {
        if self.current().is_none() {
            if let Ok(_guard) = self.refresh.try_lock() {
                if self.current().is_none() {
                    if let Err(err) = self.open_existing().await {
                        warn!(error = %err, "store could not be opened for status");
                    }
                }
            }
        }
        self.status()
    }

    /// Drops the loaded catalog after any running refresh has finished. The
    /// next query opens the store again.
    pub async fn close(&self) {
        let _guard = self.refresh.lock().await;
        *self.slot.write() = Slot::Uninitialized;
        info!("dataset closed");
    }

    fn current(&self) -> Option<Arc<Catalog>> {
        match &*self.slot.read() {
            Slot::Loaded(catalog) => Some(Arc::clone(catalog)),
            _ => None,
        }
    }

    fn is_stale(&self, built_at: DateTime<Utc>) -> bool {
        Utc::now()
            .signed_duration_since(built_at)
            .to_std()
            .map(|age| age > self.config.max_age)
            .unwrap_or(false)
    }

    fn install(&self, snapshot: Snapshot) -> Arc<Catalog> {
        {
            let mut attempts = self.attempts.lock();
            for record in &snapshot.sources {
                let newer = attempts
                    .get(&record.source)
                    .is_none_or(|known| known.last_attempt_at < record.last_attempt_at);
                if newer {
                    attempts.insert(record.source, record.clone());
                }
            }
        }
        let catalog = Arc::new(Catalog::new(snapshot, self.config.list_limit));
        *self.slot.write() = Slot::Loaded(Arc::clone(&catalog));
        catalog
    }

    /// Loads the store from disk. Must be called with the refresh lock held.
    /// A corrupt store is removed and reported as absent.
    async fn open_existing(&self) -> Result<Option<Arc<Catalog>>> {
        let path = self.config.store_path();
        *self.slot.write() = Slot::Loading;
        let loaded = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || store::load_snapshot(&path)).await
        };
        match loaded.map_err(DatasetError::from).and_then(|result| result) {
            Ok(Some(snapshot)) => {
                info!(path = %path.display(), built_at = %snapshot.built_at, "store opened");
                Ok(Some(self.install(snapshot)))
            }
            Ok(None) => {
                *self.slot.write() = Slot::Uninitialized;
                Ok(None)
            }
            Err(DatasetError::StoreCorrupt { path, cause }) => {
                warn!(path = %path.display(), %cause, "discarding corrupt store");
                *self.slot.write() = Slot::Uninitialized;
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(None),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => {
                *self.slot.write() = Slot::Uninitialized;
                Err(err)
            }
        }
    }

    /// Fetch, merge, persist and swap. Must be called with the refresh lock
    /// held.
    #[instrument(level = "info", skip_all, fields(path = %self.config.store_path().display()))]
    async fn run_cycle(&self) -> Result<RefreshReport> {
        let previous = self.current();
        if previous.is_none() {
            *self.slot.write() = Slot::Loading;
        }
        let result = self.build(previous.as_deref()).await;
        if result.is_err() && previous.is_none() {
            *self.slot.write() = Slot::Uninitialized;
        }
        result
    }

    async fn build(&self, previous: Option<&Catalog>) -> Result<RefreshReport> {
        let fetches = sources::fetch_all(self.transport.as_ref(), &self.config.endpoints).await;
        let mut records = {
            let attempts = self.attempts.lock();
            fetches
                .iter()
                .map(|fetch| (fetch.kind, sync_record(fetch, attempts.get(&fetch.kind))))
                .collect::<BTreeMap<_, _>>()
        };

        let mut registry = None;
        let mut others = Vec::new();
        let mut anchor_error = None;
        let mut failed_sources = Vec::new();
        for fetch in fetches {
            match fetch.result {
                Ok(parsed) if fetch.kind.is_anchor() => registry = Some(parsed),
                Ok(parsed) => others.push(parsed),
                Err(err) if fetch.kind.is_anchor() => anchor_error = Some(err),
                Err(_) => failed_sources.push(fetch.kind),
            }
        }

        let registry = match (registry, anchor_error) {
            (Some(registry), None) => registry,
            (_, err) => {
                let err = err.unwrap_or_else(|| {
                    FetchError::new(SourceKind::IstatRegistry, "registry was not fetched")
                });
                self.attempts.lock().extend(records);
                if let Some(catalog) = previous {
                    self.persist_attempts(catalog).await;
                }
                warn!(cause = %err.cause, "registry unavailable, keeping previous snapshot");
                return Err(DatasetError::AnchorFetch(err));
            }
        };

        let outcome = merge(&registry, &others);
        for coverage in &outcome.coverage {
            if let Some(record) = records.get_mut(&coverage.source) {
                record.unmatched_rows = coverage.unmatched;
            }
        }
        self.attempts.lock().extend(records.clone());

        let snapshot = Snapshot {
            dataset: outcome.dataset,
            built_at: Utc::now(),
            sources: records.into_values().collect(),
        };
        let path = self.config.store_path();
        let snapshot = tokio::task::spawn_blocking(move || {
            store::write_snapshot(&path, &snapshot).map(|()| snapshot)
        })
        .await??;

        let report = RefreshReport {
            built_at: snapshot.built_at,
            coverage: outcome.coverage,
            failed_sources,
        };
        let coverage = snapshot.dataset.coverage();
        self.install(snapshot);
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(
            municipalities = coverage.municipalities,
            with_postal_codes = coverage.with_postal_codes,
            failed = report.failed_sources.len(),
            "dataset refreshed"
        );
        Ok(report)
    }

    /// Rewrites the previous snapshot with the latest sync records so that a
    /// failed attempt is visible after a restart. The dataset is unchanged.
    async fn persist_attempts(&self, catalog: &Catalog) {
        let snapshot = Snapshot {
            dataset: catalog.snapshot().dataset.clone(),
            built_at: catalog.snapshot().built_at,
            sources: self.attempts.lock().values().cloned().collect(),
        };
        let path = self.config.store_path();
        let written = tokio::task::spawn_blocking(move || store::write_snapshot(&path, &snapshot))
            .await
            .map_err(DatasetError::from)
            .and_then(|result| result);
        if let Err(err) = written {
            warn!(error = %err, "failed to record sync attempts");
        }
    }

    fn status(&self) -> DatasetStatus {
        let path = self.config.store_path();
        let size_bytes = std::fs::metadata(&path).ok().map(|meta| meta.len());
        let catalog = self.current();
        let built_at = catalog.as_ref().map(|catalog| catalog.snapshot().built_at);
        DatasetStatus {
            state: self.state(),
            path,
            size_bytes,
            built_at,
            stale: built_at.is_some_and(|at| self.is_stale(at)),
            max_age_days: self.config.max_age.as_secs() / (24 * 60 * 60),
            coverage: catalog.map(|catalog| catalog.snapshot().dataset.coverage()),
            sources: self.attempts.lock().values().cloned().collect(),
        }
    }
}

/// Sync record for one fetch. A failure keeps the time of the last success.
fn sync_record(fetch: &SourceFetch, previous: Option<&SourceSyncRecord>) -> SourceSyncRecord {
    match &fetch.result {
        Ok(parsed) => SourceSyncRecord {
            source: fetch.kind,
            url: fetch.url.clone(),
            last_attempt_at: fetch.fetched_at,
            last_success_at: Some(fetch.fetched_at),
            record_count: parsed.records.len(),
            skipped_rows: parsed.skipped,
            unmatched_rows: 0,
            last_error: None,
        },
        Err(err) => SourceSyncRecord {
            source: fetch.kind,
            url: fetch.url.clone(),
            last_attempt_at: fetch.fetched_at,
            last_success_at: previous.and_then(|record| record.last_success_at),
            record_count: 0,
            skipped_rows: 0,
            unmatched_rows: 0,
            last_error: Some(err.cause.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::italia::opendata::sources::ParsedSource;

    fn fetch(result: std::result::Result<ParsedSource, FetchError>) -> SourceFetch {
        SourceFetch {
            kind: SourceKind::PostalCodes,
            url: "https://example.invalid/comuni.json".into(),
            fetched_at: Utc::now(),
            result,
        }
    }

    #[test]
    fn failed_fetch_keeps_last_success() {
        let success = sync_record(
            &fetch(Ok(ParsedSource {
                kind: SourceKind::PostalCodes,
                records: Vec::new(),
                skipped: 2,
            })),
            None,
        );
        assert_eq!(success.skipped_rows, 2);
        assert!(success.last_error.is_none());

        let failure = sync_record(
            &fetch(Err(FetchError::new(SourceKind::PostalCodes, "HTTP 503"))),
            Some(&success),
        );
        assert_eq!(failure.last_success_at, success.last_success_at);
        assert_eq!(failure.record_count, 0);
        assert_eq!(failure.last_error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn refresh_outcome_is_tagged_by_status() {
        let outcome = RefreshOutcome::AlreadyFresh {
            dataset: DatasetStatus {
                state: StoreState::Ready,
                path: PathBuf::from("italia.db"),
                size_bytes: Some(4096),
                built_at: None,
                stale: false,
                max_age_days: 30,
                coverage: None,
                sources: Vec::new(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "already_fresh");
        assert_eq!(json["dataset"]["state"], "ready");
    }
}
