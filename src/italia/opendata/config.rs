use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::italia::opendata::sources::SourceKind;

pub const APP_NAME: &str = "italia-opendata";
pub const STORE_FILE_NAME: &str = "italia.db";
pub const DEFAULT_MAX_AGE_DAYS: u64 = 30;
pub const DEFAULT_LIST_LIMIT: usize = 400;

pub const ENV_CACHE_DIR: &str = "ITALIA_OPENDATA_CACHE_DIR";
pub const ENV_MAX_AGE_DAYS: &str = "ITALIA_OPENDATA_MAX_AGE_DAYS";
pub const ENV_LIST_LIMIT: &str = "ITALIA_OPENDATA_LIST_LIMIT";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Maximum store age for a number of days. Absurdly large values saturate
/// instead of overflowing.
pub fn max_age_from_days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY))
}

/// Runtime configuration of the dataset manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the store file.
    pub cache_dir: PathBuf,
    /// Snapshots older than this are reported as stale and rebuilt by a
    /// non-forced refresh.
    pub max_age: Duration,
    /// Cap applied by `list_municipalities` when the caller omits one.
    pub list_limit: usize,
    pub endpoints: SourceEndpoints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_age: max_age_from_days(DEFAULT_MAX_AGE_DAYS),
            list_limit: DEFAULT_LIST_LIMIT,
            endpoints: SourceEndpoints::default(),
        }
    }
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Unparseable
    /// values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|value| !value.trim().is_empty()) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(days) = lookup(ENV_MAX_AGE_DAYS).and_then(|value| value.trim().parse::<u64>().ok()) {
            config.max_age = max_age_from_days(days);
        }
        if let Some(limit) = lookup(ENV_LIST_LIMIT).and_then(|value| value.trim().parse::<usize>().ok()) {
            config.list_limit = limit;
        }
        config
    }

    /// Uses `dir` as cache directory, keeping every other setting.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn store_path(&self) -> PathBuf {
        self.cache_dir.join(STORE_FILE_NAME)
    }
}

/// Platform cache directory for the store, honouring `XDG_CACHE_HOME`.
pub fn default_cache_dir() -> PathBuf {
    let base = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir);
    base.join(APP_NAME)
}

/// Remote location and fetch timeout of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(skip)]
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Fixed, versioned URL per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEndpoints {
    pub istat_registry: Endpoint,
    pub istat_geo: Endpoint,
    pub anpr_population: Endpoint,
    pub postal_codes: Endpoint,
    pub centroids: Endpoint,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            istat_registry: Endpoint::new(
                "https://www.istat.it/storage/codici-unita-amministrative/Elenco-comuni-italiani.csv",
                60,
            ),
            istat_geo: Endpoint::new(
                "https://www.istat.it/wp-content/uploads/2024/05/Classificazioni-statistiche-Anno_2026.zip",
                120,
            ),
            anpr_population: Endpoint::new(
                "https://raw.githubusercontent.com/italia/anpr-opendata/main/data/popolazione_residente_export.csv",
                60,
            ),
            postal_codes: Endpoint::new(
                "https://raw.githubusercontent.com/matteocontrini/comuni-json/master/comuni.json",
                120,
            ),
            centroids: Endpoint::new(
                "https://raw.githubusercontent.com/opendatasicilia/comuni-italiani/main/dati/coordinate.csv",
                60,
            ),
        }
    }
}

impl SourceEndpoints {
    pub fn get(&self, kind: SourceKind) -> &Endpoint {
        match kind {
            SourceKind::IstatRegistry => &self.istat_registry,
            SourceKind::IstatGeo => &self.istat_geo,
            SourceKind::AnprPopulation => &self.anpr_population,
            SourceKind::PostalCodes => &self.postal_codes,
            SourceKind::Centroids => &self.centroids,
        }
    }
}
