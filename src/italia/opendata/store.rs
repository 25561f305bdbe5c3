//! Local store: one SQLite file holding the merged snapshot and the per-source
//! sync records. A new snapshot is written to a temporary file next to the
//! store and renamed over it, so readers never observe a half-written store.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::italia::opendata::error::{DatasetError, Result};
use crate::italia::opendata::model::{
    AltimetricZone, Dataset, Municipality, PostalLink, Province, Region,
};
use crate::italia::opendata::sources::SourceKind;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "\
CREATE TABLE regions (
    position INTEGER NOT NULL,
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE provinces (
    position INTEGER NOT NULL,
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    abbreviation TEXT NOT NULL,
    region_code TEXT NOT NULL REFERENCES regions(code)
);

CREATE TABLE municipalities (
    position INTEGER NOT NULL,
    istat_code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    cadastral_code TEXT,
    province_code TEXT NOT NULL REFERENCES provinces(code),
    region_code TEXT NOT NULL REFERENCES regions(code),
    population INTEGER,
    surface_km2 REAL,
    altitude_m INTEGER,
    altimetric_zone TEXT,
    coastal INTEGER,
    island INTEGER,
    urbanization_degree INTEGER,
    latitude REAL,
    longitude REAL
);

CREATE TABLE postal_codes (
    postal_code TEXT NOT NULL,
    istat_code TEXT NOT NULL REFERENCES municipalities(istat_code),
    PRIMARY KEY (postal_code, istat_code)
);

CREATE TABLE source_sync (
    source TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    last_attempt_at TEXT NOT NULL,
    last_success_at TEXT,
    record_count INTEGER NOT NULL,
    skipped_rows INTEGER NOT NULL,
    unmatched_rows INTEGER NOT NULL,
    last_error TEXT
);

CREATE TABLE snapshot_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE INDEX idx_postal_codes_istat ON postal_codes(istat_code);
";

/// Fetch bookkeeping for one source, overwritten on every refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSyncRecord {
    pub source: SourceKind,
    pub url: String,
    pub last_attempt_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Records ingested by the last attempt; zero when it failed.
    pub record_count: usize,
    pub skipped_rows: usize,
    pub unmatched_rows: usize,
    pub last_error: Option<String>,
}

/// A complete, self-consistent store content.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dataset: Dataset,
    pub built_at: DateTime<Utc>,
    /// Ordered by source.
    pub sources: Vec<SourceSyncRecord>,
}

/// Writes `snapshot` to `path`, replacing any existing store atomically.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let staging = tempfile::Builder::new()
        .prefix(".italia-")
        .suffix(".db.tmp")
        .tempfile_in(dir)?;
    let mut conn = Connection::open(staging.path())?;
    conn.execute_batch(SCHEMA)?;
    let tx = conn.transaction()?;
    insert_dataset(&tx, &snapshot.dataset)?;
    insert_sources(&tx, &snapshot.sources)?;
    tx.execute(
        "INSERT INTO snapshot_meta (key, value) VALUES ('schema_version', ?1), ('built_at', ?2)",
        params![SCHEMA_VERSION.to_string(), snapshot.built_at.to_rfc3339()],
    )?;
    tx.commit()?;
    conn.close().map_err(|(_, err)| DatasetError::from(err))?;

    staging
        .persist(path)
        .map_err(|err| DatasetError::Io(err.error))?;
    info!(
        municipalities = snapshot.dataset.municipalities.len(),
        "store written"
    );
    Ok(())
}

/// Reads the store at `path`. Returns `Ok(None)` when there is no store and
/// [`DatasetError::StoreCorrupt`] when the file is not a store of this
/// schema. Lock, permission and I/O failures are returned as they are.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) if is_transient(&err) => Err(err),
        Err(err) => Err(DatasetError::StoreCorrupt {
            path: path.to_path_buf(),
            cause: err.to_string(),
        }),
    }
}

/// Failures that say nothing about the file content: locks, permissions and
/// I/O. The store is left in place for the next attempt.
fn is_transient(err: &DatasetError) -> bool {
    match err {
        DatasetError::Io(_) => true,
        DatasetError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::PermissionDenied
                | ErrorCode::SystemIoFailure
                | ErrorCode::OutOfMemory
                | ErrorCode::OperationInterrupted
        ),
        _ => false,
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM snapshot_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if version.as_deref() != Some(SCHEMA_VERSION.to_string().as_str()) {
        return Err(DatasetError::InvalidPayload(format!(
            "unsupported schema version {version:?}"
        )));
    }
    let built_at: String = conn.query_row(
        "SELECT value FROM snapshot_meta WHERE key = 'built_at'",
        [],
        |row| row.get(0),
    )?;

    let snapshot = Snapshot {
        dataset: Dataset {
            regions: read_regions(&conn)?,
            provinces: read_provinces(&conn)?,
            municipalities: read_municipalities(&conn)?,
            postal_links: read_postal_links(&conn)?,
        },
        built_at: parse_timestamp(&built_at)?,
        sources: read_sources(&conn)?,
    };
    debug!(
        municipalities = snapshot.dataset.municipalities.len(),
        "store loaded"
    );
    Ok(snapshot)
}

fn insert_dataset(conn: &Connection, dataset: &Dataset) -> Result<()> {
    let mut stmt = conn.prepare("INSERT INTO regions (position, code, name) VALUES (?1, ?2, ?3)")?;
    for (position, region) in dataset.regions.iter().enumerate() {
        stmt.execute(params![position as i64, region.code, region.name])?;
    }

    let mut stmt = conn.prepare(
        "INSERT INTO provinces (position, code, name, abbreviation, region_code) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, province) in dataset.provinces.iter().enumerate() {
        stmt.execute(params![
            position as i64,
            province.code,
            province.name,
            province.abbreviation,
            province.region_code,
        ])?;
    }

    let mut stmt = conn.prepare(
        "INSERT INTO municipalities (position, istat_code, name, cadastral_code, province_code, \
         region_code, population, surface_km2, altitude_m, altimetric_zone, coastal, island, \
         urbanization_degree, latitude, longitude) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?;
    for (position, m) in dataset.municipalities.iter().enumerate() {
        stmt.execute(params![
            position as i64,
            m.istat_code,
            m.name,
            m.cadastral_code,
            m.province_code,
            m.region_code,
            m.population.map(|population| population as i64),
            m.surface_km2,
            m.altitude_m,
            m.altimetric_zone.map(AltimetricZone::label),
            m.coastal,
            m.island,
            m.urbanization_degree,
            m.latitude,
            m.longitude,
        ])?;
    }

    let mut stmt =
        conn.prepare("INSERT INTO postal_codes (postal_code, istat_code) VALUES (?1, ?2)")?;
    for link in &dataset.postal_links {
        stmt.execute(params![link.postal_code, link.istat_code])?;
    }
    Ok(())
}

fn insert_sources(conn: &Connection, sources: &[SourceSyncRecord]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO source_sync (source, url, last_attempt_at, last_success_at, record_count, \
         skipped_rows, unmatched_rows, last_error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for record in sources {
        stmt.execute(params![
            record.source.name(),
            record.url,
            record.last_attempt_at.to_rfc3339(),
            record.last_success_at.map(|at| at.to_rfc3339()),
            record.record_count as i64,
            record.skipped_rows as i64,
            record.unmatched_rows as i64,
            record.last_error,
        ])?;
    }
    Ok(())
}

fn read_regions(conn: &Connection) -> Result<Vec<Region>> {
    let mut stmt = conn.prepare("SELECT code, name FROM regions ORDER BY position")?;
    let rows = stmt.query_map([], |row| {
        Ok(Region {
            code: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn read_provinces(conn: &Connection) -> Result<Vec<Province>> {
    let mut stmt = conn.prepare(
        "SELECT code, name, abbreviation, region_code FROM provinces ORDER BY position",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Province {
            code: row.get(0)?,
            name: row.get(1)?,
            abbreviation: row.get(2)?,
            region_code: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn read_municipalities(conn: &Connection) -> Result<Vec<Municipality>> {
    let mut stmt = conn.prepare(
        "SELECT istat_code, name, cadastral_code, province_code, region_code, population, \
         surface_km2, altitude_m, altimetric_zone, coastal, island, urbanization_degree, \
         latitude, longitude FROM municipalities ORDER BY position",
    )?;
    let rows = stmt.query_map([], |row| {
        let population: Option<i64> = row.get(5)?;
        let zone: Option<String> = row.get(8)?;
        Ok(Municipality {
            istat_code: row.get(0)?,
            name: row.get(1)?,
            cadastral_code: row.get(2)?,
            province_code: row.get(3)?,
            region_code: row.get(4)?,
            population: population.and_then(|population| u64::try_from(population).ok()),
            surface_km2: row.get(6)?,
            altitude_m: row.get(7)?,
            altimetric_zone: zone.as_deref().and_then(AltimetricZone::from_label),
            coastal: row.get(9)?,
            island: row.get(10)?,
            urbanization_degree: row.get(11)?,
            latitude: row.get(12)?,
            longitude: row.get(13)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn read_postal_links(conn: &Connection) -> Result<Vec<PostalLink>> {
    let mut stmt = conn.prepare(
        "SELECT postal_code, istat_code FROM postal_codes ORDER BY postal_code, istat_code",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(PostalLink {
            postal_code: row.get(0)?,
            istat_code: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn read_sources(conn: &Connection) -> Result<Vec<SourceSyncRecord>> {
    let mut stmt = conn.prepare(
        "SELECT source, url, last_attempt_at, last_success_at, record_count, skipped_rows, \
         unmatched_rows, last_error FROM source_sync",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, i64>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (source, url, attempt, success, count, skipped, unmatched, last_error) = row?;
        let source = SourceKind::from_name(&source)
            .ok_or_else(|| DatasetError::InvalidPayload(format!("unknown source '{source}'")))?;
        records.push(SourceSyncRecord {
            source,
            url,
            last_attempt_at: parse_timestamp(&attempt)?,
            last_success_at: success.as_deref().map(parse_timestamp).transpose()?,
            record_count: count.max(0) as usize,
            skipped_rows: skipped.max(0) as usize,
            unmatched_rows: unmatched.max(0) as usize,
            last_error,
        });
    }
    records.sort_by_key(|record| record.source);
    Ok(records)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| DatasetError::InvalidPayload(format!("invalid timestamp '{value}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot() -> Snapshot {
        let mut roma = Municipality::new("058091", "Roma", "058", "12");
        roma.population = Some(2_754_719);
        roma.altimetric_zone = Some(AltimetricZone::Plain);
        roma.coastal = Some(true);
        roma.latitude = Some(41.8933);
        roma.longitude = Some(12.4829);
        let built_at = DateTime::parse_from_rfc3339("2026-10-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Snapshot {
            dataset: Dataset {
                regions: vec![Region {
                    code: "12".into(),
                    name: "Lazio".into(),
                }],
                provinces: vec![Province {
                    code: "058".into(),
                    name: "Roma".into(),
                    abbreviation: "RM".into(),
                    region_code: "12".into(),
                }],
                municipalities: vec![roma],
                postal_links: vec![PostalLink {
                    postal_code: "00118".into(),
                    istat_code: "058091".into(),
                }],
            },
            built_at,
            sources: vec![SourceSyncRecord {
                source: SourceKind::PostalCodes,
                url: "https://example.invalid/comuni.json".into(),
                last_attempt_at: built_at,
                last_success_at: None,
                record_count: 0,
                skipped_rows: 0,
                unmatched_rows: 0,
                last_error: Some("HTTP 503".into()),
            }],
        }
    }

    #[test]
    fn snapshot_survives_a_write_and_load() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("nested").join("italia.db");
        let original = snapshot();

        write_snapshot(&path, &original).expect("store written");
        let loaded = load_snapshot(&path).expect("store read").expect("store present");

        assert_eq!(loaded, original);
    }

    #[test]
    fn rewrite_replaces_previous_store() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("italia.db");
        write_snapshot(&path, &snapshot()).expect("first write");

        let mut second = snapshot();
        second.dataset.postal_links.clear();
        write_snapshot(&path, &second).expect("second write");

        let loaded = load_snapshot(&path).unwrap().unwrap();
        assert!(loaded.dataset.postal_links.is_empty());
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_store_is_not_an_error() {
        let dir = tempdir().expect("temporary directory");
        assert_eq!(load_snapshot(&dir.path().join("italia.db")).unwrap(), None);
    }

    #[test]
    fn garbage_file_is_reported_corrupt() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("italia.db");
        fs::write(&path, b"definitely not sqlite, just some bytes that fill a page").unwrap();

        let err = load_snapshot(&path).expect_err("corrupt store");
        assert!(matches!(err, DatasetError::StoreCorrupt { .. }));
    }

    #[test]
    fn foreign_schema_version_is_reported_corrupt() {
        let dir = tempdir().expect("temporary directory");
        let path = dir.path().join("italia.db");
        write_snapshot(&path, &snapshot()).expect("store written");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE snapshot_meta SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        conn.close().unwrap();

        let err = load_snapshot(&path).expect_err("foreign schema");
        assert!(matches!(err, DatasetError::StoreCorrupt { .. }));
    }

    #[test]
    fn lock_and_permission_failures_are_not_corruption() {
        let sqlite = |code| {
            DatasetError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(code),
                None,
            ))
        };
        assert!(is_transient(&sqlite(rusqlite::ffi::SQLITE_BUSY)));
        assert!(is_transient(&sqlite(rusqlite::ffi::SQLITE_LOCKED)));
        assert!(is_transient(&sqlite(rusqlite::ffi::SQLITE_CANTOPEN)));
        assert!(is_transient(&DatasetError::Io(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        ))));

        assert!(!is_transient(&sqlite(rusqlite::ffi::SQLITE_NOTADB)));
        assert!(!is_transient(&sqlite(rusqlite::ffi::SQLITE_CORRUPT)));
        assert!(!is_transient(&DatasetError::InvalidPayload(
            "unsupported schema version".into()
        )));
    }
}
