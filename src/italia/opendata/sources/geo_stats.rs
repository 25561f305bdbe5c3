use std::io::{Cursor, Read, Seek};

use calamine::{DataType, Range, Reader, Xlsx};
use tracing::debug;
use zip::ZipArchive;

use crate::italia::opendata::error::{DatasetError, Result};
use crate::italia::opendata::model::AltimetricZone;
use crate::italia::opendata::sources::{looks_numeric, parse_decimal};

const MIN_CELLS: usize = 14;
const COL_ISTAT_CODE: usize = 1;
const COL_SURFACE: usize = 5;
const COL_POPULATION: usize = 7;
const COL_ZONE: usize = 8;
const COL_ALTITUDE: usize = 9;
const COL_COASTAL: usize = 10;
const COL_ISLAND: usize = 11;
const COL_URBANIZATION: usize = 13;

/// Marker entry present in every OOXML package.
const OOXML_CONTENT_TYPES: &str = "[Content_Types].xml";

/// Geographic statistics of one municipality from the ISTAT classifications.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoStatsRecord {
    pub raw_code: String,
    pub surface_km2: Option<f64>,
    pub population: Option<u64>,
    pub altimetric_zone: Option<AltimetricZone>,
    pub altitude_m: Option<i32>,
    pub coastal: Option<bool>,
    pub island: Option<bool>,
    pub urbanization_degree: Option<u8>,
}

/// Parses the classifications archive: a zip holding one workbook, whose
/// first sheet carries one row per municipality. A bare workbook is accepted
/// too.
pub fn parse(bytes: &[u8]) -> Result<(Vec<GeoStatsRecord>, usize)> {
    let workbook_bytes = extract_workbook(bytes)?;
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(workbook_bytes))?;
    let range = read_first_sheet(&mut workbook)?;

    let mut records = Vec::new();
    let mut skipped = 0;
    for (line, row) in range.rows().enumerate() {
        let code = cell_to_code(row.get(COL_ISTAT_CODE));
        if !looks_numeric(&code) {
            continue;
        }
        if row.len() < MIN_CELLS {
            debug!(line, "short classification row");
            skipped += 1;
            continue;
        }
        records.push(GeoStatsRecord {
            raw_code: code,
            surface_km2: cell_to_f64(row.get(COL_SURFACE)).filter(|surface| *surface >= 0.0),
            population: cell_to_whole(row.get(COL_POPULATION))
                .and_then(|population| u64::try_from(population).ok()),
            altimetric_zone: AltimetricZone::from_code(&cell_to_code(row.get(COL_ZONE))),
            altitude_m: cell_to_whole(row.get(COL_ALTITUDE))
                .and_then(|altitude| i32::try_from(altitude).ok()),
            coastal: cell_to_flag(row.get(COL_COASTAL)),
            island: cell_to_flag(row.get(COL_ISLAND)),
            urbanization_degree: cell_to_whole(row.get(COL_URBANIZATION))
                .and_then(|degree| u8::try_from(degree).ok()),
        });
    }
    Ok((records, skipped))
}

fn extract_workbook(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.file_names().any(|name| name == OOXML_CONTENT_TYPES) {
        return Ok(bytes.to_vec());
    }
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if !entry.is_dir() && entry.name().to_lowercase().ends_with(".xlsx") {
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }
    Err(DatasetError::InvalidPayload(
        "archive does not contain a workbook".into(),
    ))
}

fn read_first_sheet<R: Read + Seek>(workbook: &mut Xlsx<R>) -> Result<Range<DataType>> {
    let name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| DatasetError::InvalidPayload("workbook has no sheets".into()))?;
    let range_result = workbook
        .worksheet_range(&name)
        .ok_or_else(|| DatasetError::InvalidPayload(format!("missing sheet '{name}'")))?;
    let range = range_result.map_err(DatasetError::from)?;
    Ok(range)
}

/// Renders a key cell as text. Numeric cells lose their fractional `.0`.
fn cell_to_code(cell: Option<&DataType>) -> String {
    match cell {
        Some(DataType::String(value)) => value.trim().to_string(),
        Some(DataType::Float(value)) if value.fract() == 0.0 => format!("{}", *value as i64),
        Some(DataType::Float(value)) => value.to_string(),
        Some(DataType::Int(value)) => value.to_string(),
        Some(DataType::Empty) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn cell_to_f64(cell: Option<&DataType>) -> Option<f64> {
    match cell? {
        DataType::Float(value) => Some(*value),
        DataType::Int(value) => Some(*value as f64),
        DataType::String(value) => parse_decimal(value),
        _ => None,
    }
}

fn cell_to_whole(cell: Option<&DataType>) -> Option<i64> {
    cell_to_f64(cell).map(|value| value.round() as i64)
}

fn cell_to_flag(cell: Option<&DataType>) -> Option<bool> {
    match cell_to_whole(cell)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}
