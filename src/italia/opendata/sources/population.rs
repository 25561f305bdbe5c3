use crate::italia::opendata::error::{DatasetError, Result};
use crate::italia::opendata::sources::{decode_text, looks_numeric, parse_decimal};

const CODE_HEADER: &str = "COD_ISTAT_COMUNE";
const RESIDENTS_HEADER: &str = "RESIDENTI";

/// Resident population of one municipality, keyed by ISTAT code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopulationRecord {
    pub raw_code: String,
    pub residents: u64,
}

/// Parses the ANPR population export. Columns are located by header name, and
/// the delimiter is sniffed from the header line.
pub fn parse(bytes: &[u8]) -> Result<(Vec<PopulationRecord>, usize)> {
    let text = decode_text(bytes);
    let header_line = text.lines().next().unwrap_or_default();
    let delimiter = if header_line.contains(';') && !header_line.contains(',') {
        b';'
    } else {
        b','
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| DatasetError::InvalidPayload(format!("missing column {name}")))
    };
    let code_idx = column(CODE_HEADER)?;
    let residents_idx = column(RESIDENTS_HEADER)?;

    let mut records = Vec::new();
    let mut skipped = 0;
    for row in reader.records() {
        let Ok(row) = row else {
            skipped += 1;
            continue;
        };
        let code = row.get(code_idx).unwrap_or_default().trim();
        let residents = row.get(residents_idx).unwrap_or_default().trim();
        if code.is_empty() && residents.is_empty() {
            continue;
        }
        match parse_residents(residents) {
            Some(residents) if looks_numeric(code) => records.push(PopulationRecord {
                raw_code: code.to_string(),
                residents,
            }),
            _ => skipped += 1,
        }
    }
    Ok((records, skipped))
}

fn parse_residents(value: &str) -> Option<u64> {
    value.parse::<u64>().ok().or_else(|| {
        parse_decimal(value)
            .filter(|residents| *residents >= 0.0 && residents.fract() == 0.0)
            .map(|residents| residents as u64)
    })
}
