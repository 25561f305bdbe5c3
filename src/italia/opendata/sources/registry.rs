use tracing::debug;

use crate::italia::opendata::error::Result;
use crate::italia::opendata::normalise::repair_accents;
use crate::italia::opendata::reconcile::pad_code;
use crate::italia::opendata::sources::{decode_text, looks_numeric};

const MIN_COLUMNS: usize = 20;
const COL_REGION_CODE: usize = 0;
const COL_PROVINCE_CODE: usize = 2;
const COL_ISTAT_CODE: usize = 4;
const COL_NAME_ANY: usize = 5;
const COL_NAME_ITALIAN: usize = 6;
const COL_REGION_NAME: usize = 10;
const COL_PROVINCE_NAME: usize = 11;
const COL_ABBREVIATION: usize = 14;
const COL_CADASTRAL_CODE: usize = 19;

/// One row of the official municipality registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub istat_code: String,
    pub name: String,
    pub cadastral_code: Option<String>,
    pub province_code: String,
    pub province_name: String,
    pub abbreviation: String,
    pub region_code: String,
    pub region_name: String,
}

/// Parses the `;`-separated registry CSV.
pub fn parse(bytes: &[u8]) -> Result<(Vec<RegistryRecord>, usize)> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = Vec::new();
    let mut skipped = 0;
    for (line, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                debug!(line, %err, "unreadable registry row");
                skipped += 1;
                continue;
            }
        };
        let fields: Vec<&str> = row.iter().map(str::trim).collect();
        let Some(code) = fields.get(COL_ISTAT_CODE) else {
            continue;
        };
        if !looks_numeric(code) {
            continue;
        }
        match parse_row(&fields) {
            Some(record) => records.push(record),
            None => {
                debug!(line, "malformed registry row");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

fn parse_row(fields: &[&str]) -> Option<RegistryRecord> {
    if fields.len() < MIN_COLUMNS {
        return None;
    }
    let istat_code = fields[COL_ISTAT_CODE];
    if istat_code.len() != 6 || !istat_code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let name = Some(fields[COL_NAME_ITALIAN])
        .filter(|value| !value.is_empty())
        .unwrap_or(fields[COL_NAME_ANY]);
    if name.is_empty() {
        return None;
    }
    let region_code = pad_code(fields[COL_REGION_CODE], 2)?;
    let province_code = pad_code(fields[COL_PROVINCE_CODE], 3)?;
    let region_name = fields[COL_REGION_NAME];
    let province_name = fields[COL_PROVINCE_NAME];
    if region_name.is_empty() || province_name.is_empty() {
        return None;
    }
    let cadastral_code = fields[COL_CADASTRAL_CODE];

    Some(RegistryRecord {
        istat_code: istat_code.to_string(),
        name: repair_accents(name),
        cadastral_code: (!cadastral_code.is_empty()).then(|| cadastral_code.to_uppercase()),
        province_code,
        province_name: repair_accents(province_name),
        abbreviation: fields[COL_ABBREVIATION].to_uppercase(),
        region_code,
        region_name: repair_accents(region_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[(usize, &str)]) -> String {
        let mut fields = vec![""; 26];
        for (idx, value) in cells {
            fields[*idx] = *value;
        }
        fields.join(";")
    }

    #[test]
    fn parses_rows_and_skips_header() {
        let text = [
            "Codice Regione;Codice UTS;Codice Provincia;Progressivo;Codice Comune formato alfanumerico;Denominazione".to_string(),
            row(&[
                (0, "1"),
                (2, "1"),
                (4, "001001"),
                (5, "Aglie'"),
                (6, "Aglie'"),
                (10, "Piemonte"),
                (11, "Torino"),
                (14, "TO"),
                (19, "a074"),
            ]),
            row(&[(0, "12"), (2, "58"), (4, "58091"), (6, "Roma")]),
        ]
        .join("\r\n");

        let (records, skipped) = parse(text.as_bytes()).expect("registry parsed");

        assert_eq!(skipped, 1);
        assert_eq!(records.len(), 1);
        let aglie = &records[0];
        assert_eq!(aglie.name, "Agliè");
        assert_eq!(aglie.region_code, "01");
        assert_eq!(aglie.province_code, "001");
        assert_eq!(aglie.cadastral_code.as_deref(), Some("A074"));
    }

    #[test]
    fn falls_back_to_local_name_when_italian_name_missing() {
        let text = row(&[
            (0, "4"),
            (2, "21"),
            (4, "021008"),
            (5, "Bozen"),
            (10, "Trentino-Alto Adige/Südtirol"),
            (11, "Bolzano/Bozen"),
            (14, "BZ"),
        ]);

        let (records, _) = parse(text.as_bytes()).expect("registry parsed");
        assert_eq!(records[0].name, "Bozen");
        assert_eq!(records[0].cadastral_code, None);
    }
}
