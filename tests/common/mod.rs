#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use italia_opendata::config::SourceEndpoints;
use italia_opendata::sources::{SourceKind, Transport};
use italia_opendata::{Config, DatasetError, DatasetManager, Result};
use parking_lot::Mutex;
use rust_xlsxwriter::Workbook;
use tempfile::TempDir;

/// Province fixtures for Lombardia: (province code, name, abbreviation,
/// capital ISTAT code, capital name).
pub const LOMBARDIA: [(&str, &str, &str, &str, &str); 12] = [
    ("012", "Varese", "VA", "012133", "Varese"),
    ("013", "Como", "CO", "013075", "Como"),
    ("014", "Sondrio", "SO", "014061", "Sondrio"),
    ("015", "Milano", "MI", "015146", "Milano"),
    ("016", "Bergamo", "BG", "016024", "Bergamo"),
    ("017", "Brescia", "BS", "017029", "Brescia"),
    ("018", "Pavia", "PV", "018110", "Pavia"),
    ("019", "Cremona", "CR", "019036", "Cremona"),
    ("020", "Mantova", "MN", "020030", "Mantova"),
    ("097", "Lecco", "LC", "097042", "Lecco"),
    ("098", "Lodi", "LO", "098031", "Lodi"),
    ("108", "Monza e della Brianza", "MB", "108033", "Monza"),
];

enum Payload {
    Bytes(Vec<u8>),
    Status(u16),
}

/// Serves canned payloads by URL and counts requests.
pub struct StaticTransport {
    payloads: Mutex<HashMap<String, Payload>>,
    endpoints: SourceEndpoints,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl StaticTransport {
    /// Transport serving a healthy payload for every source.
    pub fn healthy(endpoints: &SourceEndpoints) -> Self {
        let transport = Self {
            payloads: Mutex::new(HashMap::new()),
            endpoints: endpoints.clone(),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        };
        transport.serve(SourceKind::IstatRegistry, registry_csv());
        transport.serve(SourceKind::IstatGeo, geo_stats_zip());
        transport.serve(SourceKind::AnprPopulation, population_csv());
        transport.serve(SourceKind::Centroids, centroids_csv());
        transport.serve(SourceKind::PostalCodes, postal_json());
        transport
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    /// Slows every later request down by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn serve(&self, kind: SourceKind, bytes: Vec<u8>) {
        let url = self.endpoints.get(kind).url.clone();
        self.payloads.lock().insert(url, Payload::Bytes(bytes));
    }

    pub fn fail(&self, kind: SourceKind, status: u16) {
        let url = self.endpoints.get(kind).url.clone();
        self.payloads.lock().insert(url, Payload::Status(status));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let status = match self.payloads.lock().get(url) {
            Some(Payload::Bytes(bytes)) => return Ok(bytes.clone()),
            Some(Payload::Status(status)) => *status,
            None => 404,
        };
        Err(DatasetError::HttpStatus {
            url: url.to_string(),
            status,
        })
    }
}

/// Temporary cache directory plus a manager over a healthy transport.
pub struct Fixture {
    pub dir: TempDir,
    pub transport: Arc<StaticTransport>,
    pub manager: DatasetManager,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temporary directory");
        let config = config_for(&dir);
        let transport = Arc::new(StaticTransport::healthy(&config.endpoints));
        let manager = DatasetManager::new(config, transport.clone());
        Self {
            dir,
            transport,
            manager,
        }
    }

    pub fn with_transport(transport: StaticTransport) -> Self {
        let dir = tempfile::tempdir().expect("temporary directory");
        let transport = Arc::new(transport);
        let manager = DatasetManager::new(config_for(&dir), transport.clone());
        Self {
            dir,
            transport,
            manager,
        }
    }

    /// A second manager over the same directory and transport, as a new
    /// process would see it.
    pub fn reopen(&self) -> DatasetManager {
        DatasetManager::new(config_for(&self.dir), self.transport.clone())
    }

    pub fn store_bytes(&self) -> Vec<u8> {
        std::fs::read(self.manager.config().store_path()).expect("store file")
    }
}

pub fn config_for(dir: &TempDir) -> Config {
    Config::default().with_cache_dir(dir.path())
}

fn registry_row(
    region: (&str, &str),
    province: (&str, &str, &str),
    code: &str,
    name: &str,
    cadastral: &str,
) -> String {
    let mut fields = vec![""; 20];
    fields[0] = region.0;
    fields[2] = province.0;
    fields[4] = code;
    fields[5] = name;
    fields[6] = name;
    fields[10] = region.1;
    fields[11] = province.1;
    fields[14] = province.2;
    fields[19] = cadastral;
    fields.join(";")
}

/// Registry CSV in Windows-1252, with a header row and the ISTAT
/// apostrophe spelling of accents.
pub fn registry_csv() -> Vec<u8> {
    let mut header = vec!["Codice Regione"; 20];
    header[4] = "Codice Comune formato alfanumerico";
    let mut lines = vec![header.join(";")];

    let lombardia = ("3", "Lombardia");
    for (code, name, abbreviation, capital, capital_name) in LOMBARDIA {
        lines.push(registry_row(
            lombardia,
            (code, name, abbreviation),
            capital,
            capital_name,
            "X000",
        ));
    }
    let lazio = ("12", "Lazio");
    let roma = ("058", "Roma", "RM");
    lines.push(registry_row(lazio, roma, "058091", "Roma", "H501"));
    lines.push(registry_row(lazio, roma, "058120", "Fiumicino", "M297"));
    let piemonte = ("01", "Piemonte");
    let torino = ("001", "Torino", "TO");
    lines.push(registry_row(piemonte, torino, "001001", "Aglie'", "A074"));
    lines.push(registry_row(piemonte, torino, "001272", "Torino", "L219"));
    lines.push(registry_row(piemonte, torino, "001272", "Torino duplicato", "L219"));
    let aosta = ("02", "Valle d'Aosta/Vallée d'Aoste");
    lines.push(registry_row(
        aosta,
        ("007", "Valle d'Aosta/Vallée d'Aoste", "AO"),
        "007003",
        "Aosta",
        "A326",
    ));
    lines.push("01;;001;;00x;Broken".to_string());

    let text = lines.join("\r\n") + "\r\n";
    encoding_rs::WINDOWS_1252.encode(&text).0.into_owned()
}

pub fn population_csv() -> Vec<u8> {
    [
        "COD_ISTAT_COMUNE,RESIDENTI",
        "58091,2754719",
        "15146,1371498",
        // Retired code of Monza, still published by slower sources.
        "015149,123598",
        "999999,10",
        "1272,not-a-number",
    ]
    .join("\n")
    .into_bytes()
}

pub fn centroids_csv() -> Vec<u8> {
    [
        "code,lat,lng",
        "058091,41.8933,12.4829",
        "015146,45.4642,9.1900",
        "001272,45.0703,7.6869",
        "001001,95.0,7.7",
    ]
    .join("\n")
    .into_bytes()
}

pub fn postal_json() -> Vec<u8> {
    serde_json::json!([
        {"codice": "058091", "nome": "Roma", "cap": ["00119", "00118"]},
        {"codice": 15146, "nome": "Milano", "cap": ["20121", "20122"]},
        {"nome": "Fiumicino", "cap": "00054"},
        {"codice": "001272", "nome": "Torino", "cap": []}
    ])
    .to_string()
    .into_bytes()
}

/// Classification workbook wrapped in a zip archive, as ISTAT publishes it.
pub fn geo_stats_zip() -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    let header = [
        "Codice Regione",
        "Codice Istat del Comune",
        "Denominazione",
        "Provincia",
        "Regione",
        "Superficie territoriale (kmq)",
        "Zona",
        "Popolazione residente",
        "Zona altimetrica",
        "Altitudine del centro",
        "Comune litoraneo",
        "Comune isolano",
        "Zone costiere",
        "Grado di urbanizzazione",
    ];
    for (col, title) in header.iter().enumerate() {
        sheet
            .write_string(0, col as u16, *title)
            .expect("header cell");
    }

    // (code, surface, population, zone, altitude, coastal, island, urbanization)
    let rows = [
        ("058091", 1287.36, 2_700_000.0, 5.0, 20.0, 1.0, 0.0, 1.0),
        ("015146", 181.67, 1_350_000.0, 5.0, 122.0, 0.0, 0.0, 1.0),
        ("001001", 13.15, 2_591.0, 3.0, 315.0, 0.0, 0.0, 3.0),
    ];
    for (idx, (code, surface, population, zone, altitude, coastal, island, urbanization)) in
        rows.into_iter().enumerate()
    {
        let row = idx as u32 + 1;
        sheet.write_number(row, 0, 1.0).expect("cell");
        sheet.write_string(row, 1, code).expect("cell");
        sheet.write_number(row, 5, surface).expect("cell");
        sheet.write_number(row, 7, population).expect("cell");
        sheet.write_number(row, 8, zone).expect("cell");
        sheet.write_number(row, 9, altitude).expect("cell");
        sheet.write_number(row, 10, coastal).expect("cell");
        sheet.write_number(row, 11, island).expect("cell");
        sheet.write_number(row, 13, urbanization).expect("cell");
    }
    let workbook_bytes = workbook.save_to_buffer().expect("workbook serialised");

    let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
    archive
        .start_file(
            "Classificazioni statistiche.xlsx",
            zip::write::FileOptions::default(),
        )
        .expect("zip entry");
    archive.write_all(&workbook_bytes).expect("zip content");
    archive.finish().expect("zip finished").into_inner()
}
