//! Worksheet source contracts, column resolution, and vendor field mapping.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rpt_core::{FtResult, ProductionRow, QcResult, RawCell, Vendor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rpt-adapters";

/// Opaque worksheet address: a source handle plus a worksheet (tab) name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetRef {
    pub handle: String,
    pub worksheet: String,
}

impl WorksheetRef {
    pub fn new(handle: impl Into<String>, worksheet: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            worksheet: worksheet.into(),
        }
    }
}

/// A worksheet grid: row 0 of the source is the header row, every cell is
/// untyped text. Data rows may be ragged relative to the header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetRows {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("worksheet {handle}/{worksheet} unreachable: {message}")]
    Unreachable {
        handle: String,
        worksheet: String,
        message: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Transport boundary to the spreadsheet source. Implementations own
/// authentication and paging mechanics; callers only see ordered rows.
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Read an entire worksheet, header row included.
    async fn read_worksheet(&self, sheet: &WorksheetRef) -> Result<SheetRows, SheetError>;

    /// Read a bounded window of data rows. `offset` 0 is the first row after
    /// the header; the header row is returned with every window. An empty
    /// `rows` vec signals the end of the worksheet.
    async fn read_window(
        &self,
        sheet: &WorksheetRef,
        offset: usize,
        limit: usize,
    ) -> Result<SheetRows, SheetError>;
}

/// Fixture-backed source reading `<root>/<handle>/<worksheet>.json` grids.
/// Stands in for the live spreadsheet transport in tests and offline runs.
#[derive(Debug, Clone)]
pub struct FixtureSheetSource {
    root: PathBuf,
}

impl FixtureSheetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sheet_path(&self, sheet: &WorksheetRef) -> PathBuf {
        self.root
            .join(&sheet.handle)
            .join(format!("{}.json", sheet.worksheet))
    }

    fn load(&self, sheet: &WorksheetRef) -> Result<SheetRows, SheetError> {
        let path = self.sheet_path(sheet);
        if !path.exists() {
            return Err(SheetError::Unreachable {
                handle: sheet.handle.clone(),
                worksheet: sheet.worksheet.clone(),
                message: format!("no fixture at {}", path.display()),
            });
        }
        read_json_file(&path).map_err(SheetError::Anyhow)
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl SheetSource for FixtureSheetSource {
    async fn read_worksheet(&self, sheet: &WorksheetRef) -> Result<SheetRows, SheetError> {
        self.load(sheet)
    }

    async fn read_window(
        &self,
        sheet: &WorksheetRef,
        offset: usize,
        limit: usize,
    ) -> Result<SheetRows, SheetError> {
        let full = self.load(sheet)?;
        let rows = full
            .rows
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(SheetRows {
            headers: full.headers,
            rows,
        })
    }
}

/// Find the first header matching an ordered pattern list. Matching is exact
/// on the trimmed, lowercased header text; first match wins across the
/// pattern list, then across header order. Absence is not an error.
pub fn resolve_column(headers: &[String], patterns: &[&str]) -> Option<usize> {
    for pattern in patterns {
        let wanted = pattern.trim().to_lowercase();
        for (idx, header) in headers.iter().enumerate() {
            if header.trim().to_lowercase() == wanted {
                return Some(idx);
            }
        }
    }
    None
}

fn cell(row: &[String], idx: Option<usize>) -> RawCell {
    match idx.and_then(|i| row.get(i)) {
        Some(value) => RawCell::Value(value.clone()),
        None => RawCell::Absent,
    }
}

/// Production-log column spellings for one vendor.
#[derive(Debug, Clone, Copy)]
pub struct VendorColumns {
    pub vendor: Vendor,
    pub serial: &'static str,
    pub mo: &'static str,
    pub sku: &'static str,
    pub size: &'static str,
}

pub const VENDOR_COLUMNS: [VendorColumns; 3] = [
    VendorColumns {
        vendor: Vendor::ThreeDeTech,
        serial: "UID",
        mo: "3DE MO",
        sku: "SKU",
        size: "SIZE",
    },
    VendorColumns {
        vendor: Vendor::Ihc,
        serial: "IHC",
        mo: "IHC MO",
        sku: "IHC SKU",
        size: "IHC SIZE",
    },
    VendorColumns {
        vendor: Vendor::Makenica,
        serial: "MAKENICA",
        mo: "MK MO",
        sku: "MAKENICA SKU",
        size: "MAKENICA SIZE",
    },
];

pub const DATE_PATTERNS: [&str; 3] = ["logged_timestamp", "timestamp", "date"];
pub const SERIAL_PATTERNS: [&str; 2] = ["uid", "serial"];
pub const QC_STATUS_PATTERNS: [&str; 2] = ["status", "result"];
pub const FT_STATUS_PATTERNS: [&str; 3] = ["status", "result", "test result"];
pub const REASON_PATTERNS: [&str; 2] = ["reason", "comments"];

#[derive(Debug, Error)]
pub enum MapError {
    #[error("no vendor serial column found in the production headers")]
    NoVendorColumns,
}

#[derive(Debug, Clone, Copy)]
struct VendorLayout {
    vendor: Vendor,
    serial: usize,
    mo: Option<usize>,
    sku: Option<usize>,
    size: Option<usize>,
}

/// Resolved column positions for the production log, computed once per run
/// from the header row.
#[derive(Debug, Clone)]
pub struct ProductionLayout {
    date: Option<usize>,
    vendors: Vec<VendorLayout>,
}

impl ProductionLayout {
    /// Resolve each vendor's template independently. Vendors whose serial
    /// column is missing are unavailable for this source; if no vendor's
    /// serial column resolves at all the run cannot proceed.
    pub fn resolve(headers: &[String]) -> Result<Self, MapError> {
        let date = resolve_column(headers, &DATE_PATTERNS);
        let vendors: Vec<VendorLayout> = VENDOR_COLUMNS
            .iter()
            .filter_map(|tpl| {
                resolve_column(headers, &[tpl.serial]).map(|serial| VendorLayout {
                    vendor: tpl.vendor,
                    serial,
                    mo: resolve_column(headers, &[tpl.mo]),
                    sku: resolve_column(headers, &[tpl.sku]),
                    size: resolve_column(headers, &[tpl.size]),
                })
            })
            .collect();

        if vendors.is_empty() {
            return Err(MapError::NoVendorColumns);
        }
        Ok(Self { date, vendors })
    }

    /// Attribute one row to the first vendor (enumeration order) whose serial
    /// cell is non-blank. Rows matching no vendor map to `None`.
    pub fn map_row(&self, row: &[String]) -> Option<ProductionRow> {
        let layout = self
            .vendors
            .iter()
            .find(|l| !cell(row, Some(l.serial)).is_blank())?;
        let serial = row.get(layout.serial)?.trim().to_string();
        Some(ProductionRow {
            serial_number: serial,
            vendor: layout.vendor,
            production_date: cell(row, self.date),
            mo_number: cell(row, layout.mo),
            sku: cell(row, layout.sku),
            ring_size: cell(row, layout.size),
        })
    }
}

/// Vendor-attributed production rows plus the count of rows no vendor
/// claimed.
#[derive(Debug, Clone, Default)]
pub struct NormalizedProduction {
    pub rows: Vec<ProductionRow>,
    pub unmapped_rows: usize,
}

pub fn normalize_production(sheet: &SheetRows) -> Result<NormalizedProduction, MapError> {
    let layout = ProductionLayout::resolve(&sheet.headers)?;
    let mut normalized = NormalizedProduction::default();
    for row in &sheet.rows {
        match layout.map_row(row) {
            Some(mapped) => normalized.rows.push(mapped),
            None => normalized.unmapped_rows += 1,
        }
    }
    Ok(normalized)
}

/// Resolved column positions for a quality or functional-test sheet.
#[derive(Debug, Clone, Copy)]
pub struct ResultLayout {
    serial: usize,
    status: Option<usize>,
    reason: Option<usize>,
}

impl ResultLayout {
    /// `None` when the sheet carries no recognizable serial column; callers
    /// treat that source as unavailable and proceed.
    pub fn resolve(headers: &[String], status_patterns: &[&str]) -> Option<Self> {
        Some(Self {
            serial: resolve_column(headers, &SERIAL_PATTERNS)?,
            status: resolve_column(headers, status_patterns),
            reason: resolve_column(headers, &REASON_PATTERNS),
        })
    }
}

/// Normalize one vendor's quality sub-sheet. Rows with a blank serial are
/// dropped.
pub fn normalize_qc(vendor: Vendor, sheet: &SheetRows) -> Vec<QcResult> {
    let Some(layout) = ResultLayout::resolve(&sheet.headers, &QC_STATUS_PATTERNS) else {
        return Vec::new();
    };
    sheet
        .rows
        .iter()
        .filter_map(|row| {
            let serial = row.get(layout.serial).map(|s| s.trim()).unwrap_or("");
            if serial.is_empty() {
                return None;
            }
            Some(QcResult {
                serial_number: serial.to_string(),
                vendor,
                status: cell(row, layout.status),
                reason: cell(row, layout.reason),
            })
        })
        .collect()
}

/// Normalize the functional-test sheet; no vendor partition.
pub fn normalize_ft(sheet: &SheetRows) -> Vec<FtResult> {
    let Some(layout) = ResultLayout::resolve(&sheet.headers, &FT_STATUS_PATTERNS) else {
        return Vec::new();
    };
    sheet
        .rows
        .iter()
        .filter_map(|row| {
            let serial = row.get(layout.serial).map(|s| s.trim()).unwrap_or("");
            if serial.is_empty() {
                return None;
            }
            Some(FtResult {
                serial_number: serial.to_string(),
                status: cell(row, layout.status),
                reason: cell(row, layout.reason),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolver_prefers_earlier_patterns_then_earlier_headers() {
        let h = headers(&["Result", "Status", "status"]);
        assert_eq!(resolve_column(&h, &["status", "result"]), Some(1));
        assert_eq!(resolve_column(&h, &["result"]), Some(0));
    }

    #[test]
    fn resolver_matches_exact_case_insensitive_only() {
        let h = headers(&["  UID  ", "Serial Number"]);
        assert_eq!(resolve_column(&h, &["uid"]), Some(0));
        // No fuzzy matching: "serial" must not match "Serial Number".
        assert_eq!(resolve_column(&h, &["serial"]), None);
        assert_eq!(resolve_column(&h, &["nope"]), None);
    }

    #[test]
    fn production_rows_attribute_to_exactly_one_vendor() {
        let h = headers(&["date", "UID", "IHC", "IHC MO"]);
        let layout = ProductionLayout::resolve(&h).unwrap();

        // Both the 3DE TECH and IHC serial cells are filled; the first vendor
        // in enumeration order wins.
        let mapped = layout.map_row(&row(&["2026-01-05", "R100", "R200", "MO-7"])).unwrap();
        assert_eq!(mapped.vendor, Vendor::ThreeDeTech);
        assert_eq!(mapped.serial_number, "R100");

        let mapped = layout.map_row(&row(&["2026-01-05", "", "R200", "MO-7"])).unwrap();
        assert_eq!(mapped.vendor, Vendor::Ihc);
        assert_eq!(mapped.mo_number, RawCell::from("MO-7"));
    }

    #[test]
    fn whitespace_only_serial_is_unmapped() {
        let sheet = SheetRows {
            headers: headers(&["UID", "SKU"]),
            rows: vec![row(&["   ", "RS-1"]), row(&["R1", "RS-2"])],
        };
        let normalized = normalize_production(&sheet).unwrap();
        assert_eq!(normalized.rows.len(), 1);
        assert_eq!(normalized.unmapped_rows, 1);
        assert_eq!(normalized.rows[0].serial_number, "R1");
    }

    #[test]
    fn missing_vendor_columns_are_fatal() {
        let sheet = SheetRows {
            headers: headers(&["date", "notes"]),
            rows: vec![row(&["2026-01-05", "x"])],
        };
        assert!(matches!(
            normalize_production(&sheet),
            Err(MapError::NoVendorColumns)
        ));
    }

    #[test]
    fn ragged_rows_yield_absent_cells() {
        let h = headers(&["UID", "3DE MO", "SKU", "SIZE"]);
        let layout = ProductionLayout::resolve(&h).unwrap();
        let mapped = layout.map_row(&row(&["R9"])).unwrap();
        assert_eq!(mapped.mo_number, RawCell::Absent);
        assert_eq!(mapped.sku, RawCell::Absent);
    }

    #[test]
    fn qc_rows_resolve_status_and_reason_aliases() {
        let sheet = SheetRows {
            headers: headers(&["Serial", "Result", "Comments"]),
            rows: vec![row(&["r1", "ACCEPTED", ""]), row(&["", "REJECTED", "no serial"])],
        };
        let qc = normalize_qc(Vendor::Ihc, &sheet);
        assert_eq!(qc.len(), 1);
        assert_eq!(qc[0].serial_number, "r1");
        assert_eq!(qc[0].vendor, Vendor::Ihc);
        assert_eq!(qc[0].status, RawCell::from("ACCEPTED"));
        assert_eq!(qc[0].reason, RawCell::from(""));
    }

    #[test]
    fn ft_rows_accept_test_result_column() {
        let sheet = SheetRows {
            headers: headers(&["UID", "Test Result", "Reason"]),
            rows: vec![row(&["A1", "FAIL", "BATTERY ISSUE"])],
        };
        let ft = normalize_ft(&sheet);
        assert_eq!(ft.len(), 1);
        assert_eq!(ft[0].status, RawCell::from("FAIL"));
        assert_eq!(ft[0].reason, RawCell::from("BATTERY ISSUE"));
    }

    #[test]
    fn sheets_without_serial_column_normalize_to_nothing() {
        let sheet = SheetRows {
            headers: headers(&["Status", "Reason"]),
            rows: vec![row(&["ACCEPTED", ""])],
        };
        assert!(normalize_qc(Vendor::Makenica, &sheet).is_empty());
        assert!(normalize_ft(&sheet).is_empty());
    }

    #[tokio::test]
    async fn fixture_source_reads_and_windows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sheet_dir = dir.path().join("prod-log");
        std::fs::create_dir_all(&sheet_dir).expect("mkdir");
        let grid = SheetRows {
            headers: headers(&["UID"]),
            rows: (0..5).map(|i| row(&[&format!("R{i}")])).collect(),
        };
        std::fs::write(
            sheet_dir.join("Working.json"),
            serde_json::to_vec(&grid).expect("serialize"),
        )
        .expect("write fixture");

        let source = FixtureSheetSource::new(dir.path());
        let sheet = WorksheetRef::new("prod-log", "Working");

        let full = source.read_worksheet(&sheet).await.expect("read");
        assert_eq!(full.rows.len(), 5);

        let window = source.read_window(&sheet, 4, 2).await.expect("window");
        assert_eq!(window.rows, vec![row(&["R4"])]);
        let window = source.read_window(&sheet, 5, 2).await.expect("window");
        assert!(window.rows.is_empty());

        let missing = WorksheetRef::new("prod-log", "Archive");
        assert!(matches!(
            source.read_worksheet(&missing).await,
            Err(SheetError::Unreachable { .. })
        ));
    }
}
