//! Core domain model and status derivation for RPT.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CRATE_NAME: &str = "rpt-core";

/// Known production vendors. The declaration order is the attribution order:
/// a production row belongs to the first vendor whose serial column holds a
/// non-blank value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    ThreeDeTech,
    Ihc,
    Makenica,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::ThreeDeTech, Vendor::Ihc, Vendor::Makenica];

    /// Storage spelling, matching the sub-sheet names in the quality source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::ThreeDeTech => "3DE TECH",
            Vendor::Ihc => "IHC",
            Vendor::Makenica => "MAKENICA",
        }
    }

    pub fn parse(input: &str) -> Option<Vendor> {
        let trimmed = input.trim();
        Vendor::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(trimmed))
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One untyped cell, distinguishing a column that was absent from the source
/// from a column that was present but blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawCell {
    #[default]
    Absent,
    Value(String),
}

impl RawCell {
    pub fn value(&self) -> Option<&str> {
        match self {
            RawCell::Absent => None,
            RawCell::Value(v) => Some(v.as_str()),
        }
    }

    /// True when the cell is absent or trims to the empty string.
    pub fn is_blank(&self) -> bool {
        self.value().map(str::trim).unwrap_or("").is_empty()
    }

    pub fn into_option(self) -> Option<String> {
        match self {
            RawCell::Absent => None,
            RawCell::Value(v) => Some(v),
        }
    }
}

impl From<&str> for RawCell {
    fn from(value: &str) -> Self {
        RawCell::Value(value.to_string())
    }
}

/// One vendor-attributed row of the production log, uniformly named
/// regardless of the vendor's source column spelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRow {
    pub serial_number: String,
    pub vendor: Vendor,
    pub production_date: RawCell,
    pub mo_number: RawCell,
    pub sku: RawCell,
    pub ring_size: RawCell,
}

/// One quality-control result, keyed by `(serial_number, vendor)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcResult {
    pub serial_number: String,
    pub vendor: Vendor,
    pub status: RawCell,
    pub reason: RawCell,
}

/// One functional-test result, keyed by serial number alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtResult {
    pub serial_number: String,
    pub status: RawCell,
    pub reason: RawCell,
}

/// The reconciled record for one physical unit. Optional fields are absent
/// when no source supplied them; an empty string is a legitimate
/// present-but-blank value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalUnitRecord {
    pub serial_number: String,
    pub vendor: Vendor,
    pub production_date: Option<NaiveDate>,
    pub mo_number: Option<String>,
    pub sku: Option<String>,
    pub ring_size: Option<String>,
    pub vqc_status: Option<String>,
    pub vqc_reason: Option<String>,
    pub ft_status: Option<String>,
    pub ft_reason: Option<String>,
}

impl CanonicalUnitRecord {
    /// Join one production row against its optional quality and functional
    /// results. Missing matches yield absent fields, never errors.
    pub fn from_parts(
        production: &ProductionRow,
        qc: Option<&QcResult>,
        ft: Option<&FtResult>,
    ) -> Self {
        Self {
            serial_number: production.serial_number.clone(),
            vendor: production.vendor,
            production_date: parse_production_date(&production.production_date),
            mo_number: production.mo_number.clone().into_option(),
            sku: production.sku.clone().into_option(),
            ring_size: production.ring_size.clone().into_option(),
            vqc_status: qc.and_then(|q| q.status.clone().into_option()),
            vqc_reason: qc.and_then(|q| q.reason.clone().into_option()),
            ft_status: ft.and_then(|f| f.status.clone().into_option()),
            ft_reason: ft.and_then(|f| f.reason.clone().into_option()),
        }
    }
}

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Coerce a raw date cell to a date; unparsable or blank input becomes
/// `None` (the null marker at the staging boundary).
pub fn parse_production_date(cell: &RawCell) -> Option<NaiveDate> {
    let text = cell.value().map(str::trim).filter(|t| !t.is_empty())?;
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date());
        }
    }
    None
}

/// Final disposition labels for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    Accepted,
    Rejected,
    Pending,
}

/// The quality stage a disposition is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityStage {
    Vqc,
    Ft,
}

/// A derived disposition: final label, the stage that decided it, and the
/// rejection reason when the label is `Rejected`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disposition {
    pub status: FinalStatus,
    pub stage: QualityStage,
    pub reason: Option<String>,
}

/// Status tokens that count as passing at either quality stage.
pub const PASSING_STATUSES: [&str; 2] = ["ACCEPTED", "PASS"];

fn is_passing(status: &str) -> bool {
    PASSING_STATUSES
        .iter()
        .any(|token| status.trim().eq_ignore_ascii_case(token))
}

fn stage_has_data(status: Option<&str>) -> bool {
    !status.map(str::trim).unwrap_or("").is_empty()
}

/// Derive the final disposition of one unit from its cascading quality-stage
/// results. A functional-test result always supersedes an upstream QC result:
/// only QC-accepted units physically reach functional test. Pure and
/// idempotent.
pub fn derive_disposition(record: &CanonicalUnitRecord) -> Disposition {
    derive_stage_disposition(
        record.vqc_status.as_deref(),
        record.vqc_reason.as_deref(),
        record.ft_status.as_deref(),
        record.ft_reason.as_deref(),
    )
}

/// Same derivation over bare stage fields, for callers holding store rows
/// rather than canonical records.
pub fn derive_stage_disposition(
    vqc_status: Option<&str>,
    vqc_reason: Option<&str>,
    ft_status: Option<&str>,
    ft_reason: Option<&str>,
) -> Disposition {
    let has_vqc = stage_has_data(vqc_status);
    let has_ft = stage_has_data(ft_status);

    let (stage, status, reason) = match (has_vqc, has_ft) {
        (false, false) => (QualityStage::Vqc, None, None),
        (true, false) => (QualityStage::Vqc, vqc_status, vqc_reason),
        _ => (QualityStage::Ft, ft_status, ft_reason),
    };

    match status {
        None => Disposition {
            status: FinalStatus::Pending,
            stage,
            reason: None,
        },
        Some(text) if is_passing(text) => Disposition {
            status: FinalStatus::Accepted,
            stage,
            reason: None,
        },
        Some(_) => Disposition {
            status: FinalStatus::Rejected,
            stage,
            reason: reason.map(str::to_string),
        },
    }
}
