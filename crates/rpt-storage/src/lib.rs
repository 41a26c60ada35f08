//! Postgres unit store: chunked stage-and-swap bulk upsert, serial lookups,
//! and the job-store abstraction for background runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rpt_core::CanonicalUnitRecord;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rpt-storage";

/// Fixed staging column order of the bulk-load contract.
pub const STAGING_COLUMNS: [&str; 10] = [
    "date",
    "mo_number",
    "vendor",
    "serial_number",
    "ring_size",
    "sku",
    "vqc_status",
    "vqc_reason",
    "ft_status",
    "ft_reason",
];

/// Token meaning "field genuinely absent" in the COPY stream, distinct from
/// the empty string ("present but blank").
pub const NULL_MARKER: &str = "\\N";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
}

fn scrub(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn encode_field(value: Option<&str>) -> String {
    match value {
        None => NULL_MARKER.to_string(),
        Some(text) => scrub(text),
    }
}

/// Encode one record as a tab-delimited COPY line in staging column order,
/// newline-terminated.
pub fn encode_copy_row(record: &CanonicalUnitRecord) -> String {
    let date = record
        .production_date
        .map(|d| d.format("%Y-%m-%d").to_string());
    let fields = [
        encode_field(date.as_deref()),
        encode_field(record.mo_number.as_deref()),
        encode_field(Some(record.vendor.as_str())),
        encode_field(Some(&record.serial_number)),
        encode_field(record.ring_size.as_deref()),
        encode_field(record.sku.as_deref()),
        encode_field(record.vqc_status.as_deref()),
        encode_field(record.vqc_reason.as_deref()),
        encode_field(record.ft_status.as_deref()),
        encode_field(record.ft_reason.as_deref()),
    ];
    let mut line = fields.join("\t");
    line.push('\n');
    line
}

/// Updated/inserted row counts for one applied chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub updated: u64,
    pub inserted: u64,
}

const CREATE_STAGING_SQL: &str = r#"
CREATE TEMP TABLE IF NOT EXISTS rings_staging (
    date DATE,
    mo_number VARCHAR(50),
    vendor VARCHAR(50),
    serial_number VARCHAR(100) UNIQUE,
    ring_size VARCHAR(100),
    sku VARCHAR(50),
    vqc_status VARCHAR(100),
    vqc_reason TEXT,
    ft_status VARCHAR(100),
    ft_reason TEXT
) ON COMMIT DROP
"#;

const UPDATE_SQL: &str = r#"
UPDATE rings r SET
    date = t.date, mo_number = t.mo_number, vendor = t.vendor,
    ring_size = t.ring_size, sku = t.sku,
    vqc_status = t.vqc_status, vqc_reason = t.vqc_reason,
    ft_status = t.ft_status, ft_reason = t.ft_reason,
    updated_at = NOW()
FROM rings_staging t
WHERE r.serial_number = t.serial_number
"#;

const INSERT_SQL: &str = r#"
INSERT INTO rings (date, mo_number, vendor, serial_number, ring_size, sku,
                   vqc_status, vqc_reason, ft_status, ft_reason)
SELECT t.date, t.mo_number, t.vendor, t.serial_number, t.ring_size, t.sku,
       t.vqc_status, t.vqc_reason, t.ft_status, t.ft_reason
FROM rings_staging t
LEFT JOIN rings r ON t.serial_number = r.serial_number
WHERE r.serial_number IS NULL
"#;

/// Create the transient staging table on the run's connection. The table is
/// scoped to the surrounding transaction and drops itself at commit.
pub async fn create_staging_table(conn: &mut PgConnection) -> Result<(), StoreError> {
    sqlx::query(CREATE_STAGING_SQL).execute(&mut *conn).await?;
    Ok(())
}

/// Stage one chunk through COPY, apply it as update-then-insert against the
/// permanent table, and clear the staging table for the next chunk. Must run
/// inside the run's transaction so a failure rolls back every chunk applied
/// so far.
pub async fn stage_and_apply_chunk(
    conn: &mut PgConnection,
    records: &[CanonicalUnitRecord],
) -> Result<ChunkCounts, StoreError> {
    if records.is_empty() {
        return Ok(ChunkCounts::default());
    }

    let mut stream = String::new();
    for record in records {
        stream.push_str(&encode_copy_row(record));
    }

    let copy_sql = format!(
        "COPY rings_staging({}) FROM STDIN WITH (FORMAT text, NULL '{}')",
        STAGING_COLUMNS.join(","),
        NULL_MARKER
    );
    let mut copy = conn.copy_in_raw(&copy_sql).await?;
    copy.send(stream.as_bytes()).await?;
    let staged = copy.finish().await?;
    debug!(staged, "staged chunk");

    let updated = sqlx::query(UPDATE_SQL)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    let inserted = sqlx::query(INSERT_SQL)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("TRUNCATE TABLE rings_staging")
        .execute(&mut *conn)
        .await?;

    Ok(ChunkCounts { updated, inserted })
}

/// One persisted unit row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredUnit {
    pub id: i32,
    pub serial_number: String,
    pub vendor: Option<String>,
    pub date: Option<NaiveDate>,
    pub mo_number: Option<String>,
    pub sku: Option<String>,
    pub ring_size: Option<String>,
    pub vqc_status: Option<String>,
    pub vqc_reason: Option<String>,
    pub ft_status: Option<String>,
    pub ft_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const UNIT_COLUMNS: &str = "id, serial_number, vendor, date, mo_number, sku, ring_size, \
     vqc_status, vqc_reason, ft_status, ft_reason, created_at, updated_at";

fn unit_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredUnit, sqlx::Error> {
    Ok(StoredUnit {
        id: row.try_get("id")?,
        serial_number: row.try_get("serial_number")?,
        vendor: row.try_get("vendor")?,
        date: row.try_get("date")?,
        mo_number: row.try_get("mo_number")?,
        sku: row.try_get("sku")?,
        ring_size: row.try_get("ring_size")?,
        vqc_status: row.try_get("vqc_status")?,
        vqc_reason: row.try_get("vqc_reason")?,
        ft_status: row.try_get("ft_status")?,
        ft_reason: row.try_get("ft_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Fetch one unit by serial number. Storage is case-sensitive; lookup is not.
pub async fn fetch_unit_by_serial(
    conn: &mut PgConnection,
    serial: &str,
) -> Result<Option<StoredUnit>, StoreError> {
    let sql = format!(
        "SELECT {UNIT_COLUMNS} FROM rings WHERE UPPER(serial_number) = UPPER($1)"
    );
    let row = sqlx::query(&sql)
        .bind(serial.trim())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| unit_from_row(&r)).transpose().map_err(Into::into)
}

pub async fn fetch_all_units(conn: &mut PgConnection) -> Result<Vec<StoredUnit>, StoreError> {
    let sql = format!("SELECT {UNIT_COLUMNS} FROM rings ORDER BY id");
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|r| unit_from_row(r).map_err(Into::into))
        .collect()
}

/// Filtered unit search. Empty filter fields are skipped; serial and MO
/// matching is case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub serial_numbers: Vec<String>,
    pub mo_numbers: Vec<String>,
    pub vendors: Vec<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<i64>,
}

pub const SEARCH_ROW_CAP: i64 = 5000;

/// Render the search SQL and the uppercased list binds. Split out from the
/// executing function so the clause assembly is testable without a database.
fn build_search_sql(filter: &SearchFilter) -> (String, Vec<Vec<String>>) {
    let mut sql = format!("SELECT {UNIT_COLUMNS} FROM rings WHERE 1=1");
    let mut list_binds: Vec<Vec<String>> = Vec::new();
    let mut next = 0usize;
    let mut placeholder = || {
        next += 1;
        next
    };

    let upper = |values: &[String]| {
        values
            .iter()
            .map(|v| v.trim().to_uppercase())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
    };

    let serials = upper(&filter.serial_numbers);
    if !serials.is_empty() {
        sql.push_str(&format!(" AND UPPER(serial_number) = ANY(${})", placeholder()));
        list_binds.push(serials);
    }
    let mos = upper(&filter.mo_numbers);
    if !mos.is_empty() {
        sql.push_str(&format!(" AND UPPER(mo_number) = ANY(${})", placeholder()));
        list_binds.push(mos);
    }
    if !filter.vendors.is_empty() {
        sql.push_str(&format!(" AND vendor = ANY(${})", placeholder()));
        list_binds.push(filter.vendors.clone());
    }
    if filter.date_from.is_some() {
        sql.push_str(&format!(" AND date >= ${}", placeholder()));
    }
    if filter.date_to.is_some() {
        sql.push_str(&format!(" AND date <= ${}", placeholder()));
    }
    sql.push_str(&format!(
        " ORDER BY date DESC NULLS LAST, id DESC LIMIT ${}",
        placeholder()
    ));
    (sql, list_binds)
}

pub async fn search_units(
    conn: &mut PgConnection,
    filter: &SearchFilter,
) -> Result<Vec<StoredUnit>, StoreError> {
    let (sql, list_binds) = build_search_sql(filter);
    let mut query = sqlx::query(&sql);
    for bind in list_binds {
        query = query.bind(bind);
    }
    if let Some(from) = filter.date_from {
        query = query.bind(from);
    }
    if let Some(to) = filter.date_to {
        query = query.bind(to);
    }
    query = query.bind(filter.limit.unwrap_or(SEARCH_ROW_CAP));

    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|r| unit_from_row(r).map_err(Into::into))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(text: &str) -> Option<JobStatus> {
        match text {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// One background-run job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable job tracking for background pipeline runs. The pipeline is
/// unaware of the backing mechanism.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, kind: &str, payload: serde_json::Value) -> Result<JobRecord, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError>;
    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    /// Oldest job still pending, if any.
    async fn next_pending(&self) -> Result<Option<JobRecord>, StoreError>;
}

/// In-memory job store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, kind: &str, payload: serde_json::Value) -> Result<JobRecord, StoreError> {
        let record = JobRecord {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            payload,
            status: JobStatus::Pending,
            error: None,
            created_at: Utc::now(),
        };
        self.jobs
            .lock()
            .expect("job store lock")
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.lock().expect("job store lock").get(&id).cloned())
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("job store lock");
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.status = status;
        job.error = error;
        Ok(())
    }

    async fn next_pending(&self) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.lock().expect("job store lock");
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at)
            .cloned())
    }
}

/// Postgres-backed job store. Uses its own pool so job status stays visible
/// while a run holds its exclusive connection.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, sqlx::Error> {
    let status_text: String = row.try_get("status")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        status: JobStatus::parse(&status_text).unwrap_or(JobStatus::Failed),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

const JOB_COLUMNS: &str = "id, kind, payload, status, error, created_at";

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, kind: &str, payload: serde_json::Value) -> Result<JobRecord, StoreError> {
        let id = Uuid::new_v4();
        let sql = format!(
            "INSERT INTO ingest_jobs (id, kind, payload, status) \
             VALUES ($1, $2, $3, 'pending') RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(kind)
            .bind(&payload)
            .fetch_one(&self.pool)
            .await?;
        Ok(job_from_row(&row)?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE ingest_jobs SET status = $2, error = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn next_pending(&self) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs \
             WHERE status = 'pending' ORDER BY created_at LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(&r)).transpose().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpt_core::Vendor;

    fn record(serial: &str) -> CanonicalUnitRecord {
        CanonicalUnitRecord {
            serial_number: serial.to_string(),
            vendor: Vendor::Ihc,
            production_date: NaiveDate::from_ymd_opt(2026, 2, 1),
            mo_number: Some("MO-1".to_string()),
            sku: Some("RS04".to_string()),
            ring_size: Some("9".to_string()),
            vqc_status: Some("ACCEPTED".to_string()),
            vqc_reason: Some(String::new()),
            ft_status: None,
            ft_reason: None,
        }
    }

    #[test]
    fn copy_row_distinguishes_absent_from_blank() {
        let line = encode_copy_row(&record("R1"));
        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        assert_eq!(fields.len(), STAGING_COLUMNS.len());
        assert_eq!(fields[0], "2026-02-01");
        assert_eq!(fields[2], "IHC");
        assert_eq!(fields[3], "R1");
        // Present-but-blank vqc_reason stays an empty string...
        assert_eq!(fields[7], "");
        // ...while absent ft fields become the null marker.
        assert_eq!(fields[8], NULL_MARKER);
        assert_eq!(fields[9], NULL_MARKER);
    }

    #[test]
    fn copy_row_encodes_missing_date_as_null_marker() {
        let mut r = record("R2");
        r.production_date = None;
        let line = encode_copy_row(&r);
        assert!(line.starts_with(&format!("{NULL_MARKER}\t")));
    }

    #[test]
    fn copy_row_scrubs_delimiter_characters() {
        let mut r = record("R3");
        r.mo_number = Some("MO\t1\nx\ry".to_string());
        let line = encode_copy_row(&r);
        let fields: Vec<&str> = line.trim_end_matches('\n').split('\t').collect();
        assert_eq!(fields[1], "MO 1 x y");
        assert_eq!(fields.len(), STAGING_COLUMNS.len());
    }

    #[test]
    fn search_sql_numbers_placeholders_in_bind_order() {
        let filter = SearchFilter {
            serial_numbers: vec!["r1".to_string(), "  ".to_string()],
            vendors: vec!["IHC".to_string()],
            date_from: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        };
        let (sql, list_binds) = build_search_sql(&filter);
        assert!(sql.contains("UPPER(serial_number) = ANY($1)"));
        assert!(sql.contains("vendor = ANY($2)"));
        assert!(sql.contains("date >= $3"));
        assert!(sql.contains("LIMIT $4"));
        assert!(!sql.contains("mo_number"));
        assert_eq!(list_binds, vec![vec!["R1".to_string()], vec!["IHC".to_string()]]);
    }

    #[tokio::test]
    async fn memory_job_store_tracks_lifecycle() {
        let store = MemoryJobStore::default();
        let job = store
            .create("sync", serde_json::json!({"mode": "streaming"}))
            .await
            .expect("create");
        assert_eq!(job.status, JobStatus::Pending);

        let pending = store.next_pending().await.expect("pending").expect("some");
        assert_eq!(pending.id, job.id);

        store
            .set_status(job.id, JobStatus::Failed, Some("boom".to_string()))
            .await
            .expect("set");
        let fetched = store.get(job.id).await.expect("get").expect("some");
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
        assert!(store.next_pending().await.expect("pending").is_none());

        let missing = store
            .set_status(Uuid::new_v4(), JobStatus::Running, None)
            .await;
        assert!(matches!(missing, Err(StoreError::JobNotFound(_))));
    }
}
