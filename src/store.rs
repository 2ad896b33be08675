//! SQLite-backed feature store with a features partition and a predictions partition.
//!
//! Rows are keyed by `(partition, entity_id, scenario, hour)`. An upsert replaces every
//! column of an existing key in one statement, so a key is never half-written.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::{FeatureColumn, FeatureRow, FeatureSchema};
use crate::normalize::HOUR_MS;
use crate::Scenario;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Features,
    Predictions,
}

impl Partition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Features => "features",
            Self::Predictions => "predictions",
        }
    }
}

/// Half-open `[start, end)` range of hour-aligned UTC milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc_exclusive: i64,
}

impl HourRange {
    pub fn new(start_ts_ms_utc: i64, end_ts_ms_utc_exclusive: i64) -> Result<Self, StoreError> {
        if start_ts_ms_utc % HOUR_MS != 0 || end_ts_ms_utc_exclusive % HOUR_MS != 0 {
            return Err(StoreError::InvalidRange(
                "range bounds must be hour aligned".to_string(),
            ));
        }
        if end_ts_ms_utc_exclusive < start_ts_ms_utc {
            return Err(StoreError::InvalidRange(
                "range end must not precede range start".to_string(),
            ));
        }
        Ok(Self {
            start_ts_ms_utc,
            end_ts_ms_utc_exclusive,
        })
    }

    pub fn contains(&self, hour_ts_ms_utc: i64) -> bool {
        hour_ts_ms_utc >= self.start_ts_ms_utc && hour_ts_ms_utc < self.end_ts_ms_utc_exclusive
    }

    pub fn hours(&self) -> u64 {
        ((self.end_ts_ms_utc_exclusive - self.start_ts_ms_utc) / HOUR_MS) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub entity_id: String,
    pub scenario: Scenario,
    pub hour_ts_ms_utc: i64,
    pub predicted_count: f64,
    pub artifact_id: String,
}

/// Feature rows read back from the store together with the schema they were written under.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureFrame {
    pub schema: Option<FeatureSchema>,
    /// Ordered by `(entity_id, hour)`.
    pub rows: Vec<FeatureRow>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid hour range: {0}")]
    InvalidRange(String),
    #[error("row {entity_id}/{scenario}@{hour_ts_ms_utc} has {actual} values, schema expects {expected}")]
    RowShape {
        entity_id: String,
        scenario: Scenario,
        hour_ts_ms_utc: i64,
        expected: usize,
        actual: usize,
    },
    #[error("stored feature rows span {0} schema fingerprints; re-backfill the range")]
    MixedSchemas(usize),
    #[error("unknown feature schema fingerprint: {0}")]
    UnknownSchema(String),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

pub struct FeatureStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl FeatureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        ensure_store_schema(&conn)?;

        debug!(
            component = "store",
            event = "store.open",
            path = %path.display()
        );

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_store_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn upsert_features(
        &mut self,
        rows: &[FeatureRow],
        schema: &FeatureSchema,
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        for row in rows {
            if row.values.len() != schema.columns.len() {
                return Err(StoreError::RowShape {
                    entity_id: row.entity_id.clone(),
                    scenario: row.scenario,
                    hour_ts_ms_utc: row.hour_ts_ms_utc,
                    expected: schema.columns.len(),
                    actual: row.values.len(),
                });
            }
        }

        let columns_json = serde_json::to_string(&schema.columns)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT INTO feature_schemas (fingerprint, version, columns_json)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(fingerprint) DO NOTHING
            ",
            params![schema.fingerprint, schema.version, columns_json],
        )?;
        {
            let mut stmt = tx.prepare(UPSERT_ROW_SQL)?;
            for row in rows {
                stmt.execute(params![
                    Partition::Features.as_str(),
                    row.entity_id,
                    row.scenario.as_str(),
                    row.hour_ts_ms_utc,
                    Some(schema.fingerprint.as_str()),
                    Some(serde_json::to_string(&row.values)?),
                    row.target,
                    Option::<f64>::None,
                    Option::<&str>::None,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.upsert",
            partition = Partition::Features.as_str(),
            rows = rows.len(),
            schema_fingerprint = %schema.fingerprint
        );

        Ok(rows.len() as u64)
    }

    pub fn upsert_predictions(&mut self, rows: &[PredictionRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_ROW_SQL)?;
            for row in rows {
                stmt.execute(params![
                    Partition::Predictions.as_str(),
                    row.entity_id,
                    row.scenario.as_str(),
                    row.hour_ts_ms_utc,
                    Option::<&str>::None,
                    Option::<String>::None,
                    Option::<u32>::None,
                    Some(row.predicted_count),
                    Some(row.artifact_id.as_str()),
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.upsert",
            partition = Partition::Predictions.as_str(),
            rows = rows.len()
        );

        Ok(rows.len() as u64)
    }

    /// Reads feature rows in `range`; keys never written are simply absent.
    pub fn read_features(
        &self,
        entity_ids: Option<&[String]>,
        scenario: Scenario,
        range: HourRange,
    ) -> Result<FeatureFrame, StoreError> {
        let raw: Vec<(String, i64, String, String, Option<u32>)> = self.select_rows(
            Partition::Features,
            entity_ids,
            scenario,
            range,
            "schema_fingerprint, values_json, target",
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    row.get(4)?,
                ))
            },
        )?;

        let fingerprints: BTreeSet<&str> = raw.iter().map(|r| r.2.as_str()).collect();
        if fingerprints.len() > 1 {
            return Err(StoreError::MixedSchemas(fingerprints.len()));
        }
        let schema = match fingerprints.first() {
            Some(fingerprint) => Some(self.load_schema(fingerprint)?),
            None => None,
        };

        let mut rows = Vec::with_capacity(raw.len());
        for (entity_id, hour_ts_ms_utc, _, values_json, target) in raw {
            rows.push(FeatureRow {
                entity_id,
                scenario,
                hour_ts_ms_utc,
                values: serde_json::from_str(&values_json)?,
                target,
            });
        }

        Ok(FeatureFrame { schema, rows })
    }

    pub fn read_predictions(
        &self,
        entity_ids: Option<&[String]>,
        scenario: Scenario,
        range: HourRange,
    ) -> Result<Vec<PredictionRow>, StoreError> {
        let raw: Vec<(String, i64, Option<f64>, Option<String>)> = self.select_rows(
            Partition::Predictions,
            entity_ids,
            scenario,
            range,
            "predicted_count, artifact_id",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        raw.into_iter()
            .map(|(entity_id, hour_ts_ms_utc, predicted_count, artifact_id)| {
                match (predicted_count, artifact_id) {
                    (Some(predicted_count), Some(artifact_id)) => Ok(PredictionRow {
                        entity_id,
                        scenario,
                        hour_ts_ms_utc,
                        predicted_count,
                        artifact_id,
                    }),
                    _ => Err(StoreError::Corrupt(format!(
                        "prediction {entity_id}/{scenario}@{hour_ts_ms_utc} is missing fields"
                    ))),
                }
            })
            .collect()
    }

    pub fn count_range(
        &self,
        partition: Partition,
        scenario: Scenario,
        range: HourRange,
    ) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM store_rows
            WHERE partition = ?1
              AND scenario = ?2
              AND hour_ts_ms >= ?3
              AND hour_ts_ms < ?4
            ",
            params![
                partition.as_str(),
                scenario.as_str(),
                range.start_ts_ms_utc,
                range.end_ts_ms_utc_exclusive
            ],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn entity_ids(
        &self,
        partition: Partition,
        scenario: Scenario,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT entity_id
            FROM store_rows
            WHERE partition = ?1 AND scenario = ?2
            ORDER BY entity_id
            ",
        )?;
        let ids = stmt
            .query_map(params![partition.as_str(), scenario.as_str()], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// First and last stored hour for the partition and scenario, if any rows exist.
    pub fn hour_bounds(
        &self,
        partition: Partition,
        scenario: Scenario,
    ) -> Result<Option<(i64, i64)>, StoreError> {
        let bounds: (Option<i64>, Option<i64>) = self.conn.query_row(
            "
            SELECT MIN(hour_ts_ms), MAX(hour_ts_ms)
            FROM store_rows
            WHERE partition = ?1 AND scenario = ?2
            ",
            params![partition.as_str(), scenario.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match bounds {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        })
    }

    fn select_rows<T>(
        &self,
        partition: Partition,
        entity_ids: Option<&[String]>,
        scenario: Scenario,
        range: HourRange,
        extra_columns: &str,
        map_extra: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let base = format!(
            "
            SELECT entity_id, hour_ts_ms, {extra_columns}
            FROM store_rows
            WHERE partition = ?1
              AND scenario = ?2
              AND hour_ts_ms >= ?3
              AND hour_ts_ms < ?4
            "
        );

        let mut out = Vec::new();
        match entity_ids {
            None => {
                let sql = format!("{base} ORDER BY entity_id, hour_ts_ms");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![
                        partition.as_str(),
                        scenario.as_str(),
                        range.start_ts_ms_utc,
                        range.end_ts_ms_utc_exclusive
                    ],
                    |row| map_extra(row),
                )?;
                for row in rows {
                    out.push(row?);
                }
            }
            Some(ids) => {
                let ordered: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
                let sql = format!("{base} AND entity_id = ?5 ORDER BY hour_ts_ms");
                let mut stmt = self.conn.prepare(&sql)?;
                for entity_id in ordered {
                    let rows = stmt.query_map(
                        params![
                            partition.as_str(),
                            scenario.as_str(),
                            range.start_ts_ms_utc,
                            range.end_ts_ms_utc_exclusive,
                            entity_id
                        ],
                        |row| map_extra(row),
                    )?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
        }

        debug!(
            component = "store",
            event = "store.read",
            partition = partition.as_str(),
            scenario = scenario.as_str(),
            start_ts_ms_utc = range.start_ts_ms_utc,
            end_ts_ms_utc_exclusive = range.end_ts_ms_utc_exclusive,
            rows = out.len()
        );

        Ok(out)
    }

    fn load_schema(&self, fingerprint: &str) -> Result<FeatureSchema, StoreError> {
        let stored: Option<(u32, String)> = self
            .conn
            .query_row(
                "SELECT version, columns_json FROM feature_schemas WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (version, columns_json) =
            stored.ok_or_else(|| StoreError::UnknownSchema(fingerprint.to_string()))?;
        let columns: Vec<FeatureColumn> = serde_json::from_str(&columns_json)?;
        Ok(FeatureSchema {
            version,
            fingerprint: fingerprint.to_string(),
            columns,
        })
    }
}

const UPSERT_ROW_SQL: &str = "
    INSERT INTO store_rows (
        partition,
        entity_id,
        scenario,
        hour_ts_ms,
        schema_fingerprint,
        values_json,
        target,
        predicted_count,
        artifact_id
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(partition, entity_id, scenario, hour_ts_ms) DO UPDATE SET
        schema_fingerprint = excluded.schema_fingerprint,
        values_json = excluded.values_json,
        target = excluded.target,
        predicted_count = excluded.predicted_count,
        artifact_id = excluded.artifact_id
";

fn ensure_store_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS feature_schemas (
            fingerprint TEXT NOT NULL PRIMARY KEY,
            version INTEGER NOT NULL,
            columns_json TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS store_rows (
            partition TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            scenario TEXT NOT NULL,
            hour_ts_ms INTEGER NOT NULL,
            schema_fingerprint TEXT,
            values_json TEXT,
            target INTEGER,
            predicted_count REAL,
            artifact_id TEXT,
            PRIMARY KEY(partition, entity_id, scenario, hour_ts_ms)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS store_rows_by_hour
            ON store_rows(partition, scenario, hour_ts_ms);
        ",
    )?;
    Ok(())
}
