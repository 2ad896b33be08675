//! Model artifacts and training results, persisted append-only.
//!
//! An artifact id is the sha256 of the artifact's serialized content, so re-saving an
//! identical artifact is a no-op apart from marking it as the latest.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::features::FeatureSchema;
use crate::models::{FittedModel, Hyperparameters, ModelFamily, ALL_MODEL_FAMILIES};
use crate::store::HourRange;
use crate::training::{TrainingResult, ValidationScore};
use crate::Scenario;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub artifact_id: String,
    pub model_family: ModelFamily,
    pub scenario: Scenario,
    pub hyperparameters: Hyperparameters,
    pub fitted: FittedModel,
    pub training_window: HourRange,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub validation: ValidationScore,
    pub tuning_trial_index: Option<u32>,
}

impl ModelArtifact {
    pub fn new(
        scenario: Scenario,
        hyperparameters: Hyperparameters,
        fitted: FittedModel,
        training_window: HourRange,
        schema: &FeatureSchema,
        validation: ValidationScore,
        tuning_trial_index: Option<u32>,
    ) -> Result<Self, RegistryError> {
        let mut artifact = Self {
            artifact_id: String::new(),
            model_family: fitted.family(),
            scenario,
            hyperparameters,
            fitted,
            training_window,
            schema_version: schema.version,
            schema_fingerprint: schema.fingerprint.clone(),
            validation,
            tuning_trial_index,
        };
        artifact.artifact_id = content_id(&artifact)?;
        Ok(artifact)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("artifact id {expected} does not match its content ({actual})")]
    IdMismatch { expected: String, actual: String },
    #[error("registry lock poisoned")]
    Poisoned,
}

/// Storage for fitted models and the results of the runs that produced them.
pub trait ModelRegistry: Send + Sync {
    /// Stores the artifact and marks it the latest for its (scenario, family).
    fn save(&self, artifact: &ModelArtifact) -> Result<String, RegistryError>;

    /// Latest artifact saved for the scenario and family.
    fn load(
        &self,
        scenario: Scenario,
        family: ModelFamily,
    ) -> Result<Option<ModelArtifact>, RegistryError>;

    fn record_result(&self, result: &TrainingResult) -> Result<(), RegistryError>;

    /// All results recorded for the scenario, oldest first.
    fn results(&self, scenario: Scenario) -> Result<Vec<TrainingResult>, RegistryError>;

    /// Among the latest artifact of each family, the one with the lowest validation MAE.
    fn load_best(&self, scenario: Scenario) -> Result<Option<ModelArtifact>, RegistryError> {
        let mut best: Option<ModelArtifact> = None;
        for family in ALL_MODEL_FAMILIES {
            if let Some(candidate) = self.load(scenario, family)? {
                let better = best
                    .as_ref()
                    .map(|current| candidate.validation.mae < current.validation.mae)
                    .unwrap_or(true);
                if better {
                    best = Some(candidate);
                }
            }
        }
        Ok(best)
    }
}

pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        ensure_registry_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        ensure_registry_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let mut conn = self.conn.lock().map_err(|_| RegistryError::Poisoned)?;
        f(&mut conn)
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn save(&self, artifact: &ModelArtifact) -> Result<String, RegistryError> {
        verify_id(artifact)?;
        let payload = serde_json::to_string(artifact)?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let next_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(saved_seq), 0) + 1 FROM model_artifacts",
                [],
                |row| row.get(0),
            )?;
            tx.execute(
                "
                INSERT INTO model_artifacts (artifact_id, scenario, family, saved_seq, payload_json)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(artifact_id) DO UPDATE SET saved_seq = excluded.saved_seq
                ",
                params![
                    artifact.artifact_id,
                    artifact.scenario.as_str(),
                    artifact.model_family.as_str(),
                    next_seq,
                    payload
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!(
            component = "registry",
            event = "registry.artifact.saved",
            scenario = artifact.scenario.as_str(),
            family = artifact.model_family.as_str(),
            artifact_id = %artifact.artifact_id
        );

        Ok(artifact.artifact_id.clone())
    }

    fn load(
        &self,
        scenario: Scenario,
        family: ModelFamily,
    ) -> Result<Option<ModelArtifact>, RegistryError> {
        let payload: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "
                    SELECT payload_json
                    FROM model_artifacts
                    WHERE scenario = ?1 AND family = ?2
                    ORDER BY saved_seq DESC
                    LIMIT 1
                    ",
                    params![scenario.as_str(), family.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        let artifact = match payload {
            Some(payload) => Some(serde_json::from_str::<ModelArtifact>(&payload)?),
            None => None,
        };
        if let Some(artifact) = &artifact {
            verify_id(artifact)?;
        }

        debug!(
            component = "registry",
            event = "registry.artifact.load",
            scenario = scenario.as_str(),
            family = family.as_str(),
            found = artifact.is_some()
        );

        Ok(artifact)
    }

    fn record_result(&self, result: &TrainingResult) -> Result<(), RegistryError> {
        let payload = serde_json::to_string(result)?;
        self.with_conn(|conn| {
            conn.execute(
                "
                INSERT INTO training_results (scenario, family, payload_json)
                VALUES (?1, ?2, ?3)
                ",
                params![
                    result.scenario.as_str(),
                    result.model_family.as_str(),
                    payload
                ],
            )?;
            Ok(())
        })
    }

    fn results(&self, scenario: Scenario) -> Result<Vec<TrainingResult>, RegistryError> {
        let payloads: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT payload_json
                FROM training_results
                WHERE scenario = ?1
                ORDER BY seq
                ",
            )?;
            let rows = stmt
                .query_map(params![scenario.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(RegistryError::from))
            .collect()
    }
}

/// Registry kept in process memory; used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryModelRegistry {
    artifacts: Mutex<Vec<ModelArtifact>>,
    results: Mutex<Vec<TrainingResult>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn save(&self, artifact: &ModelArtifact) -> Result<String, RegistryError> {
        verify_id(artifact)?;
        let mut artifacts = self.artifacts.lock().map_err(|_| RegistryError::Poisoned)?;
        artifacts.retain(|existing| existing.artifact_id != artifact.artifact_id);
        artifacts.push(artifact.clone());
        Ok(artifact.artifact_id.clone())
    }

    fn load(
        &self,
        scenario: Scenario,
        family: ModelFamily,
    ) -> Result<Option<ModelArtifact>, RegistryError> {
        let artifacts = self.artifacts.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(artifacts
            .iter()
            .rev()
            .find(|a| a.scenario == scenario && a.model_family == family)
            .cloned())
    }

    fn record_result(&self, result: &TrainingResult) -> Result<(), RegistryError> {
        self.results
            .lock()
            .map_err(|_| RegistryError::Poisoned)?
            .push(result.clone());
        Ok(())
    }

    fn results(&self, scenario: Scenario) -> Result<Vec<TrainingResult>, RegistryError> {
        Ok(self
            .results
            .lock()
            .map_err(|_| RegistryError::Poisoned)?
            .iter()
            .filter(|r| r.scenario == scenario)
            .cloned()
            .collect())
    }
}

fn ensure_registry_schema(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS model_artifacts (
            artifact_id TEXT NOT NULL PRIMARY KEY,
            scenario TEXT NOT NULL,
            family TEXT NOT NULL,
            saved_seq INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS model_artifacts_latest
            ON model_artifacts(scenario, family, saved_seq);

        CREATE TABLE IF NOT EXISTS training_results (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            scenario TEXT NOT NULL,
            family TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn content_id(artifact: &ModelArtifact) -> Result<String, RegistryError> {
    let mut hasher = Sha256::new();
    hasher.update(artifact.scenario.as_str());
    hasher.update(artifact.model_family.as_str());
    hasher.update(serde_json::to_vec(&artifact.hyperparameters)?);
    hasher.update(serde_json::to_vec(&artifact.fitted)?);
    hasher.update(serde_json::to_vec(&artifact.training_window)?);
    hasher.update(artifact.schema_fingerprint.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn verify_id(artifact: &ModelArtifact) -> Result<(), RegistryError> {
    let actual = content_id(artifact)?;
    if actual != artifact.artifact_id {
        return Err(RegistryError::IdMismatch {
            expected: artifact.artifact_id.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_feature_schema, FeatureConfig};
    use crate::models::{LassoParams, TrainingSet};
    use crate::normalize::HOUR_MS;

    fn artifact(alpha: f64, mae: f64) -> ModelArtifact {
        let rows: Vec<[f64; 1]> = (0..8).map(|i| [i as f64]).collect();
        let features: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let data = TrainingSet::new(features, (0..8).map(|i| i as f64).collect()).unwrap();
        let params = Hyperparameters::Lasso(LassoParams {
            alpha,
            ..LassoParams::default()
        });
        let fitted = FittedModel::fit(&params, &data, 0).unwrap();
        ModelArtifact::new(
            Scenario::Start,
            params,
            fitted,
            HourRange::new(0, 8 * HOUR_MS).unwrap(),
            &build_feature_schema(&FeatureConfig::default()),
            ValidationScore { mae, rmse: mae },
            None,
        )
        .unwrap()
    }

    #[test]
    fn sqlite_registry_returns_latest_artifact() {
        let registry = SqliteModelRegistry::open_in_memory().unwrap();
        let first = artifact(0.1, 1.0);
        let second = artifact(0.2, 2.0);
        registry.save(&first).unwrap();
        registry.save(&second).unwrap();
        let loaded = registry.load(Scenario::Start, ModelFamily::Lasso).unwrap().unwrap();
        assert_eq!(loaded.artifact_id, second.artifact_id);
        assert!(registry.load(Scenario::End, ModelFamily::Lasso).unwrap().is_none());

        registry.save(&first).unwrap();
        let loaded = registry.load(Scenario::Start, ModelFamily::Lasso).unwrap().unwrap();
        assert_eq!(loaded, first);
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let registry = InMemoryModelRegistry::new();
        let mut tampered = artifact(0.1, 1.0);
        tampered.scenario = Scenario::End;
        assert!(matches!(
            registry.save(&tampered),
            Err(RegistryError::IdMismatch { .. })
        ));
    }

    #[test]
    fn artifact_ids_are_content_addressed() {
        assert_eq!(artifact(0.1, 1.0).artifact_id, artifact(0.1, 5.0).artifact_id);
        assert_ne!(artifact(0.1, 1.0).artifact_id, artifact(0.3, 1.0).artifact_id);
    }
}
