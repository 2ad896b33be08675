//! bikecast core crate.
//!
//! Current implemented scope:
//! - trip archive sourcing per city (plan, download, parse)
//! - hourly normalization of trip events per station and scenario
//! - lag/rolling/calendar feature windows and the SQLite feature store
//! - multi-family model training with optional seeded tuning, plus a model registry
//! - feature and prediction backfills over date ranges

mod backfill;
mod calendar;
mod city;
mod config;
mod features;
mod models;
mod normalize;
mod observability;
mod registry;
mod scenario;
mod store;
mod training;
mod trip_archives;
mod tuning;

pub use backfill::{
    BackfillConfig, BackfillCoordinator, BackfillError, BackfillReport, BackfillRequest,
    BackfillSummary, BackfillTarget, ScenarioBackfill,
};
pub use calendar::{
    calendar_features, is_us_federal_holiday, observed_federal_holidays, CALENDAR_FEATURE_NAMES,
};
pub use city::{parse_city, City, CityError, ValidRange, ALL_CITIES, PORTLAND_LAST_PUBLISHED_YEAR};
pub use config::{ConfigError, PipelineConfig, STORE_FILE_NAME};
pub use features::{
    assert_schema_compatible, build_feature_schema, FeatureBuildReport, FeatureColumn,
    FeatureConfig, FeatureDType, FeatureError, FeatureRow, FeatureSchema, FeatureWindowBuilder,
    FEATURE_SCHEMA_VERSION,
};
pub use models::{
    hyperparameter_space, parse_model_family, BoostedTrees, FittedModel, Hyperparameters,
    LassoModel, LassoParams, LightGbmModel, LightGbmParams, ModelError, ModelFamily, ParamRange,
    ParamSample, ParamScale, RegressionNode, Regressor, TrainingSet, XgBoostModel, XgBoostParams,
    ALL_MODEL_FAMILIES,
};
pub use normalize::{
    normalize_hourly, parse_event_type, truncate_to_hour, DataIntegrityError, HourlyObservation,
    IntegrityPolicy, NormalizeError, NormalizeReport, NormalizeRequest, NormalizedSeries,
    RawTripEvent, HOUR_MS,
};
pub use observability::{
    init_logging, log_command_finish, log_command_start, log_store_opened,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use registry::{InMemoryModelRegistry, ModelArtifact, ModelRegistry, RegistryError, SqliteModelRegistry};
pub use scenario::{parse_scenario, Scenario, ScenarioError, ALL_SCENARIOS};
pub use store::{FeatureFrame, FeatureStore, HourRange, Partition, PredictionRow, StoreError};
pub use training::{
    chronological_cutoff, score_predictions, SplitSummary, TrainingConfig, TrainingError,
    TrainingMetric, TrainingOrchestrator, TrainingReport, TrainingRequest, TrainingResult,
    ValidationScore,
};
pub use trip_archives::{
    archive_ref, city_has_data, parse_trip_archive, plan_trip_archives, sync_trip_archives,
    InMemoryTripSource, LocalArchiveSource, LocalArchiveTripSource, LocalTripArchive,
    TripArchiveConfig, TripArchiveRef, TripArchiveRequest, TripBatch, TripLoadError, TripSource,
};
pub use tuning::{
    plan_trials, sample_params, select_best_trial, TrialOutcome, TrialPlan, TuningConfig,
    DEFAULT_TRIAL_COUNT,
};
