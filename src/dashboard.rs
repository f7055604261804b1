use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::artifacts::{
    self, LoadedArtifacts, ModelMetadata, PredictionTable, validate_feature_coverage,
};
use crate::config::DashboardConfig;
use crate::contributions::{self, ContributionBreakdown, RowDecomposition};
use crate::error::{ArtifactError, DecomposeError, EmptyModelError};
use crate::metrics::{self, CalibrationBin, Confusion, MetricRegistry, MetricsView};
use crate::ranking::{self, RankedFeature};

/// One loaded artifact pair plus the settings the derived views use.
#[derive(Debug, Clone)]
pub struct Dashboard {
    config: DashboardConfig,
    registry: MetricRegistry,
    metadata: ModelMetadata,
    table: PredictionTable,
    drift: Vec<String>,
    loaded_at: DateTime<Utc>,
}

impl Dashboard {
    pub fn load(config: DashboardConfig) -> Result<Self, ArtifactError> {
        let LoadedArtifacts { metadata, table } = artifacts::load_artifacts_with_timeout(&config)?;
        Self::from_artifacts(config, metadata, table)
    }

    pub fn from_artifacts(
        config: DashboardConfig,
        metadata: ModelMetadata,
        table: PredictionTable,
    ) -> Result<Self, ArtifactError> {
        let drift = validate_feature_coverage(&metadata, &table, config.strict)?;
        Ok(Self {
            config,
            registry: MetricRegistry::standard(),
            metadata,
            table,
            drift,
            loaded_at: Utc::now(),
        })
    }

    pub fn with_registry(mut self, registry: MetricRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn model(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn table(&self) -> &PredictionTable {
        &self.table
    }

    /// Row feature columns the model has no weight for.
    pub fn drift_warnings(&self) -> &[String] {
        &self.drift
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn metrics_view(&self) -> MetricsView {
        metrics::reconcile(&self.metadata.holdout_metrics, &self.table, &self.registry)
    }

    pub fn confusion(&self) -> Confusion {
        metrics::confusion(self.table.rows())
    }

    pub fn calibration(&self) -> Vec<CalibrationBin> {
        metrics::calibration_bins(self.table.rows(), self.config.calibration_bins)
    }

    pub fn ranked_features(&self) -> Result<Vec<RankedFeature>, EmptyModelError> {
        ranking::rank_features(
            &self.metadata.model_name,
            &self.metadata.weights,
            self.config.rank_options(),
        )
    }

    pub fn decompose(&self, row_id: &str) -> Result<ContributionBreakdown, DecomposeError> {
        let row = self
            .table
            .get(row_id)
            .ok_or_else(|| DecomposeError::UnknownRow(row_id.to_string()))?;
        contributions::decompose_row(row, &self.metadata, self.config.decompose_options())
    }

    pub fn decompose_all(&self) -> Vec<RowDecomposition> {
        contributions::decompose_all(&self.table, &self.metadata, self.config.decompose_options())
    }

    pub fn top_reasons(&self, breakdown: &ContributionBreakdown) -> Vec<String> {
        contributions::top_reasons(breakdown, self.config.top_reasons)
    }
}

/// SHA-256 over both artifact files, used to tell whether a reload changed
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactFingerprint([u8; 32]);

impl ArtifactFingerprint {
    pub fn of(config: &DashboardConfig) -> Result<Self, ArtifactError> {
        let mut hasher = Sha256::new();
        for path in [&config.metadata_path, &config.predictions_path] {
            hasher.update(read_bytes(path)?);
            // Separator so moving bytes between the two files changes the digest.
            hasher.update([0u8]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    pub fn short_hex(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ArtifactError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            ArtifactError::Unreadable {
                path: path.to_path_buf(),
                source: err,
            }
        }
    })
}

/// Explicitly owned cache of the last loaded dashboard.
///
/// Nothing here is global: whoever holds the cache decides when to call
/// [`ArtifactCache::reload`], which re-reads storage and swaps the dashboard
/// only when the artifact bytes changed.
#[derive(Debug)]
pub struct ArtifactCache {
    config: DashboardConfig,
    fingerprint: ArtifactFingerprint,
    dashboard: Dashboard,
}

impl ArtifactCache {
    pub fn open(config: DashboardConfig) -> Result<Self, ArtifactError> {
        let fingerprint = ArtifactFingerprint::of(&config)?;
        let dashboard = Dashboard::load(config.clone())?;
        Ok(Self {
            config,
            fingerprint,
            dashboard,
        })
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    pub fn fingerprint(&self) -> ArtifactFingerprint {
        self.fingerprint
    }

    /// Returns `Ok(true)` when new artifacts were loaded. On error the
    /// previous dashboard stays in place.
    pub fn reload(&mut self) -> Result<bool, ArtifactError> {
        let fingerprint = ArtifactFingerprint::of(&self.config)?;
        if fingerprint == self.fingerprint {
            return Ok(false);
        }
        let dashboard = Dashboard::load(self.config.clone())?;
        info!(
            fingerprint = %fingerprint.short_hex(),
            rows = dashboard.table().len(),
            "artifacts changed on disk, cache replaced"
        );
        self.fingerprint = fingerprint;
        self.dashboard = dashboard;
        Ok(true)
    }
}
