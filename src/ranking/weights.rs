//! Scoring weights
//!
//! A [`WeightVector`] maps metric names to their contribution to the overall
//! score of one entity type. Weights are non-negative and need not sum to any
//! particular total. [`WeightConfig`] groups the vectors of every weighted
//! entity type and is loaded through a [`WeightSource`] before each scheduled
//! pass, so operators can change weights without restarting the engine.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{EntityType, MetricName};
use crate::error::{Error, Result};

/// Per-metric weights for one entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(BTreeMap<MetricName, f64>);

impl WeightVector {
    pub fn new(weights: impl IntoIterator<Item = (MetricName, f64)>) -> Self {
        Self(weights.into_iter().collect())
    }

    pub fn get(&self, metric: MetricName) -> f64 {
        self.0.get(&metric).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, metric: MetricName, weight: f64) {
        self.0.insert(metric, weight);
    }

    pub fn iter(&self) -> impl Iterator<Item = (MetricName, f64)> + '_ {
        self.0.iter().map(|(m, w)| (*m, *w))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all weights; the maximum overall score an entity can reach
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Reject negative or non-finite weights
    pub fn validate(&self) -> Result<()> {
        for (metric, weight) in &self.0 {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(Error::InvalidWeight {
                    metric: metric.to_string(),
                    value: *weight,
                });
            }
        }
        Ok(())
    }
}

static DEFAULT_ARTIST: Lazy<WeightVector> = Lazy::new(|| {
    WeightVector::new([
        (MetricName::SalesCount, 35.0),
        (MetricName::SalesRevenue, 30.0),
        (MetricName::ArtworkCount, 10.0),
        (MetricName::ViewCount, 15.0),
        (MetricName::AvgRating, 10.0),
    ])
});

static DEFAULT_ARTWORK: Lazy<WeightVector> = Lazy::new(|| {
    WeightVector::new([
        (MetricName::SalesCount, 30.0),
        (MetricName::SalesRevenue, 25.0),
        (MetricName::ViewCount, 20.0),
        (MetricName::LikeCount, 10.0),
        (MetricName::ShareCount, 5.0),
        (MetricName::AvgRating, 10.0),
    ])
});

static DEFAULT_CATEGORY: Lazy<WeightVector> = Lazy::new(|| {
    WeightVector::new([
        (MetricName::ArtworkCount, 40.0),
        (MetricName::SalesCount, 35.0),
        (MetricName::ViewCount, 25.0),
    ])
});

/// Weight vectors for every weighted entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightConfig {
    #[serde(default = "default_artist")]
    pub artist: WeightVector,
    #[serde(default = "default_artwork")]
    pub artwork: WeightVector,
    #[serde(default = "default_category")]
    pub category: WeightVector,
}

fn default_artist() -> WeightVector {
    DEFAULT_ARTIST.clone()
}

fn default_artwork() -> WeightVector {
    DEFAULT_ARTWORK.clone()
}

fn default_category() -> WeightVector {
    DEFAULT_CATEGORY.clone()
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            artist: default_artist(),
            artwork: default_artwork(),
            category: default_category(),
        }
    }
}

impl WeightConfig {
    /// Weight vector for an entity type; tags and models are never weighted
    pub fn for_entity(&self, entity_type: EntityType) -> Option<&WeightVector> {
        match entity_type {
            EntityType::Artist => Some(&self.artist),
            EntityType::Artwork => Some(&self.artwork),
            EntityType::Category => Some(&self.category),
            EntityType::Tag | EntityType::Model => None,
        }
    }

    /// Replace the vector for an entity type
    pub fn set(&mut self, entity_type: EntityType, weights: WeightVector) -> Result<()> {
        weights.validate()?;
        match entity_type {
            EntityType::Artist => self.artist = weights,
            EntityType::Artwork => self.artwork = weights,
            EntityType::Category => self.category = weights,
            EntityType::Tag | EntityType::Model => {
                return Err(Error::bad_request(format!(
                    "{} rankings are count based and take no weights",
                    entity_type
                )))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.artist.validate()?;
        self.artwork.validate()?;
        self.category.validate()
    }

    /// Entity types whose vectors differ between `self` and `other`
    pub fn changed_entities(&self, other: &WeightConfig) -> Vec<EntityType> {
        [EntityType::Artist, EntityType::Artwork, EntityType::Category]
            .into_iter()
            .filter(|et| self.for_entity(*et) != other.for_entity(*et))
            .collect()
    }

    /// Parse a TOML document with `[artist]`, `[artwork]`, `[category]` tables
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: WeightConfig = toml::from_str(raw)
            .map_err(|e| Error::config(format!("Invalid weights TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Where weight configuration is read from
#[async_trait]
pub trait WeightSource: Send + Sync {
    async fn load(&self) -> Result<WeightConfig>;
}

/// Fixed weights held in memory
#[derive(Debug, Default)]
pub struct StaticWeightSource {
    weights: RwLock<WeightConfig>,
}

impl StaticWeightSource {
    pub fn new(weights: WeightConfig) -> Self {
        Self {
            weights: RwLock::new(weights),
        }
    }

    /// Swap the stored weights; picked up by the next `load`
    pub async fn replace(&self, weights: WeightConfig) {
        *self.weights.write().await = weights;
    }
}

#[async_trait]
impl WeightSource for StaticWeightSource {
    async fn load(&self) -> Result<WeightConfig> {
        Ok(self.weights.read().await.clone())
    }
}

/// Weights layered from defaults, an optional TOML file and the environment
///
/// Environment overrides use the `RANKING_WEIGHTS` prefix with `__` as the
/// separator, e.g. `RANKING_WEIGHTS__ARTIST__SALES_COUNT=40`. Layers merge per
/// metric, so a file only needs to list the weights it changes; set a weight
/// to `0` to drop a default metric.
#[derive(Debug, Clone)]
pub struct FileWeightSource {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl FileWeightSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            env_prefix: "RANKING_WEIGHTS".to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    fn build(&self) -> Result<WeightConfig> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&WeightConfig::default())?);

        if let Some(path) = &self.path {
            debug!("Reading weights from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.clone())
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let weights: WeightConfig = builder.build()?.try_deserialize()?;
        weights.validate()?;
        Ok(weights)
    }
}

#[async_trait]
impl WeightSource for FileWeightSource {
    async fn load(&self) -> Result<WeightConfig> {
        let source = self.clone();
        let weights = tokio::task::spawn_blocking(move || source.build())
            .await
            .map_err(|e| Error::config(format!("Weight loading task failed: {}", e)))??;
        info!(
            "⚖️ Loaded ranking weights (artist total {}, artwork total {}, category total {})",
            weights.artist.total(),
            weights.artwork.total(),
            weights.category.total()
        );
        Ok(weights)
    }
}
