//! Core ranking types
//!
//! Entity types, time windows, metric names and the records produced by a
//! recompute pass. Everything here is plain data shared by the scorer, the
//! store, the cache and the API.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Category scope value meaning "no category filter"
pub const GLOBAL_SCOPE: i64 = 0;

// ============================================================================
// Entity types
// ============================================================================

/// The unit being ranked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Artist,
    Artwork,
    Category,
    Tag,
    Model,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Artist,
        EntityType::Artwork,
        EntityType::Category,
        EntityType::Tag,
        EntityType::Model,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Artist => "artist",
            EntityType::Artwork => "artwork",
            EntityType::Category => "category",
            EntityType::Tag => "tag",
            EntityType::Model => "model",
        }
    }

    /// Taxonomy terms are ranked by association count rather than weighted score
    pub fn is_taxonomy(&self) -> bool {
        matches!(
            self,
            EntityType::Category | EntityType::Tag | EntityType::Model
        )
    }

    /// Metrics the metric source reports for this entity type
    pub fn metrics(&self) -> &'static [MetricName] {
        use MetricName::*;
        match self {
            EntityType::Artist => &[
                SalesCount,
                SalesRevenue,
                ArtworkCount,
                ViewCount,
                FollowerCount,
                AvgRating,
            ],
            EntityType::Artwork => &[
                SalesCount,
                SalesRevenue,
                ViewCount,
                LikeCount,
                ShareCount,
                AvgRating,
            ],
            EntityType::Category => &[
                AssociationCount,
                ArtworkCount,
                SalesCount,
                SalesRevenue,
                ViewCount,
            ],
            EntityType::Tag | EntityType::Model => &[AssociationCount],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "artist" | "artists" => Ok(EntityType::Artist),
            "artwork" | "artworks" => Ok(EntityType::Artwork),
            "category" | "categories" => Ok(EntityType::Category),
            "tag" | "tags" => Ok(EntityType::Tag),
            "model" | "models" => Ok(EntityType::Model),
            _ => Err(Error::invalid_parameter("entity_type", s)),
        }
    }
}

// ============================================================================
// Time windows
// ============================================================================

/// Period over which metrics are aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 5] = [
        TimeWindow::Day,
        TimeWindow::Week,
        TimeWindow::Month,
        TimeWindow::Year,
        TimeWindow::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
            TimeWindow::Month => "month",
            TimeWindow::Year => "year",
            TimeWindow::All => "all",
        }
    }

    /// Length of the window, `None` for the unbounded window
    pub fn duration(&self) -> Option<Duration> {
        match self {
            TimeWindow::Day => Some(Duration::days(1)),
            TimeWindow::Week => Some(Duration::days(7)),
            TimeWindow::Month => Some(Duration::days(30)),
            TimeWindow::Year => Some(Duration::days(365)),
            TimeWindow::All => None,
        }
    }

    /// Inclusive lower bound of the window relative to `now`
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now - d)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(TimeWindow::Day),
            "week" | "weekly" => Ok(TimeWindow::Week),
            "month" | "monthly" => Ok(TimeWindow::Month),
            "year" | "yearly" => Ok(TimeWindow::Year),
            "all" | "all_time" => Ok(TimeWindow::All),
            _ => Err(Error::invalid_parameter("time_window", s)),
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Raw counters supplied by the metric source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    SalesCount,
    SalesRevenue,
    ArtworkCount,
    ViewCount,
    FollowerCount,
    LikeCount,
    ShareCount,
    AvgRating,
    AssociationCount,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::SalesCount => "sales_count",
            MetricName::SalesRevenue => "sales_revenue",
            MetricName::ArtworkCount => "artwork_count",
            MetricName::ViewCount => "view_count",
            MetricName::FollowerCount => "follower_count",
            MetricName::LikeCount => "like_count",
            MetricName::ShareCount => "share_count",
            MetricName::AvgRating => "avg_rating",
            MetricName::AssociationCount => "association_count",
        }
    }

    /// Ratings are already bounded and normalize against the rating scale
    pub fn is_rating(&self) -> bool {
        matches!(self, MetricName::AvgRating)
    }

    fn parse(s: &str) -> Option<Self> {
        let metric = match s {
            "sales_count" | "sales" => MetricName::SalesCount,
            "sales_revenue" | "revenue" => MetricName::SalesRevenue,
            "artwork_count" | "artworks" => MetricName::ArtworkCount,
            "view_count" | "views" => MetricName::ViewCount,
            "follower_count" | "followers" => MetricName::FollowerCount,
            "like_count" | "likes" => MetricName::LikeCount,
            "share_count" | "shares" => MetricName::ShareCount,
            "avg_rating" | "rating" => MetricName::AvgRating,
            "association_count" | "count" => MetricName::AssociationCount,
            _ => return None,
        };
        Some(metric)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::invalid_parameter("metric", s))
    }
}

/// Metric values keyed by name; a missing metric reads as zero
pub type Metrics = BTreeMap<MetricName, f64>;

// ============================================================================
// Scope and snapshots
// ============================================================================

/// Identifies one ranking set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub entity_type: EntityType,
    pub time_window: TimeWindow,
    pub category_scope: i64,
}

impl ScopeKey {
    pub fn new(entity_type: EntityType, time_window: TimeWindow, category_scope: i64) -> Self {
        Self {
            entity_type,
            time_window,
            category_scope: category_scope.max(GLOBAL_SCOPE),
        }
    }

    pub fn global(entity_type: EntityType, time_window: TimeWindow) -> Self {
        Self::new(entity_type, time_window, GLOBAL_SCOPE)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.entity_type, self.time_window, self.category_scope
        )
    }
}

/// An eligible entity as enumerated by the metric source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef {
    pub entity_id: i64,
    /// Owning artist for artworks, parent term for taxonomies
    pub related_id: Option<i64>,
}

impl EntityRef {
    pub fn new(entity_id: i64, related_id: Option<i64>) -> Self {
        Self {
            entity_id,
            related_id,
        }
    }
}

/// Raw metrics for one entity in one window
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub related_id: Option<i64>,
    pub time_window: TimeWindow,
    pub metrics: Metrics,
}

impl MetricSnapshot {
    pub fn new(key: &ScopeKey, entity: EntityRef, metrics: Metrics) -> Self {
        Self {
            entity_type: key.entity_type,
            entity_id: entity.entity_id,
            related_id: entity.related_id,
            time_window: key.time_window,
            metrics,
        }
    }

    /// Snapshot with every metric at zero
    pub fn zeroed(key: &ScopeKey, entity: EntityRef) -> Self {
        Self::new(key, entity, Metrics::new())
    }

    pub fn value(&self, metric: MetricName) -> f64 {
        self.metrics.get(&metric).copied().unwrap_or(0.0)
    }
}

// ============================================================================
// Ranking output
// ============================================================================

/// Persisted ranking of one entity within one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub related_id: Option<i64>,
    pub time_window: TimeWindow,
    pub category_scope: i64,
    pub rank: u32,
    pub overall_score: f64,
    pub sales_score: f64,
    pub popularity_score: f64,
    pub metrics: Metrics,
    pub calculated_at: DateTime<Utc>,
}

impl RankingRecord {
    pub fn scope_key(&self) -> ScopeKey {
        ScopeKey::new(self.entity_type, self.time_window, self.category_scope)
    }

    /// Value used when ordering a page by `field` (higher sorts first)
    pub fn sort_value(&self, field: SortField) -> f64 {
        match field {
            SortField::Rank => -(self.rank as f64),
            SortField::OverallScore => self.overall_score,
            SortField::SalesScore => self.sales_score,
            SortField::PopularityScore => self.popularity_score,
            SortField::Metric(metric) => self.metrics.get(&metric).copied().unwrap_or(0.0),
        }
    }
}

/// Complete output of one recompute pass for a scope key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSet {
    pub key: ScopeKey,
    pub generation: u64,
    pub calculated_at: DateTime<Utc>,
    pub records: Vec<RankingRecord>,
}

impl RankingSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when ranks are exactly `1..=N`, each once
    pub fn has_dense_ranks(&self) -> bool {
        has_dense_ranks(&self.records)
    }

    /// Records ordered by `field`, then sliced
    pub fn page(&self, field: SortField, limit: usize, offset: usize) -> Vec<RankingRecord> {
        let mut records: Vec<&RankingRecord> = self.records.iter().collect();
        sort_records(&mut records, field);
        records
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Check the dense rank invariant over any slice of records
pub fn has_dense_ranks(records: &[RankingRecord]) -> bool {
    let mut ranks: Vec<u32> = records.iter().map(|r| r.rank).collect();
    ranks.sort_unstable();
    ranks
        .iter()
        .enumerate()
        .all(|(idx, rank)| *rank as usize == idx + 1)
}

/// Order records by a sort field, descending, with rank as the tie-break
pub fn sort_records(records: &mut [&RankingRecord], field: SortField) {
    match field {
        SortField::Rank | SortField::OverallScore => records.sort_by_key(|r| r.rank),
        _ => records.sort_by(|a, b| {
            b.sort_value(field)
                .partial_cmp(&a.sort_value(field))
                .unwrap_or(Ordering::Equal)
                .then(a.rank.cmp(&b.rank))
        }),
    }
}

// ============================================================================
// Read-side types
// ============================================================================

/// Field a ranking page can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    Rank,
    OverallScore,
    SalesScore,
    PopularityScore,
    Metric(MetricName),
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Rank => "rank",
            SortField::OverallScore => "overall_score",
            SortField::SalesScore => "sales_score",
            SortField::PopularityScore => "popularity_score",
            SortField::Metric(metric) => metric.as_str(),
        }
    }

    /// Parse any known sort field or alias, regardless of entity type
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "rank" => Some(SortField::Rank),
            "score" | "overall" | "overall_score" => Some(SortField::OverallScore),
            "sales_score" => Some(SortField::SalesScore),
            "popularity" | "popularity_score" => Some(SortField::PopularityScore),
            other => MetricName::parse(other).map(SortField::Metric),
        }
    }

    pub fn is_valid_for(&self, entity_type: EntityType) -> bool {
        match self {
            SortField::Metric(metric) => entity_type.metrics().contains(metric),
            _ => true,
        }
    }

    /// Resolve a caller-supplied sort field, falling back to `overall_score`
    pub fn resolve(entity_type: EntityType, raw: Option<&str>) -> Self {
        raw.and_then(Self::parse)
            .filter(|field| field.is_valid_for(entity_type))
            .unwrap_or(SortField::OverallScore)
    }
}

impl Default for SortField {
    fn default() -> Self {
        SortField::OverallScore
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SortField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SortField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SortField::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown sort field '{}'", raw)))
    }
}

/// One page of rankings as returned to readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingPage {
    pub entity_type: EntityType,
    pub time_window: TimeWindow,
    pub category_scope: i64,
    pub sort_field: SortField,
    pub total: usize,
    pub items: Vec<RankingRecord>,
}

impl RankingPage {
    pub fn empty(key: &ScopeKey, sort_field: SortField) -> Self {
        Self {
            entity_type: key.entity_type,
            time_window: key.time_window,
            category_scope: key.category_scope,
            sort_field,
            total: 0,
            items: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entity_id: i64, rank: u32, views: f64) -> RankingRecord {
        let mut metrics = Metrics::new();
        metrics.insert(MetricName::ViewCount, views);
        RankingRecord {
            entity_type: EntityType::Artist,
            entity_id,
            related_id: None,
            time_window: TimeWindow::Week,
            category_scope: GLOBAL_SCOPE,
            rank,
            overall_score: 100.0 - rank as f64,
            sales_score: 0.0,
            popularity_score: 0.0,
            metrics,
            calculated_at: Utc::now(),
        }
    }

    #[test]
    fn test_entity_type_parsing_accepts_plurals() {
        assert_eq!("Artists".parse::<EntityType>().unwrap(), EntityType::Artist);
        assert_eq!("model".parse::<EntityType>().unwrap(), EntityType::Model);
        assert!("gallery".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_time_window_bounds() {
        let now = Utc::now();
        assert_eq!(TimeWindow::Week.start(now), Some(now - Duration::days(7)));
        assert_eq!(TimeWindow::All.start(now), None);
        assert!("decade".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn test_sort_field_resolution() {
        assert_eq!(
            SortField::resolve(EntityType::Artist, Some("followers")),
            SortField::Metric(MetricName::FollowerCount)
        );
        // followers are not reported for artworks
        assert_eq!(
            SortField::resolve(EntityType::Artwork, Some("followers")),
            SortField::OverallScore
        );
        assert_eq!(
            SortField::resolve(EntityType::Tag, Some("drop table")),
            SortField::OverallScore
        );
        assert_eq!(SortField::resolve(EntityType::Tag, None), SortField::OverallScore);
    }

    #[test]
    fn test_metric_map_serializes_with_names() {
        let mut metrics = Metrics::new();
        metrics.insert(MetricName::SalesRevenue, 12.5);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["sales_revenue"], 12.5);
    }

    #[test]
    fn test_dense_rank_check() {
        let records = vec![record(1, 2, 0.0), record(2, 1, 0.0), record(3, 3, 0.0)];
        assert!(has_dense_ranks(&records));

        let gap = vec![record(1, 1, 0.0), record(2, 3, 0.0)];
        assert!(!has_dense_ranks(&gap));

        let dup = vec![record(1, 1, 0.0), record(2, 1, 0.0)];
        assert!(!has_dense_ranks(&dup));
    }

    #[test]
    fn test_page_sorted_by_metric_uses_rank_tiebreak() {
        let set = RankingSet {
            key: ScopeKey::global(EntityType::Artist, TimeWindow::Week),
            generation: 1,
            calculated_at: Utc::now(),
            records: vec![record(10, 1, 5.0), record(20, 2, 50.0), record(30, 3, 50.0)],
        };

        let page = set.page(SortField::Metric(MetricName::ViewCount), 10, 0);
        let ids: Vec<i64> = page.iter().map(|r| r.entity_id).collect();
        assert_eq!(ids, vec![20, 30, 10]);

        let page = set.page(SortField::OverallScore, 1, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].entity_id, 20);
    }
}
