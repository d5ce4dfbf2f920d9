use crate::config::SearchConfig;
use crate::content_filter::ContentFilter;
use crate::error::PostError;
use crate::model::{Location, Post, Radius};
use crate::search_index::SearchIndex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Query string of `GET /search`
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchParams {
    pub lat: Option<String>,
    pub lon: Option<String>,
    /// Radius in kilometers
    pub range: Option<String>,
}

/// How search coordinates that fail to parse are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatePolicy {
    /// Reject missing, unparsable or out-of-range coordinates
    Strict,
    /// Treat unparsable coordinates as zero
    Lenient,
}

/// Answers proximity searches and hides denylisted posts
pub struct QueryOrchestrator {
    index: Arc<dyn SearchIndex>,
    filter: ContentFilter,
    index_name: String,
    default_radius: Radius,
    policy: CoordinatePolicy,
}

impl QueryOrchestrator {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        filter: ContentFilter,
        config: &SearchConfig,
    ) -> Result<Self, PostError> {
        let default_radius = Radius::from_km(config.default_radius_km).ok_or_else(|| {
            PostError::invalid(format!(
                "default radius must be positive, got {}",
                config.default_radius_km
            ))
        })?;

        let policy = if config.strict_coordinates {
            CoordinatePolicy::Strict
        } else {
            CoordinatePolicy::Lenient
        };

        Ok(Self {
            index,
            filter,
            index_name: config.index.clone(),
            default_radius,
            policy,
        })
    }

    /// Posts within the requested radius whose message passes the content filter
    #[instrument(skip(self))]
    pub async fn search(&self, params: &SearchParams) -> Result<Vec<Post>, PostError> {
        let center = self.parse_center(params)?;
        let radius = self.parse_radius(params.range.as_deref())?;

        info!(
            lat = center.lat,
            lon = center.lon,
            range = %radius.to_distance_string(),
            "Search received"
        );
        metrics::counter!("search.requests").increment(1);

        let hits = self
            .index
            .query_by_distance(&self.index_name, center, radius)
            .await?;

        let total = hits.len();
        let posts: Vec<Post> = hits
            .into_iter()
            .filter(|post| !self.filter.is_filtered(&post.message))
            .collect();

        let filtered = total - posts.len();
        if filtered > 0 {
            metrics::counter!("search.results_filtered").increment(filtered as u64);
        }

        debug!(total, filtered, returned = posts.len(), "Search completed");

        Ok(posts)
    }

    fn parse_center(&self, params: &SearchParams) -> Result<Location, PostError> {
        let center = Location::new(
            self.parse_coordinate("lat", params.lat.as_deref())?,
            self.parse_coordinate("lon", params.lon.as_deref())?,
        );

        if self.policy == CoordinatePolicy::Strict && !center.is_valid() {
            return Err(PostError::invalid(format!(
                "coordinates out of range: lat {}, lon {}",
                center.lat, center.lon
            )));
        }

        Ok(center)
    }

    fn parse_coordinate(&self, name: &str, raw: Option<&str>) -> Result<f64, PostError> {
        let parsed = raw.map(str::trim).and_then(|s| s.parse::<f64>().ok());

        match (parsed, self.policy) {
            (Some(value), _) => Ok(value),
            (None, CoordinatePolicy::Lenient) => Ok(0.0),
            (None, CoordinatePolicy::Strict) => Err(PostError::invalid(format!(
                "{} must be a number, got {:?}",
                name,
                raw.unwrap_or_default()
            ))),
        }
    }

    fn parse_radius(&self, raw: Option<&str>) -> Result<Radius, PostError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(self.default_radius),
            Some(value) => value
                .parse::<f64>()
                .ok()
                .and_then(Radius::from_km)
                .ok_or_else(|| {
                    PostError::invalid(format!(
                        "range must be a positive number of kilometers, got {:?}",
                        value
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PostId;
    use crate::search_index::{MockSearchIndex, SearchIndexError};
    use mockall::predicate::*;

    fn search_config(strict: bool) -> SearchConfig {
        SearchConfig {
            url: "http://localhost:9200".to_string(),
            index: "around".to_string(),
            default_radius_km: 200.0,
            max_results: 1000,
            strict_coordinates: strict,
        }
    }

    fn params(lat: &str, lon: &str, range: Option<&str>) -> SearchParams {
        SearchParams {
            lat: Some(lat.to_string()),
            lon: Some(lon.to_string()),
            range: range.map(String::from),
        }
    }

    fn post(message: &str) -> Post {
        Post::new(PostId::generate(), "john", message, Location::new(37.0, -120.0))
    }

    fn orchestrator(index: MockSearchIndex, strict: bool) -> QueryOrchestrator {
        QueryOrchestrator::new(
            Arc::new(index),
            ContentFilter::default(),
            &search_config(strict),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_default_radius_and_filtering() {
        let clean = post("clean message");
        let dirty = post("this is fuckword");
        let hits = vec![dirty, clean.clone()];

        let mut index = MockSearchIndex::new();
        index
            .expect_query_by_distance()
            .with(
                eq("around"),
                eq(Location::new(37.0, -120.0)),
                eq(Radius::from_km(200.0).unwrap()),
            )
            .times(1)
            .returning(move |_, _, _| Ok(hits.clone()));

        let posts = orchestrator(index, true)
            .search(&params("37", "-120", None))
            .await
            .unwrap();

        assert_eq!(posts, vec![clean]);
    }

    #[tokio::test]
    async fn test_only_match_filtered_gives_empty() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query_by_distance()
            .returning(|_, _, _| Ok(vec![post("fuck")]));

        let posts = orchestrator(index, true)
            .search(&params("37", "-120", Some("10")))
            .await
            .unwrap();

        assert!(posts.is_empty());
        assert_eq!(serde_json::to_string(&posts).unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_explicit_range() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query_by_distance()
            .with(always(), always(), eq(Radius::from_km(12.5).unwrap()))
            .times(1)
            .returning(|_, _, _| Ok(vec![]));

        orchestrator(index, true)
            .search(&params("1", "2", Some("12.5")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_range_is_rejected() {
        let mut index = MockSearchIndex::new();
        index.expect_query_by_distance().never();
        let orchestrator = orchestrator(index, true);

        for range in ["abc", "-5", "0", "10km"] {
            let result = orchestrator.search(&params("1", "2", Some(range))).await;
            assert!(matches!(result, Err(PostError::InvalidInput(_))), "range {}", range);
        }
    }

    #[tokio::test]
    async fn test_strict_rejects_unparsable_coordinates() {
        let mut index = MockSearchIndex::new();
        index.expect_query_by_distance().never();
        let orchestrator = orchestrator(index, true);

        let result = orchestrator.search(&params("north", "-120", None)).await;
        assert!(matches!(result, Err(PostError::InvalidInput(_))));

        let result = orchestrator.search(&SearchParams::default()).await;
        assert!(matches!(result, Err(PostError::InvalidInput(_))));

        let result = orchestrator.search(&params("95", "0", None)).await;
        assert!(matches!(result, Err(PostError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_lenient_treats_unparsable_as_zero() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query_by_distance()
            .with(always(), eq(Location::new(0.0, -120.0)), always())
            .times(1)
            .returning(|_, _, _| Ok(vec![]));

        orchestrator(index, false)
            .search(&params("north", "-120", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_index_failure_propagates() {
        let mut index = MockSearchIndex::new();
        index
            .expect_query_by_distance()
            .returning(|_, _, _| Err(SearchIndexError::Query("timeout".to_string())));

        let result = orchestrator(index, true)
            .search(&params("1", "2", None))
            .await;

        assert!(matches!(result, Err(PostError::Index(_))));
    }
}
