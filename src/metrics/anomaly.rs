use std::collections::HashMap;
use std::sync::Arc;

use crate::dimension::MetricDimensionKey;

/// Per-dimension aggregate values for one full bucket.
pub type DimToValMap = HashMap<MetricDimensionKey, i64>;

/// Observer of per-bucket aggregates, used by alert subscriptions.
///
/// Handed-off maps are shared and must not be mutated afterwards; a
/// tracker may keep them past the producer's next bucket.
pub trait AnomalyTracker: Send + Sync {
    /// Records the aggregates of a completed full bucket.
    fn add_past_bucket(&self, bucket: Arc<DimToValMap>, bucket_num: i64);

    /// Evaluates the running whole-bucket value for one key against
    /// the tracker's threshold.
    fn detect_and_declare_anomaly(
        &self,
        event_time_ns: i64,
        bucket_num: i64,
        metric_id: i64,
        key: &MetricDimensionKey,
        whole_bucket_value: i64,
    );
}
