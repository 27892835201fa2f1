use thiserror::Error;

/// Reasons a metric configuration is rejected. A rejected config is
/// iceboxed whole rather than run partially.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("metric {metric_id} references unknown atom matcher {matcher_id}")]
    UnknownAtomMatcher { metric_id: i64, matcher_id: i64 },

    #[error("metric {metric_id} references unknown condition {condition_id}")]
    UnknownCondition { metric_id: i64, condition_id: i64 },

    #[error("metric {metric_id} activation references unknown matcher {matcher_id}")]
    UnknownActivationMatcher { metric_id: i64, matcher_id: i64 },

    #[error("metric {metric_id} is missing subscriber information")]
    MissingSubscriberInfo { metric_id: i64 },
}

/// Failure modes of an individual pull.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullError {
    /// The callback reported failure or returned malformed data.
    #[error("pull failed")]
    Failed,

    /// The callback did not complete within the puller's timeout.
    #[error("pull timed out")]
    Timeout,

    /// The remote end of the callback is gone. Terminal: the puller
    /// is evicted from the registry.
    #[error("pull callback object is dead")]
    DeadObject,
}
