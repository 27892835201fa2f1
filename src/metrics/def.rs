use std::collections::HashMap;
use std::time::Duration;

use crate::dimension::{MetricConditionLink, MetricStateLink};
use crate::event::{FieldMatcher, Matcher};

/// Keep-or-drop test applied to each per-dimension bucket value
/// before it enters the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadThreshold {
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
}

impl UploadThreshold {
    pub fn passes(&self, value: i64) -> bool {
        match *self {
            UploadThreshold::LtInt(limit) => value < limit,
            UploadThreshold::GtInt(limit) => value > limit,
            UploadThreshold::LteInt(limit) => value <= limit,
            UploadThreshold::GteInt(limit) => value >= limit,
        }
    }
}

/// Declaration of one count metric, already resolved from the raw
/// configuration into internal indices and matcher lists.
#[derive(Debug, Clone, Default)]
pub struct CountMetric {
    pub id: i64,

    /// Atom tag of the "what" matcher; used for per-atom guardrail
    /// defaults.
    pub what_atom_tag: i32,

    /// Bucket width. Absent means one open-ended bucket.
    pub bucket: Option<Duration>,

    pub dimensions_in_what: Vec<FieldMatcher>,

    pub links: Vec<MetricConditionLink>,

    /// Whether the links cover every dimension of the condition
    /// tracker, letting sliced queries skip partial-match handling.
    pub has_links_to_all_condition_dimensions: bool,

    pub state_links: Vec<MetricStateLink>,
    pub sliced_state_atoms: Vec<i32>,
    /// Per state atom: raw state value → group id.
    pub state_group_map: HashMap<i32, HashMap<i32, i64>>,

    pub threshold: Option<UploadThreshold>,

    pub max_dimensions_per_bucket: Option<usize>,

    /// Close the current bucket when one of the config's packages is
    /// upgraded, so pre- and post-upgrade data never mix.
    pub split_bucket_on_app_upgrade: bool,

    /// Shard sampling: keep events whose sampled field hashes into
    /// this producer's shard. Disabled when <= 1.
    pub shard_count: u32,
    pub sampled_what_fields: Vec<Matcher>,
}

/// Tighter dimension limits for atoms known to explode cardinality
/// when sliced carelessly. Applied only when the metric declares no
/// limit of its own.
const ATOM_DIMENSION_LIMIT_OVERRIDES: &[(i32, usize)] = &[
    // ipc_call_stats
    (10006, 1500),
    // filesystem_path_stats
    (10042, 1000),
];

pub fn atom_dimension_limit_override(atom_tag: i32) -> Option<usize> {
    ATOM_DIMENSION_LIMIT_OVERRIDES
        .iter()
        .find(|(tag, _)| *tag == atom_tag)
        .map(|(_, limit)| *limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_threshold_comparisons() {
        assert!(UploadThreshold::GtInt(5).passes(6));
        assert!(!UploadThreshold::GtInt(5).passes(5));
        assert!(UploadThreshold::GteInt(5).passes(5));
        assert!(UploadThreshold::LtInt(5).passes(4));
        assert!(!UploadThreshold::LtInt(5).passes(5));
        assert!(UploadThreshold::LteInt(5).passes(5));
        assert!(!UploadThreshold::LteInt(5).passes(6));
    }

    #[test]
    fn test_atom_override_lookup() {
        assert_eq!(atom_dimension_limit_override(10006), Some(1500));
        assert_eq!(atom_dimension_limit_override(1), None);
    }
}
