//! Report wire format.
//!
//! Reports are length-delimited protobuf messages. The numeric field
//! ids below are consumed by the upload backend and are ABI: changing
//! one silently corrupts decoded reports, so they are spelled out per
//! field rather than derived.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use prost::Message;

use crate::dimension::HashableDimensionKey;
use crate::event::{FieldMatcher, FieldValue, Value};

/// Why a report (or persisted activation state) is being produced.
/// The reason changes how boot-gated activations are saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpReportReason {
    /// Planned device shutdown: boot-gated activations survive as
    /// active for their full ttl.
    DeviceShutdown,
    /// Termination signal: treated like a planned shutdown.
    TerminationSignal,
    /// The host companion process died out from under us; do not
    /// silently re-activate boot-gated metrics on the way back up.
    CompanionDied,
    /// Ordinary data fetch.
    GetData,
    /// Configuration replaced.
    ConfigUpdated,
}

/// Activation state values persisted in [`ActiveEventActivation`].
pub const ACTIVATION_STATE_ACTIVE: i32 = 1;
pub const ACTIVATION_STATE_ACTIVATE_ON_BOOT: i32 = 2;

/// One dimension value node. Leaves carry a typed value; interior
/// nodes carry a tuple of children.
#[derive(Clone, PartialEq, Message)]
pub struct DimensionsValue {
    #[prost(int32, optional, tag = "1")]
    pub field: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub value_str: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub value_int: Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub value_long: Option<i64>,
    #[prost(bool, optional, tag = "5")]
    pub value_bool: Option<bool>,
    #[prost(float, optional, tag = "6")]
    pub value_float: Option<f32>,
    #[prost(message, optional, tag = "7")]
    pub value_tuple: Option<DimensionsValueTuple>,
    #[prost(uint64, optional, tag = "8")]
    pub value_str_hash: Option<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DimensionsValueTuple {
    #[prost(message, repeated, tag = "1")]
    pub dimensions_value: Vec<DimensionsValue>,
}

/// Value of one external state the metric slices on.
#[derive(Clone, PartialEq, Message)]
pub struct StateValue {
    #[prost(int32, optional, tag = "1")]
    pub atom_id: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub group_id: Option<i64>,
    #[prost(int32, optional, tag = "3")]
    pub value: Option<i32>,
}

/// One closed bucket of a count metric. Full buckets are identified
/// by bucket number; partial buckets carry explicit bounds.
#[derive(Clone, PartialEq, Message)]
pub struct CountBucketInfo {
    #[prost(int64, optional, tag = "3")]
    pub count: Option<i64>,
    #[prost(int64, optional, tag = "4")]
    pub bucket_num: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub start_bucket_elapsed_millis: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub end_bucket_elapsed_millis: Option<i64>,
    #[prost(int64, optional, tag = "7")]
    pub condition_true_ns: Option<i64>,
}

/// All buckets of one dimension key.
#[derive(Clone, PartialEq, Message)]
pub struct CountMetricData {
    #[prost(message, optional, tag = "1")]
    pub dimension_in_what: Option<DimensionsValue>,
    #[prost(message, repeated, tag = "3")]
    pub bucket_info: Vec<CountBucketInfo>,
    #[prost(message, repeated, tag = "4")]
    pub dimension_leaf_values_in_what: Vec<DimensionsValue>,
    #[prost(message, repeated, tag = "6")]
    pub slice_by_state: Vec<StateValue>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CountMetricDataWrapper {
    #[prost(message, repeated, tag = "1")]
    pub data: Vec<CountMetricData>,
}

/// Serialized output of one metric producer.
#[derive(Clone, PartialEq, Message)]
pub struct StatsLogReport {
    #[prost(int64, optional, tag = "1")]
    pub metric_id: Option<i64>,
    #[prost(message, optional, tag = "5")]
    pub count_metrics: Option<CountMetricDataWrapper>,
    #[prost(int64, optional, tag = "9")]
    pub time_base_ns: Option<i64>,
    #[prost(int64, optional, tag = "10")]
    pub bucket_size_ns: Option<i64>,
    #[prost(message, optional, tag = "11")]
    pub dimension_path_in_what: Option<DimensionsValue>,
    #[prost(bool, optional, tag = "14")]
    pub is_active: Option<bool>,
    #[prost(bool, optional, tag = "17")]
    pub dimension_guardrail_hit: Option<bool>,
}

/// Persisted activation of one metric, written at shutdown and read
/// back at startup.
#[derive(Clone, PartialEq, Message)]
pub struct ActiveEventActivation {
    #[prost(int32, optional, tag = "1")]
    pub atom_matcher_index: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub remaining_ttl_nanos: Option<i64>,
    #[prost(int32, optional, tag = "3")]
    pub state: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ActiveMetric {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(message, repeated, tag = "2")]
    pub activation: Vec<ActiveEventActivation>,
}

/// One package table entry inside a snapshot.
#[derive(Clone, PartialEq, Message)]
pub struct PackageInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
    #[prost(int32, optional, tag = "3")]
    pub uid: Option<i32>,
    #[prost(bool, optional, tag = "4")]
    pub deleted: Option<bool>,
    #[prost(uint64, optional, tag = "5")]
    pub name_hash: Option<u64>,
    #[prost(string, optional, tag = "6")]
    pub version_string: Option<String>,
    #[prost(uint64, optional, tag = "7")]
    pub version_string_hash: Option<u64>,
    #[prost(string, optional, tag = "8")]
    pub installer: Option<String>,
    #[prost(bytes = "vec", optional, tag = "9")]
    pub truncated_certificate_hash: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PackageInfoSnapshot {
    #[prost(int64, optional, tag = "1")]
    pub elapsed_timestamp_ns: Option<i64>,
    #[prost(message, repeated, tag = "2")]
    pub package_info: Vec<PackageInfo>,
}

/// One install / update / removal delta.
#[derive(Clone, PartialEq, Message)]
pub struct UidMappingChange {
    #[prost(bool, optional, tag = "1")]
    pub deletion: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub app: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub uid: Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub new_version: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub prev_version: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub elapsed_timestamp_ns: Option<i64>,
    #[prost(string, optional, tag = "7")]
    pub new_version_string: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub prev_version_string: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UidMapping {
    #[prost(message, repeated, tag = "1")]
    pub snapshots: Vec<PackageInfoSnapshot>,
    #[prost(message, repeated, tag = "2")]
    pub changes: Vec<UidMappingChange>,
}

/// Everything uploaded for one configuration.
#[derive(Clone, PartialEq, Message)]
pub struct ConfigMetricsReport {
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<StatsLogReport>,
    #[prost(message, optional, tag = "2")]
    pub uid_map: Option<UidMapping>,
    #[prost(int64, optional, tag = "3")]
    pub current_report_elapsed_nanos: Option<i64>,
}

/// Appends a message to `buf` with a length-delimiter prefix.
pub fn write_length_delimited<M: Message>(msg: &M, buf: &mut Vec<u8>) -> Result<(), prost::EncodeError> {
    msg.encode_length_delimited(buf)
}

/// Stable 64-bit hash used when strings are interned out of reports.
pub fn hash64(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Converts one projected field value to a dimension leaf. With a
/// string set present, string payloads are interned and replaced by
/// their hash.
pub fn field_value_to_proto(
    fv: &FieldValue,
    str_set: Option<&mut BTreeSet<String>>,
) -> DimensionsValue {
    let mut out = DimensionsValue {
        field: Some(fv.field),
        ..Default::default()
    };
    match &fv.value {
        Value::Int(v) => out.value_int = Some(*v),
        Value::Long(v) => out.value_long = Some(*v),
        Value::Float(v) => out.value_float = Some(*v),
        Value::Bool(v) => out.value_bool = Some(*v),
        Value::Str(v) => {
            if let Some(set) = str_set {
                out.value_str_hash = Some(hash64(v));
                set.insert(v.clone());
            } else {
                out.value_str = Some(v.clone());
            }
        }
    }
    out
}

/// Writes a full dimension key as a nested tuple rooted at one node.
pub fn dimension_to_proto(
    key: &HashableDimensionKey,
    mut str_set: Option<&mut BTreeSet<String>>,
) -> DimensionsValue {
    let leaves = key
        .values()
        .iter()
        .map(|fv| field_value_to_proto(fv, str_set.as_deref_mut()))
        .collect();
    DimensionsValue {
        value_tuple: Some(DimensionsValueTuple {
            dimensions_value: leaves,
        }),
        ..Default::default()
    }
}

/// Writes only the leaf values of a dimension key, for reports that
/// share a single dimension path across buckets.
pub fn dimension_leaves_to_proto(
    key: &HashableDimensionKey,
    mut str_set: Option<&mut BTreeSet<String>>,
) -> Vec<DimensionsValue> {
    key.values()
        .iter()
        .map(|fv| field_value_to_proto(fv, str_set.as_deref_mut()))
        .collect()
}

/// Writes the field-id shape of a dimension selector, with no
/// values. Shared once per report when the selector is flat.
pub fn dimension_path_to_proto(matchers: &[FieldMatcher]) -> DimensionsValue {
    DimensionsValue {
        value_tuple: Some(DimensionsValueTuple {
            dimensions_value: matchers.iter().map(matcher_path_node).collect(),
        }),
        ..Default::default()
    }
}

fn matcher_path_node(matcher: &FieldMatcher) -> DimensionsValue {
    let mut node = DimensionsValue {
        field: Some(matcher.field),
        ..Default::default()
    };
    if !matcher.children.is_empty() {
        node.value_tuple = Some(DimensionsValueTuple {
            dimensions_value: matcher.children.iter().map(matcher_path_node).collect(),
        });
    }
    node
}

/// Converts a state slice value. Group-mapped states carry the group
/// id; raw states carry the original value.
pub fn state_value_to_proto(fv: &FieldValue) -> StateValue {
    let mut out = StateValue {
        atom_id: Some(fv.field),
        ..Default::default()
    };
    match &fv.value {
        Value::Long(group) => out.group_id = Some(*group),
        Value::Int(v) => out.value = Some(*v),
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Position;

    #[test]
    fn test_length_delimited_roundtrip() {
        let report = StatsLogReport {
            metric_id: Some(42),
            is_active: Some(true),
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_length_delimited(&report, &mut buf).expect("encode");

        let decoded =
            StatsLogReport::decode_length_delimited(buf.as_slice()).expect("decode");
        assert_eq!(decoded.metric_id, Some(42));
        assert_eq!(decoded.is_active, Some(true));
        assert_eq!(decoded.count_metrics, None);
    }

    #[test]
    fn test_field_value_to_proto_types() {
        let v = field_value_to_proto(&FieldValue::new(2, Value::Long(9)), None);
        assert_eq!(v.field, Some(2));
        assert_eq!(v.value_long, Some(9));
        assert_eq!(v.value_int, None);

        let v = field_value_to_proto(&FieldValue::new(3, Value::Str("a.b".into())), None);
        assert_eq!(v.value_str.as_deref(), Some("a.b"));
        assert_eq!(v.value_str_hash, None);
    }

    #[test]
    fn test_string_interning_replaces_value_with_hash() {
        let mut set = BTreeSet::new();
        let v = field_value_to_proto(
            &FieldValue::new(1, Value::Str("com.example".into())),
            Some(&mut set),
        );
        assert_eq!(v.value_str, None);
        assert_eq!(v.value_str_hash, Some(hash64("com.example")));
        assert!(set.contains("com.example"));
    }

    #[test]
    fn test_dimension_path_preserves_nesting() {
        let matchers = vec![FieldMatcher {
            field: 1,
            position: Position::None,
            children: vec![FieldMatcher::leaf(2)],
        }];
        let path = dimension_path_to_proto(&matchers);
        let tuple = path.value_tuple.expect("root tuple");
        assert_eq!(tuple.dimensions_value.len(), 1);
        let node = &tuple.dimensions_value[0];
        assert_eq!(node.field, Some(1));
        let children = node.value_tuple.as_ref().expect("child tuple");
        assert_eq!(children.dimensions_value[0].field, Some(2));
    }

    #[test]
    fn test_state_value_group_vs_raw() {
        let grouped = state_value_to_proto(&FieldValue::new(27, Value::Long(3)));
        assert_eq!(grouped.atom_id, Some(27));
        assert_eq!(grouped.group_id, Some(3));
        assert_eq!(grouped.value, None);

        let raw = state_value_to_proto(&FieldValue::new(27, Value::Int(-1)));
        assert_eq!(raw.group_id, None);
        assert_eq!(raw.value, Some(-1));
    }
}
