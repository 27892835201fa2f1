use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;

use metrond::clock::NS_PER_SEC;
use metrond::config::{GuardrailConfig, PullerConfig, UidMapConfig};
use metrond::dimension::ConfigKey;
use metrond::error::PullError;
use metrond::event::{FieldMatcher, LogEvent, Value};
use metrond::metrics::activation::{Activation, ActivationType};
use metrond::metrics::condition::ConditionState;
use metrond::metrics::count::CountMetricProducer;
use metrond::metrics::def::CountMetric;
use metrond::metrics::{MetricProducer, ProducerContext};
use metrond::monitor::Monitor;
use metrond::packages::{AppInfo, UidMap};
use metrond::puller::manager::{PullerManager, ReceiverRef};
use metrond::puller::{PullAtomCallback, PullDataReceiver, PullResult, PullUidProvider};
use metrond::report::StatsLogReport;

const TAG: i32 = 10020;
const UID: i32 = 1234;
const MINUTE_NS: i64 = 60 * NS_PER_SEC;

fn minute_metric(id: i64) -> CountMetric {
    CountMetric {
        id,
        what_atom_tag: TAG,
        bucket: Some(Duration::from_secs(60)),
        ..Default::default()
    }
}

fn event_at(secs: i64) -> LogEvent {
    LogEvent::new(TAG, secs * NS_PER_SEC, secs * NS_PER_SEC)
}

fn dump(producer: &mut CountMetricProducer, secs: i64, erase: bool) -> StatsLogReport {
    producer.on_dump_report(secs * NS_PER_SEC, false, erase, None)
}

fn bucket_counts(report: &StatsLogReport) -> Vec<i64> {
    report
        .count_metrics
        .iter()
        .flat_map(|w| &w.data)
        .flat_map(|d| &d.bucket_info)
        .filter_map(|b| b.count)
        .collect()
}

#[test]
fn basic_count_aggregates_one_bucket() {
    let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
    let mut producer = CountMetricProducer::new(
        &minute_metric(1),
        &ctx,
        None,
        &[],
        HashMap::new(),
        HashMap::new(),
    );

    for t in [0, 10, 20, 30, 40] {
        producer.on_matched_log_event(0, &event_at(t));
    }

    let report = dump(&mut producer, 70, true);
    assert_eq!(bucket_counts(&report), vec![5]);

    // Round-trip through the wire format.
    let mut buf = Vec::new();
    report.encode_length_delimited(&mut buf).expect("encode");
    let decoded = StatsLogReport::decode_length_delimited(buf.as_slice()).expect("decode");
    assert_eq!(decoded.metric_id, Some(1));
    assert_eq!(bucket_counts(&decoded), vec![5]);

    // After an erasing dump there is nothing left to report.
    let report = dump(&mut producer, 140, false);
    assert!(report.count_metrics.is_none());
}

#[test]
fn condition_gates_counts_and_true_time_is_reported() {
    let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
    let mut producer = CountMetricProducer::new(
        &minute_metric(2),
        &ctx,
        Some(0),
        &[ConditionState::False],
        HashMap::new(),
        HashMap::new(),
    );

    producer.on_matched_log_event(0, &event_at(10));
    producer.on_condition_changed(true, 20 * NS_PER_SEC);
    producer.on_matched_log_event(0, &event_at(25));
    producer.on_matched_log_event(0, &event_at(40));
    producer.on_condition_changed(false, 50 * NS_PER_SEC);
    producer.on_matched_log_event(0, &event_at(55));

    let report = dump(&mut producer, 60, false);
    let wrapper = report.count_metrics.expect("data");
    let bucket = &wrapper.data[0].bucket_info[0];
    assert_eq!(bucket.count, Some(2));
    assert_eq!(bucket.condition_true_ns, Some(30 * NS_PER_SEC));
}

#[test]
fn event_count_is_conserved_across_buckets() {
    let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
    let mut producer = CountMetricProducer::new(
        &minute_metric(3),
        &ctx,
        None,
        &[],
        HashMap::new(),
        HashMap::new(),
    );

    let times = [1, 5, 59, 61, 70, 121, 122, 123, 299];
    for t in times {
        producer.on_matched_log_event(0, &event_at(t));
    }

    let report = producer.on_dump_report(301 * NS_PER_SEC, true, false, None);
    let total: i64 = bucket_counts(&report).iter().sum();
    assert_eq!(total, times.len() as i64);
}

#[test]
fn dimension_guardrail_caps_cardinality_and_flags_report() {
    let def = CountMetric {
        dimensions_in_what: vec![FieldMatcher::leaf(1)],
        ..minute_metric(4)
    };
    let mut ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
    ctx.guardrail = GuardrailConfig {
        dimension_soft_limit: 0,
        dimension_hard_limit_min: 2,
        dimension_hard_limit_max: 2,
        ..GuardrailConfig::default()
    };
    let mut producer =
        CountMetricProducer::new(&def, &ctx, None, &[], HashMap::new(), HashMap::new());

    for (t, v) in [(1, 100), (2, 200), (3, 300), (4, 100), (5, 200), (6, 300)] {
        let mut event = event_at(t);
        event.push_value(Value::Int(v));
        producer.on_matched_log_event(0, &event);
    }

    let report = dump(&mut producer, 70, false);
    assert_eq!(report.dimension_guardrail_hit, Some(true));
    let total: i64 = bucket_counts(&report).iter().sum();
    let wrapper = report.count_metrics.expect("data");
    assert_eq!(wrapper.data.len(), 2);
    // The third value's events were dropped entirely.
    assert_eq!(total, 4);
}

#[test]
fn expired_activation_stops_aggregation() {
    let mut activations = HashMap::new();
    activations.insert(0, Activation::new(ActivationType::Immediate, 30 * NS_PER_SEC));
    let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
    let mut producer = CountMetricProducer::new(
        &minute_metric(5),
        &ctx,
        None,
        &[],
        activations,
        HashMap::new(),
    );

    producer.activate(0, 0);
    producer.on_matched_log_event(0, &event_at(10));

    producer.flush_if_expire(40 * NS_PER_SEC);
    producer.on_matched_log_event(0, &event_at(40));

    let report = dump(&mut producer, 70, false);
    assert_eq!(report.is_active, Some(false));
    assert_eq!(bucket_counts(&report), vec![1]);
}

// --- Pull scheduling ---

struct FixedUids(Vec<i32>);

impl PullUidProvider for FixedUids {
    fn pull_atom_uids(&self, _atom_tag: i32) -> Vec<i32> {
        self.0.clone()
    }
}

struct CountingCallback {
    pulls: AtomicUsize,
    dead: bool,
}

impl PullAtomCallback for CountingCallback {
    fn on_pull_atom(&self, atom_tag: i32) -> Result<Vec<LogEvent>, PullError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.dead {
            return Err(PullError::DeadObject);
        }
        Ok(vec![LogEvent::new(atom_tag, 0, 0)])
    }
}

struct RecordingReceiver {
    batches: Mutex<Vec<(usize, PullResult, i64)>>,
}

impl PullDataReceiver for RecordingReceiver {
    fn is_pull_needed(&self) -> bool {
        true
    }

    fn on_data_pulled(&mut self, data: &[LogEvent], result: PullResult, elapsed_ns: i64) {
        self.batches.lock().push((data.len(), result, elapsed_ns));
    }
}

#[test]
fn sleep_across_buckets_advances_receiver_to_future_boundary() {
    let manager = PullerManager::new(&PullerConfig::default(), Monitor::detached());
    let config = ConfigKey::new(1000, 1);
    let provider: Arc<dyn PullUidProvider> = Arc::new(FixedUids(vec![UID]));
    manager.register_pull_uid_provider(config, &provider);
    manager.register_pull_atom_callback(
        UID,
        TAG,
        0,
        NS_PER_SEC,
        vec![],
        Arc::new(CountingCallback {
            pulls: AtomicUsize::new(0),
            dead: false,
        }),
    );

    let receiver = Arc::new(Mutex::new(RecordingReceiver {
        batches: Mutex::new(Vec::new()),
    }));
    let handle: ReceiverRef = receiver.clone();
    manager.register_receiver(TAG, config, &handle, 0, MINUTE_NS);

    // The alarm fires long after several boundaries were slept away.
    manager.on_alarm_fired(185 * NS_PER_SEC);

    // 1 + (185-0)/60 = 4 intervals forward.
    assert_eq!(manager.next_pull_time_ns(), 240 * NS_PER_SEC);
    let inner = receiver.lock();
    let batches = inner.batches.lock();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], (1, PullResult::Success, 185 * NS_PER_SEC));
}

#[test]
fn dead_puller_is_evicted_and_stays_gone() {
    let manager = PullerManager::new(&PullerConfig::default(), Monitor::detached());
    let callback = Arc::new(CountingCallback {
        pulls: AtomicUsize::new(0),
        dead: true,
    });
    manager.register_pull_atom_callback(UID, TAG, 0, NS_PER_SEC, vec![], callback.clone());

    assert!(manager.pull_uids(TAG, &[UID], NS_PER_SEC).is_none());
    assert!(!manager.has_puller(UID, TAG));

    assert!(manager.pull_uids(TAG, &[UID], 2 * NS_PER_SEC).is_none());
    assert_eq!(callback.pulls.load(Ordering::SeqCst), 1);
}

// --- uid map ---

#[test]
fn isolated_uids_resolve_to_parent() {
    let map = UidMap::new(&UidMapConfig::default(), Monitor::detached());
    map.assign_isolated_uid(99001, 10012);

    assert_eq!(map.get_host_uid_or_self(99001), 10012);
    assert_eq!(map.get_host_uid_or_self(10012), 10012);
    assert_eq!(map.get_host_uid_or_self(55555), 55555);

    map.remove_isolated_uid(99001);
    assert_eq!(map.get_host_uid_or_self(99001), 99001);
}

#[test]
fn uid_map_deltas_flow_into_reports() {
    let map = UidMap::new(&UidMapConfig::default(), Monitor::detached());
    let config = ConfigKey::new(1000, 1);
    map.on_config_updated(config);

    map.update_map(
        NS_PER_SEC,
        &[
            AppInfo {
                uid: 10001,
                package_name: "pkg.one".into(),
                version: 3,
                version_string: "3.0".into(),
                installer: "store".into(),
                certificate_hash: vec![1, 2, 3, 4],
            },
            AppInfo {
                uid: 10002,
                package_name: "pkg.two".into(),
                version: 1,
                version_string: "1.0".into(),
                installer: "store".into(),
                certificate_hash: vec![5, 6, 7, 8],
            },
        ],
    );
    map.update_app(2 * NS_PER_SEC, "pkg.one", 10001, 4, "4.0", "store", &[1, 2, 3, 4]);

    let mapping = map.append_uid_map(3 * NS_PER_SEC, config, true, true, 2, None);
    assert_eq!(mapping.snapshots.len(), 1);
    assert_eq!(mapping.snapshots[0].package_info.len(), 2);
    assert_eq!(mapping.changes.len(), 3);
    let upgrade = mapping
        .changes
        .iter()
        .find(|c| c.new_version == Some(4))
        .expect("upgrade recorded");
    assert_eq!(upgrade.prev_version, Some(3));
    assert_eq!(upgrade.app.as_deref(), Some("pkg.one"));

    // Encodes as part of the report wire format.
    let mut buf = Vec::new();
    mapping.encode_length_delimited(&mut buf).expect("encode");
    assert!(!buf.is_empty());
}
