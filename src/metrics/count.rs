use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error};

use crate::clock::ns_to_millis;
use crate::dimension::{HashableDimensionKey, MetricDimensionKey};
use crate::event::{FieldValue, LogEvent};
use crate::report::{
    dimension_leaves_to_proto, dimension_path_to_proto, dimension_to_proto, state_value_to_proto,
    ActiveMetric, CountBucketInfo, CountMetricData, CountMetricDataWrapper, DumpReportReason,
    StatsLogReport,
};

use super::activation::Activation;
use super::anomaly::AnomalyTracker;
use super::condition::ConditionState;
use super::def::{atom_dimension_limit_override, CountMetric, UploadThreshold};
use super::{EventContext, MetricProducer, ProducerContext, ProducerCore, BUCKET_SIZE_UNBOUNDED_NS};

/// One closed bucket of counts for one dimension key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub count: i64,
    pub condition_true_ns: i64,
}

/// Counts matched events per dimension and state slice, bucketed in
/// wall-aligned windows on the elapsed clock.
pub struct CountMetricProducer {
    core: ProducerCore,

    dimension_soft_limit: usize,
    dimension_hard_limit: usize,
    /// Latched for the producer's lifetime once any insert was
    /// rejected; reported and reset with erase.
    dimension_guardrail_hit: bool,

    upload_threshold: Option<UploadThreshold>,

    current_sliced_counter: HashMap<MetricDimensionKey, i64>,
    /// Accumulates across partial buckets so anomaly trackers always
    /// see whole-bucket values. Only maintained when trackers exist.
    current_full_counters: HashMap<MetricDimensionKey, i64>,

    past_buckets: HashMap<MetricDimensionKey, Vec<CountBucket>>,
}

impl CountMetricProducer {
    pub fn new(
        def: &CountMetric,
        ctx: &ProducerContext,
        condition_index: Option<usize>,
        initial_condition_cache: &[ConditionState],
        event_activations: HashMap<usize, Activation>,
        event_deactivations: HashMap<usize, Vec<usize>>,
    ) -> Self {
        let core = ProducerCore::new(
            def,
            ctx,
            condition_index,
            initial_condition_cache,
            event_activations,
            event_deactivations,
        );

        let declared_limit = def
            .max_dimensions_per_bucket
            .or_else(|| atom_dimension_limit_override(def.what_atom_tag));

        let mut producer = Self {
            dimension_soft_limit: ctx.guardrail.dimension_soft_limit,
            dimension_hard_limit: ctx.guardrail.clamp_dimension_hard_limit(declared_limit),
            dimension_guardrail_hit: false,
            upload_threshold: def.threshold,
            current_sliced_counter: HashMap::new(),
            current_full_counters: HashMap::new(),
            past_buckets: HashMap::new(),
            core,
        };

        // Catch the bucket number up from the time base, then adjust
        // the first bucket to start partially at the start time.
        producer.flush_if_needed(ctx.start_time_ns);
        producer.core.current_bucket_start_ns = ctx.start_time_ns;
        producer
            .core
            .condition_timer
            .new_bucket_start(ctx.start_time_ns, ctx.start_time_ns);
        let gate_open =
            producer.core.is_active && producer.core.condition == ConditionState::True;
        producer
            .core
            .condition_timer
            .on_condition_changed(gate_open, ctx.start_time_ns);

        debug!(
            metric = producer.core.metric_id,
            bucket_size_ns = producer.core.bucket_size_ns,
            time_base_ns = producer.core.time_base_ns,
            "count metric created"
        );

        producer
    }

    pub fn add_anomaly_tracker(&mut self, tracker: Arc<dyn AnomalyTracker>) {
        self.core.anomaly_trackers.push(tracker);
    }

    /// Remaps indices after a config update. Activation objects for
    /// surviving matchers carry over; anomaly trackers are cleared
    /// for re-registration.
    pub fn on_config_updated(
        &mut self,
        wizard: Arc<dyn super::ConditionWizard>,
        new_condition_index: Option<usize>,
        matcher_index_remap: &HashMap<usize, usize>,
    ) {
        self.core
            .on_config_updated(wizard, new_condition_index, matcher_index_remap);
    }

    pub fn past_bucket_count(&self) -> usize {
        self.past_buckets.values().map(Vec::len).sum()
    }

    fn count_passes_threshold(&self, count: i64) -> bool {
        match self.upload_threshold {
            None => true,
            Some(threshold) => threshold.passes(count),
        }
    }

    /// Consulted on insertion of a new dimension key only.
    fn hit_guard_rail(&mut self, new_key: &MetricDimensionKey) -> bool {
        if self.current_sliced_counter.contains_key(new_key) {
            return false;
        }
        if self.current_sliced_counter.len() >= self.dimension_soft_limit {
            let new_tuple_count = self.current_sliced_counter.len() + 1;
            self.core
                .monitor
                .note_metric_dimension_size(self.core.metric_id, new_tuple_count);
            if new_tuple_count > self.dimension_hard_limit {
                if !self.core.has_hit_guardrail {
                    error!(
                        metric = self.core.metric_id,
                        key = %new_key,
                        "dropping data at dimension hard limit"
                    );
                    self.core.has_hit_guardrail = true;
                }
                self.dimension_guardrail_hit = true;
                self.core
                    .monitor
                    .note_hard_dimension_limit_reached(self.core.metric_id);
                return true;
            }
        }
        false
    }

    fn on_matched_log_event_internal(&mut self, prepared: &EventContext, event: &LogEvent) {
        let event_time_ns = event.elapsed_ts_ns;
        self.flush_if_needed(event_time_ns);

        if !prepared.condition {
            return;
        }

        let key = &prepared.metric_key;
        match self.current_sliced_counter.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                if self.hit_guard_rail(key) {
                    return;
                }
                self.current_sliced_counter.insert(key.clone(), 1);
            }
        }

        if !self.core.anomaly_trackers.is_empty() {
            let whole_bucket = self.current_sliced_counter[key]
                + self.current_full_counters.get(key).copied().unwrap_or(0);
            for tracker in &self.core.anomaly_trackers {
                tracker.detect_and_declare_anomaly(
                    event_time_ns,
                    self.core.current_bucket_num,
                    self.core.metric_id,
                    key,
                    whole_bucket,
                );
            }
        }

        debug!(
            metric = self.core.metric_id,
            key = %key,
            count = self.current_sliced_counter[key],
            "counted"
        );
    }

    /// Closes completed buckets when the event lands past the current
    /// bucket end, jumping over any buckets skipped during sleep.
    fn flush_if_needed(&mut self, event_time_ns: i64) {
        let current_bucket_end_ns = self.core.current_bucket_end_ns();
        if event_time_ns < current_bucket_end_ns {
            return;
        }

        let num_buckets_forward =
            1 + (event_time_ns - current_bucket_end_ns) / self.core.bucket_size_ns;
        let next_bucket_start_ns =
            current_bucket_end_ns + (num_buckets_forward - 1) * self.core.bucket_size_ns;
        self.flush_current_bucket(event_time_ns, next_bucket_start_ns);

        self.core.current_bucket_num += num_buckets_forward;
        debug!(
            metric = self.core.metric_id,
            start_ns = self.core.current_bucket_start_ns,
            "new bucket"
        );
    }

    /// Force-closes the current bucket at `event_time_ns`, first
    /// retiring any fully elapsed buckets.
    fn flush(&mut self, event_time_ns: i64) {
        self.flush_if_needed(event_time_ns);
        self.flush_current_bucket(event_time_ns, event_time_ns);
    }

    fn flush_current_bucket(&mut self, event_time_ns: i64, next_bucket_start_ns: i64) {
        let full_bucket_end_ns = self.core.current_bucket_end_ns();
        let bucket_end_ns = event_time_ns.min(full_bucket_end_ns);

        let (condition_true_ns, _correction_ns) = self
            .core
            .condition_timer
            .new_bucket_start(event_time_ns, next_bucket_start_ns);

        let info_template = CountBucket {
            start_ns: self.core.current_bucket_start_ns,
            end_ns: bucket_end_ns,
            count: 0,
            condition_true_ns,
        };

        for (key, &count) in &self.current_sliced_counter {
            if self.count_passes_threshold(count) {
                self.past_buckets.entry(key.clone()).or_default().push(CountBucket {
                    count,
                    ..info_template
                });
            }
        }

        if !self.core.anomaly_trackers.is_empty() {
            if event_time_ns > full_bucket_end_ns {
                // A full bucket completed; hand whole-bucket values
                // to the trackers.
                if !self.current_full_counters.is_empty() {
                    for (key, count) in &self.current_sliced_counter {
                        *self.current_full_counters.entry(key.clone()).or_insert(0) += count;
                    }
                    let handed = Arc::new(std::mem::take(&mut self.current_full_counters));
                    for tracker in &self.core.anomaly_trackers {
                        tracker.add_past_bucket(handed.clone(), self.core.current_bucket_num);
                    }
                } else {
                    // No partial carry-over; the sliced counter is the
                    // whole bucket.
                    let handed = Arc::new(self.current_sliced_counter.clone());
                    for tracker in &self.core.anomaly_trackers {
                        tracker.add_past_bucket(handed.clone(), self.core.current_bucket_num);
                    }
                }
            } else {
                // Partial close: accumulate until the full bucket ends.
                for (key, count) in &self.current_sliced_counter {
                    *self.current_full_counters.entry(key.clone()).or_insert(0) += count;
                }
            }
        }

        self.core.monitor.note_bucket_flushed(self.core.metric_id);
        self.current_sliced_counter.clear();
        self.core.current_bucket_start_ns = next_bucket_start_ns;
        self.core.has_hit_guardrail = false;
    }

    fn writes_condition_true_ns(&self) -> bool {
        // Attribution is ambiguous once the metric is sliced by state
        // or condition; the field is suppressed there.
        self.core.condition_tracker_index.is_some()
            && self.core.sliced_state_atoms.is_empty()
            && !self.core.condition_sliced
    }
}

impl MetricProducer for CountMetricProducer {
    fn metric_id(&self) -> i64 {
        self.core.metric_id
    }

    fn on_matched_log_event(&mut self, _matcher_index: usize, event: &LogEvent) {
        let Some(prepared) = self.core.prepare_event(event) else {
            return;
        };
        self.on_matched_log_event_internal(&prepared, event);
    }

    fn on_condition_changed(&mut self, condition_met: bool, event_time_ns: i64) {
        debug!(metric = self.core.metric_id, condition_met, "condition changed");
        self.core.condition = ConditionState::from_met(condition_met);

        // The timer only runs while the metric is active.
        if !self.core.is_active {
            return;
        }

        self.core
            .condition_timer
            .on_condition_changed(condition_met, event_time_ns);
    }

    fn on_sliced_condition_may_change(&mut self, _overall_condition: bool, _event_time_ns: i64) {
        debug!(metric = self.core.metric_id, "sliced condition may change");
    }

    fn on_state_changed(
        &mut self,
        event_time_ns: i64,
        atom_id: i32,
        primary_key: &HashableDimensionKey,
        old_state: &FieldValue,
        new_state: &FieldValue,
    ) {
        // Counts read states at event time; nothing to re-attribute.
        debug!(
            metric = self.core.metric_id,
            event_time_ns,
            atom = atom_id,
            key = %primary_key,
            old = %old_state.value,
            new = %new_state.value,
            "state changed"
        );
    }

    fn activate(&mut self, activation_tracker_index: usize, elapsed_ns: i64) {
        if self.core.activate_internal(activation_tracker_index, elapsed_ns) {
            self.on_active_state_changed(elapsed_ns, true);
        }
    }

    fn cancel_event_activation(&mut self, deactivation_tracker_index: usize) {
        self.core
            .cancel_event_activation_internal(deactivation_tracker_index);
    }

    fn flush_if_expire(&mut self, elapsed_ns: i64) {
        if self.core.flush_if_expire_internal(elapsed_ns) {
            // Hook runs before the flag drops so a pull triggered by
            // the transition is still accepted.
            self.on_active_state_changed(elapsed_ns, false);
            self.core.set_inactive();
        }
    }

    fn is_active(&self) -> bool {
        self.core.is_active
    }

    fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        mut str_set: Option<&mut BTreeSet<String>>,
    ) -> StatsLogReport {
        if include_current_partial_bucket {
            self.flush(dump_time_ns);
        } else {
            self.flush_if_needed(dump_time_ns);
        }

        let mut report = StatsLogReport {
            metric_id: Some(self.core.metric_id),
            is_active: Some(self.core.is_active),
            ..Default::default()
        };

        if self.past_buckets.is_empty() {
            return report;
        }

        if self.dimension_guardrail_hit {
            report.dimension_guardrail_hit = Some(true);
        }

        report.time_base_ns = Some(self.core.time_base_ns);
        report.bucket_size_ns = Some(self.core.bucket_size_ns);

        // A flat dimension spec is written once as a shared path;
        // buckets then carry only leaf values. Nested specs repeat the
        // full dimension tree per key.
        if !self.core.nested_dimensions && !self.core.declared_dimensions.is_empty() {
            report.dimension_path_in_what =
                Some(dimension_path_to_proto(&self.core.declared_dimensions));
        }

        let mut wrapper = CountMetricDataWrapper::default();
        for (key, buckets) in &self.past_buckets {
            let mut data = CountMetricData::default();

            if self.core.nested_dimensions {
                data.dimension_in_what =
                    Some(dimension_to_proto(key.dimension_in_what(), str_set.as_deref_mut()));
            } else {
                data.dimension_leaf_values_in_what =
                    dimension_leaves_to_proto(key.dimension_in_what(), str_set.as_deref_mut());
            }

            for state in key.state_values_key().values() {
                data.slice_by_state.push(state_value_to_proto(state));
            }

            for bucket in buckets {
                let mut info = CountBucketInfo {
                    count: Some(bucket.count),
                    ..Default::default()
                };
                if bucket.end_ns - bucket.start_ns != self.core.bucket_size_ns {
                    info.start_bucket_elapsed_millis = Some(ns_to_millis(bucket.start_ns));
                    info.end_bucket_elapsed_millis = Some(ns_to_millis(bucket.end_ns));
                } else {
                    info.bucket_num = Some(self.core.bucket_num_from_end_ns(bucket.end_ns));
                }
                if self.writes_condition_true_ns() {
                    info.condition_true_ns = Some(bucket.condition_true_ns);
                }
                data.bucket_info.push(info);
            }
            wrapper.data.push(data);
        }
        report.count_metrics = Some(wrapper);

        if erase_data {
            self.past_buckets.clear();
            self.dimension_guardrail_hit = false;
        }

        report
    }

    fn drop_data(&mut self, drop_time_ns: i64) {
        self.flush(drop_time_ns);
        self.core.monitor.note_buckets_dropped(self.core.metric_id);
        self.past_buckets.clear();
    }

    fn load_active_metric(&mut self, active: &ActiveMetric, current_time_ns: i64) {
        self.core.load_active_metric(active, current_time_ns);
    }

    fn write_active_metric(&self, current_time_ns: i64, reason: DumpReportReason) -> ActiveMetric {
        self.core.write_active_metric(current_time_ns, reason)
    }

    fn byte_size(&self) -> usize {
        self.past_buckets
            .values()
            .map(|buckets| buckets.len() * std::mem::size_of::<CountBucket>())
            .sum()
    }

    fn clear_past_buckets(&mut self) {
        self.past_buckets.clear();
    }

    fn dump_states(&self, verbose: bool) {
        if self.current_sliced_counter.is_empty() {
            return;
        }
        debug!(
            metric = self.core.metric_id,
            dimensions = self.current_sliced_counter.len(),
            "count metric state"
        );
        if verbose {
            for (key, count) in &self.current_sliced_counter {
                debug!(key = %key, count, "current slice");
            }
        }
    }

    fn notify_app_upgrade(&mut self, event_time_ns: i64) {
        if !self.core.split_bucket_on_app_upgrade
            || self.core.bucket_size_ns == BUCKET_SIZE_UNBOUNDED_NS
        {
            return;
        }
        // Close the bucket at the upgrade so pre- and post-upgrade
        // counts never share one.
        self.flush(event_time_ns);
    }
}

impl CountMetricProducer {
    fn on_active_state_changed(&mut self, event_time_ns: i64, is_active: bool) {
        if self.core.condition != ConditionState::True {
            return;
        }
        // With the condition held true, activity is what gates the
        // timer.
        self.core
            .condition_timer
            .on_condition_changed(is_active, event_time_ns);
    }
}
