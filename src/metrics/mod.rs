pub mod activation;
pub mod anomaly;
pub mod condition;
pub mod count;
pub mod def;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::GuardrailConfig;
use crate::dimension::{
    dimension_for_condition, dimension_for_state, filter_single_value, filter_values, ConditionKey,
    ConfigKey, HashableDimensionKey, MetricDimensionKey,
};
use crate::event::{
    should_keep_sample, should_use_nested_dimensions, translate_field_matchers, FieldMatcher,
    FieldValue, LogEvent, Matcher, Value,
};
use crate::monitor::Monitor;
use crate::report::{
    ActiveEventActivation, ActiveMetric, DumpReportReason, StatsLogReport,
    ACTIVATION_STATE_ACTIVATE_ON_BOOT, ACTIVATION_STATE_ACTIVE,
};

use self::activation::{Activation, ActivationState, ActivationType};
use self::anomaly::AnomalyTracker;
use self::condition::{ConditionState, ConditionTimer};
use self::def::CountMetric;

/// Sentinel state value reported when a sliced state cannot be
/// resolved or its value is missing from the group map.
pub const STATE_UNKNOWN: i32 = -1;

/// Sentinel bucket size for metrics with no declared bucket: a single
/// bucket that never closes on its own.
pub const BUCKET_SIZE_UNBOUNDED_NS: i64 = i64::MAX;

/// Answers sliced-condition queries for producers.
pub trait ConditionWizard: Send + Sync {
    /// `partial_links` is set when the metric's links do not cover
    /// every dimension of the condition tracker, in which case the
    /// tracker must treat the key as a partial match.
    fn query(
        &self,
        condition_index: usize,
        keys: &ConditionKey,
        partial_links: bool,
    ) -> ConditionState;
}

/// Resolves the current value of an external state atom for a primary
/// key. Returning `None` maps to [`STATE_UNKNOWN`].
pub trait StateProvider: Send + Sync {
    fn state_value(&self, atom_id: i32, primary_key: &HashableDimensionKey) -> Option<FieldValue>;
}

/// A wizard for metrics with no condition dependency at all.
pub struct TrivialWizard;

impl ConditionWizard for TrivialWizard {
    fn query(&self, _: usize, _: &ConditionKey, _: bool) -> ConditionState {
        ConditionState::True
    }
}

/// A state provider that knows no states.
pub struct NoStates;

impl StateProvider for NoStates {
    fn state_value(&self, _: i32, _: &HashableDimensionKey) -> Option<FieldValue> {
        None
    }
}

/// Construction context shared by all producers of one configuration.
#[derive(Clone)]
pub struct ProducerContext {
    pub config_key: ConfigKey,
    /// Events older than this are stale leftovers from before a
    /// restart and are dropped.
    pub time_base_ns: i64,
    /// First bucket starts here (a partial bucket when it differs
    /// from the time base).
    pub start_time_ns: i64,
    pub wizard: Arc<dyn ConditionWizard>,
    pub state_provider: Arc<dyn StateProvider>,
    pub monitor: Arc<Monitor>,
    pub guardrail: GuardrailConfig,
    pub shard_offset: u32,
}

impl ProducerContext {
    pub fn new(config_key: ConfigKey, time_base_ns: i64, start_time_ns: i64) -> Self {
        Self {
            config_key,
            time_base_ns,
            start_time_ns,
            wizard: Arc::new(TrivialWizard),
            state_provider: Arc::new(NoStates),
            monitor: Monitor::detached(),
            guardrail: GuardrailConfig::default(),
            shard_offset: 0,
        }
    }

    pub fn with_wizard(mut self, wizard: Arc<dyn ConditionWizard>) -> Self {
        self.wizard = wizard;
        self
    }

    pub fn with_state_provider(mut self, provider: Arc<dyn StateProvider>) -> Self {
        self.state_provider = provider;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = monitor;
        self
    }
}

/// Everything the shared pipeline resolves about one matched event
/// before the concrete aggregator sees it.
pub struct EventContext {
    pub metric_key: MetricDimensionKey,
    pub condition_key: ConditionKey,
    pub condition: bool,
    pub state_primary_keys: HashMap<i32, HashableDimensionKey>,
}

/// The capability set every metric flavor implements. Entry points
/// take `&mut self`; callers serialize access through the producer's
/// owning lock.
pub trait MetricProducer: Send {
    fn metric_id(&self) -> i64;

    /// Push entry point for matched atoms.
    fn on_matched_log_event(&mut self, matcher_index: usize, event: &LogEvent);

    fn on_condition_changed(&mut self, condition_met: bool, event_time_ns: i64);

    fn on_sliced_condition_may_change(&mut self, overall_condition: bool, event_time_ns: i64);

    fn on_state_changed(
        &mut self,
        event_time_ns: i64,
        atom_id: i32,
        primary_key: &HashableDimensionKey,
        old_state: &FieldValue,
        new_state: &FieldValue,
    );

    fn activate(&mut self, activation_tracker_index: usize, elapsed_ns: i64);

    fn cancel_event_activation(&mut self, deactivation_tracker_index: usize);

    /// Expires lapsed activations, possibly deactivating the metric.
    fn flush_if_expire(&mut self, elapsed_ns: i64);

    fn is_active(&self) -> bool;

    /// Materializes the aggregates into a report.
    fn on_dump_report(
        &mut self,
        dump_time_ns: i64,
        include_current_partial_bucket: bool,
        erase_data: bool,
        str_set: Option<&mut BTreeSet<String>>,
    ) -> StatsLogReport;

    /// Flushes the current bucket, then discards all past buckets.
    fn drop_data(&mut self, drop_time_ns: i64);

    fn load_active_metric(&mut self, active: &ActiveMetric, current_time_ns: i64);

    fn write_active_metric(&self, current_time_ns: i64, reason: DumpReportReason) -> ActiveMetric;

    /// Rough retained-memory estimate for guardrail decisions.
    fn byte_size(&self) -> usize;

    fn clear_past_buckets(&mut self);

    /// Logs internal aggregation state for shell dumps.
    fn dump_states(&self, verbose: bool);

    /// One of this config's packages was upgraded.
    fn notify_app_upgrade(&mut self, event_time_ns: i64);
}

/// Cross-cutting state shared by every producer flavor.
pub struct ProducerCore {
    pub metric_id: i64,
    pub config_key: ConfigKey,
    pub time_base_ns: i64,
    pub bucket_size_ns: i64,
    pub current_bucket_start_ns: i64,
    pub current_bucket_num: i64,

    pub condition: ConditionState,
    pub condition_sliced: bool,
    pub condition_tracker_index: Option<usize>,
    pub condition_timer: ConditionTimer,
    pub condition_links: Vec<crate::dimension::MetricConditionLink>,
    pub has_links_to_all_condition_dimensions: bool,

    pub declared_dimensions: Vec<FieldMatcher>,
    pub dimensions_in_what: Vec<Matcher>,
    pub nested_dimensions: bool,

    pub state_links: Vec<crate::dimension::MetricStateLink>,
    pub sliced_state_atoms: Vec<i32>,
    pub state_group_map: HashMap<i32, HashMap<i32, i64>>,

    /// Activation per triggering matcher index. Empty map means the
    /// metric is always active.
    pub event_activations: HashMap<usize, Activation>,
    /// Deactivation matcher index → activation matcher indexes it
    /// cancels.
    pub event_deactivations: HashMap<usize, Vec<usize>>,
    pub is_active: bool,

    pub split_bucket_on_app_upgrade: bool,

    /// Latched per bucket: the hard-limit drop was already logged.
    pub has_hit_guardrail: bool,

    pub shard_count: u32,
    pub shard_offset: u32,
    pub sampled_what_fields: Vec<Matcher>,

    pub anomaly_trackers: Vec<Arc<dyn AnomalyTracker>>,

    pub wizard: Arc<dyn ConditionWizard>,
    pub state_provider: Arc<dyn StateProvider>,
    pub monitor: Arc<Monitor>,
}

impl ProducerCore {
    pub fn new(
        def: &CountMetric,
        ctx: &ProducerContext,
        condition_index: Option<usize>,
        initial_condition_cache: &[ConditionState],
        event_activations: HashMap<usize, Activation>,
        event_deactivations: HashMap<usize, Vec<usize>>,
    ) -> Self {
        let bucket_size_ns = def
            .bucket
            .map(|declared| ctx.guardrail.clamp_bucket_size(declared).as_nanos() as i64)
            .unwrap_or(BUCKET_SIZE_UNBOUNDED_NS);

        // A metric without a condition is unconditionally gated open.
        let condition = match condition_index {
            Some(idx) => initial_condition_cache
                .get(idx)
                .copied()
                .unwrap_or(ConditionState::Unknown),
            None => ConditionState::True,
        };

        let is_active = event_activations.is_empty();

        Self {
            metric_id: def.id,
            config_key: ctx.config_key,
            time_base_ns: ctx.time_base_ns,
            bucket_size_ns,
            current_bucket_start_ns: ctx.time_base_ns,
            current_bucket_num: 0,
            condition,
            condition_sliced: !def.links.is_empty(),
            condition_tracker_index: condition_index,
            condition_timer: ConditionTimer::new(false, ctx.time_base_ns),
            condition_links: def.links.clone(),
            has_links_to_all_condition_dimensions: def.has_links_to_all_condition_dimensions,
            declared_dimensions: def.dimensions_in_what.clone(),
            dimensions_in_what: translate_field_matchers(&def.dimensions_in_what),
            nested_dimensions: should_use_nested_dimensions(&def.dimensions_in_what),
            state_links: def.state_links.clone(),
            sliced_state_atoms: def.sliced_state_atoms.clone(),
            state_group_map: def.state_group_map.clone(),
            event_activations,
            event_deactivations,
            is_active,
            split_bucket_on_app_upgrade: def.split_bucket_on_app_upgrade,
            has_hit_guardrail: false,
            shard_count: def.shard_count,
            shard_offset: ctx.shard_offset,
            sampled_what_fields: def.sampled_what_fields.clone(),
            anomaly_trackers: Vec::new(),
            wizard: ctx.wizard.clone(),
            state_provider: ctx.state_provider.clone(),
            monitor: ctx.monitor.clone(),
        }
    }

    /// Nominal end of the current bucket. Derived from the bucket
    /// number rather than the start so a bucket that began partially
    /// (dump, app upgrade) still closes on the aligned boundary.
    pub fn current_bucket_end_ns(&self) -> i64 {
        if self.bucket_size_ns == BUCKET_SIZE_UNBOUNDED_NS {
            BUCKET_SIZE_UNBOUNDED_NS
        } else {
            self.time_base_ns + (self.current_bucket_num + 1) * self.bucket_size_ns
        }
    }

    /// Bucket index of a full bucket ending at `end_ns`. The first
    /// bucket ends one bucket width past the time base.
    pub fn bucket_num_from_end_ns(&self, end_ns: i64) -> i64 {
        (end_ns - self.time_base_ns) / self.bucket_size_ns - 1
    }

    /// The shared push pipeline: gate, resolve condition and state
    /// slices, project dimensions. Returns `None` when the event is
    /// dropped before aggregation.
    pub fn prepare_event(&self, event: &LogEvent) -> Option<EventContext> {
        if !self.is_active {
            return None;
        }
        if event.elapsed_ts_ns < self.time_base_ns {
            // Old event, maybe the daemon restarted.
            self.monitor.stale_events_dropped.inc();
            return None;
        }
        if !self.passes_sample_check(&event.values) {
            return None;
        }

        let mut condition_key = ConditionKey::new();
        let condition = if self.condition_sliced {
            for link in &self.condition_links {
                condition_key.insert(
                    link.condition_id,
                    dimension_for_condition(&event.values, link),
                );
            }
            let state = self.wizard.query(
                self.condition_tracker_index.unwrap_or(0),
                &condition_key,
                !self.has_links_to_all_condition_dimensions,
            );
            state == ConditionState::True
        } else {
            self.condition == ConditionState::True
        };

        let mut state_primary_keys: HashMap<i32, HashableDimensionKey> = HashMap::new();
        for link in &self.state_links {
            state_primary_keys.insert(
                link.state_atom_id,
                dimension_for_state(&event.values, link),
            );
        }

        let mut state_values_key = HashableDimensionKey::default();
        for &atom_id in &self.sliced_state_atoms {
            // Query with the linked primary key, or the default empty
            // key for states with no link. A mis-specified link simply
            // resolves to the unknown state.
            let query_key = state_primary_keys.get(&atom_id).cloned().unwrap_or_default();
            let mut value = self.query_state_value(atom_id, &query_key);
            self.map_state_value(atom_id, &mut value);
            state_values_key.add_value(value);
        }

        let dimension_in_what = filter_values(&self.dimensions_in_what, &event.values);

        Some(EventContext {
            metric_key: MetricDimensionKey::new(dimension_in_what, state_values_key),
            condition_key,
            condition,
            state_primary_keys,
        })
    }

    fn passes_sample_check(&self, values: &[FieldValue]) -> bool {
        if self.shard_count <= 1 || self.sampled_what_fields.is_empty() {
            return true;
        }
        // If the sampled field is absent, don't sample; the event may
        // be a trigger or stop-all event.
        let Some(sample_value) = filter_single_value(&self.sampled_what_fields[0], values) else {
            return true;
        };
        should_keep_sample(&sample_value.value, self.shard_offset, self.shard_count)
    }

    fn query_state_value(&self, atom_id: i32, query_key: &HashableDimensionKey) -> FieldValue {
        match self.state_provider.state_value(atom_id, query_key) {
            Some(value) => value,
            None => {
                warn!(atom = atom_id, "state tracker not found for sliced state");
                FieldValue::new(atom_id, Value::Int(STATE_UNKNOWN))
            }
        }
    }

    fn map_state_value(&self, atom_id: i32, value: &mut FieldValue) {
        let Some(group_map) = self.state_group_map.get(&atom_id) else {
            return;
        };
        let raw = value.value.as_long().unwrap_or(i64::from(STATE_UNKNOWN)) as i32;
        match group_map.get(&raw) {
            Some(group_id) => value.value = Value::Long(*group_id),
            // A group map exists but this value was never grouped.
            None => value.value = Value::Int(STATE_UNKNOWN),
        }
    }

    /// The state key reported while every sliced state is unresolved.
    pub fn unknown_state_key(&self) -> HashableDimensionKey {
        let mut key = HashableDimensionKey::default();
        for &atom_id in &self.sliced_state_atoms {
            key.add_value(FieldValue::new(atom_id, Value::Int(STATE_UNKNOWN)));
        }
        key
    }

    // --- Activation state machine ---

    fn evaluate_active_state(&mut self, elapsed_ns: i64) -> bool {
        let mut is_active = self.event_activations.is_empty();
        for activation in self.event_activations.values_mut() {
            if activation.state == ActivationState::Active && activation.expired(elapsed_ns) {
                activation.state = ActivationState::NotActive;
            }
            if activation.state == ActivationState::Active {
                is_active = true;
            }
        }
        is_active
    }

    /// Turns an activation on. Returns true when the producer just
    /// flipped inactive→active; the caller must invoke its
    /// active-state hook *after* the flag is set so pulls triggered
    /// by the hook are accepted.
    pub fn activate_internal(&mut self, activation_tracker_index: usize, elapsed_ns: i64) -> bool {
        let Some(activation) = self.event_activations.get_mut(&activation_tracker_index) else {
            return false;
        };
        if activation.activation_type == ActivationType::OnBoot {
            if activation.state == ActivationState::NotActive {
                activation.state = ActivationState::ActiveOnBoot;
            }
            // Already active or armed: nothing changes until reboot.
            return false;
        }
        activation.start_ns = elapsed_ns;
        activation.state = ActivationState::Active;

        if !self.is_active {
            self.is_active = true;
            return true;
        }
        false
    }

    /// Expires lapsed activations. Returns true when the producer
    /// should deactivate; the caller invokes its hook first and then
    /// clears the flag via [`ProducerCore::set_inactive`].
    pub fn flush_if_expire_internal(&mut self, elapsed_ns: i64) -> bool {
        if !self.is_active {
            return false;
        }
        !self.evaluate_active_state(elapsed_ns)
    }

    pub fn set_inactive(&mut self) {
        self.is_active = false;
    }

    pub fn cancel_event_activation_internal(&mut self, deactivation_tracker_index: usize) {
        let Some(activation_indexes) = self.event_deactivations.get(&deactivation_tracker_index)
        else {
            return;
        };
        for idx in activation_indexes.clone() {
            if let Some(activation) = self.event_activations.get_mut(&idx) {
                activation.state = ActivationState::NotActive;
            }
        }
    }

    // --- Activation persistence ---

    pub fn load_active_metric(&mut self, active: &ActiveMetric, current_time_ns: i64) {
        if self.event_activations.is_empty() {
            return;
        }
        for saved in &active.activation {
            let Some(index) = saved.atom_matcher_index else {
                continue;
            };
            let Some(activation) = self.event_activations.get_mut(&(index as usize)) else {
                warn!(metric = self.metric_id, index, "saved activation not found");
                continue;
            };
            match saved.state {
                None | Some(ACTIVATION_STATE_ACTIVE) => {
                    // Restore so start + ttl lands at now + remaining,
                    // leaving future activations with the full ttl.
                    let remaining = saved.remaining_ttl_nanos.unwrap_or(0);
                    activation.start_ns = current_time_ns + remaining - activation.ttl_ns;
                    activation.state = ActivationState::Active;
                    self.is_active = true;
                }
                Some(ACTIVATION_STATE_ACTIVATE_ON_BOOT) => {
                    activation.state = ActivationState::ActiveOnBoot;
                }
                Some(other) => {
                    debug!(metric = self.metric_id, state = other, "ignoring unknown saved state");
                }
            }
        }
    }

    pub fn write_active_metric(
        &self,
        current_time_ns: i64,
        reason: DumpReportReason,
    ) -> ActiveMetric {
        let mut out = ActiveMetric {
            id: Some(self.metric_id),
            activation: Vec::new(),
        };
        for (&index, activation) in &self.event_activations {
            let lapsed = activation.state == ActivationState::Active
                && activation.start_ns + activation.ttl_ns < current_time_ns;
            if activation.state == ActivationState::NotActive || lapsed {
                continue;
            }

            let mut saved = ActiveEventActivation {
                atom_matcher_index: Some(index as i32),
                ..Default::default()
            };
            match activation.state {
                ActivationState::Active => {
                    saved.remaining_ttl_nanos =
                        Some(activation.start_ns + activation.ttl_ns - current_time_ns);
                    saved.state = Some(ACTIVATION_STATE_ACTIVE);
                }
                ActivationState::ActiveOnBoot => match reason {
                    DumpReportReason::DeviceShutdown | DumpReportReason::TerminationSignal => {
                        saved.remaining_ttl_nanos = Some(activation.ttl_ns);
                        saved.state = Some(ACTIVATION_STATE_ACTIVE);
                    }
                    DumpReportReason::CompanionDied => {
                        // Saving because the companion died, not a real
                        // shutdown: don't let boot-gated metrics
                        // silently re-activate on the way back up.
                        saved.state = Some(ACTIVATION_STATE_ACTIVATE_ON_BOOT);
                    }
                    _ => continue,
                },
                ActivationState::NotActive => unreachable!("filtered above"),
            }
            out.activation.push(saved);
        }
        out
    }

    /// Remaps activation bookkeeping onto new matcher indices after a
    /// config update, preserving live activation state for matchers
    /// that survived. Anomaly trackers are re-registered by the
    /// caller.
    pub fn on_config_updated(
        &mut self,
        wizard: Arc<dyn ConditionWizard>,
        new_condition_index: Option<usize>,
        matcher_index_remap: &HashMap<usize, usize>,
    ) {
        self.wizard = wizard;
        self.condition_tracker_index = new_condition_index;

        let old_activations = std::mem::take(&mut self.event_activations);
        for (old_index, activation) in old_activations {
            match matcher_index_remap.get(&old_index) {
                Some(&new_index) => {
                    self.event_activations.insert(new_index, activation);
                }
                None => warn!(
                    metric = self.metric_id,
                    old_index, "activation matcher gone after config update"
                ),
            }
        }

        let old_deactivations = std::mem::take(&mut self.event_deactivations);
        for (old_index, targets) in old_deactivations {
            let Some(&new_index) = matcher_index_remap.get(&old_index) else {
                continue;
            };
            let remapped: Vec<usize> = targets
                .iter()
                .filter_map(|t| matcher_index_remap.get(t).copied())
                .collect();
            self.event_deactivations.insert(new_index, remapped);
        }

        self.anomaly_trackers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NS_PER_SEC;
    use crate::event::Position;

    fn simple_def() -> CountMetric {
        CountMetric {
            id: 1,
            what_atom_tag: 42,
            bucket: Some(std::time::Duration::from_secs(60)),
            ..Default::default()
        }
    }

    fn core_with_activation(ttl_secs: i64, activation_type: ActivationType) -> ProducerCore {
        let mut activations = HashMap::new();
        activations.insert(3, Activation::new(activation_type, ttl_secs * NS_PER_SEC));
        let mut deactivations = HashMap::new();
        deactivations.insert(9, vec![3]);
        ProducerCore::new(
            &simple_def(),
            &ProducerContext::new(ConfigKey::new(1000, 1), 0, 0),
            None,
            &[],
            activations,
            deactivations,
        )
    }

    #[test]
    fn test_no_activations_means_always_active() {
        let core = ProducerCore::new(
            &simple_def(),
            &ProducerContext::new(ConfigKey::new(1000, 1), 0, 0),
            None,
            &[],
            HashMap::new(),
            HashMap::new(),
        );
        assert!(core.is_active);
    }

    #[test]
    fn test_activate_and_expire() {
        let mut core = core_with_activation(30, ActivationType::Immediate);
        assert!(!core.is_active);

        assert!(core.activate_internal(3, 0));
        assert!(core.is_active);

        // Still within ttl.
        assert!(!core.flush_if_expire_internal(30 * NS_PER_SEC));

        // Past ttl: caller should deactivate.
        assert!(core.flush_if_expire_internal(30 * NS_PER_SEC + 1));
        core.set_inactive();
        assert!(!core.is_active);
    }

    #[test]
    fn test_activate_unknown_index_is_noop() {
        let mut core = core_with_activation(30, ActivationType::Immediate);
        assert!(!core.activate_internal(99, 0));
        assert!(!core.is_active);
    }

    #[test]
    fn test_on_boot_activation_arms_without_activating() {
        let mut core = core_with_activation(30, ActivationType::OnBoot);
        assert!(!core.activate_internal(3, 5 * NS_PER_SEC));
        assert!(!core.is_active);
        assert_eq!(
            core.event_activations[&3].state,
            ActivationState::ActiveOnBoot
        );
        // start_ns untouched while armed.
        assert_eq!(core.event_activations[&3].start_ns, 0);
    }

    #[test]
    fn test_cancel_event_activation() {
        let mut core = core_with_activation(30, ActivationType::Immediate);
        core.activate_internal(3, 0);
        core.cancel_event_activation_internal(9);
        assert_eq!(core.event_activations[&3].state, ActivationState::NotActive);
        assert!(core.flush_if_expire_internal(1));
    }

    #[test]
    fn test_active_metric_roundtrip_restores_remaining_ttl() {
        let mut core = core_with_activation(30, ActivationType::Immediate);
        core.activate_internal(3, 10 * NS_PER_SEC);

        // 20s of ttl left at t=20s.
        let saved = core.write_active_metric(20 * NS_PER_SEC, DumpReportReason::DeviceShutdown);
        assert_eq!(saved.id, Some(1));
        assert_eq!(saved.activation.len(), 1);
        assert_eq!(
            saved.activation[0].remaining_ttl_nanos,
            Some(20 * NS_PER_SEC)
        );

        let mut restored = core_with_activation(30, ActivationType::Immediate);
        restored.load_active_metric(&saved, 100 * NS_PER_SEC);
        assert!(restored.is_active);
        // Expires exactly when the remaining ttl runs out.
        assert!(!restored.flush_if_expire_internal(120 * NS_PER_SEC));
        assert!(restored.flush_if_expire_internal(120 * NS_PER_SEC + 1));
    }

    #[test]
    fn test_boot_gated_activation_survival_depends_on_reason() {
        let mut core = core_with_activation(30, ActivationType::OnBoot);
        core.activate_internal(3, 0);

        // Real shutdown: comes back active for the full ttl.
        let saved = core.write_active_metric(5 * NS_PER_SEC, DumpReportReason::DeviceShutdown);
        assert_eq!(saved.activation[0].state, Some(ACTIVATION_STATE_ACTIVE));
        assert_eq!(
            saved.activation[0].remaining_ttl_nanos,
            Some(30 * NS_PER_SEC)
        );

        // Companion death: stays armed, does not re-activate.
        let saved = core.write_active_metric(5 * NS_PER_SEC, DumpReportReason::CompanionDied);
        assert_eq!(
            saved.activation[0].state,
            Some(ACTIVATION_STATE_ACTIVATE_ON_BOOT)
        );
        assert_eq!(saved.activation[0].remaining_ttl_nanos, None);
    }

    #[test]
    fn test_prepare_event_drops_stale_and_inactive() {
        let def = simple_def();
        let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 10 * NS_PER_SEC, 10 * NS_PER_SEC);
        let core = ProducerCore::new(&def, &ctx, None, &[], HashMap::new(), HashMap::new());

        let stale = LogEvent::new(42, 5 * NS_PER_SEC, 0);
        assert!(core.prepare_event(&stale).is_none());

        let fresh = LogEvent::new(42, 15 * NS_PER_SEC, 0);
        assert!(core.prepare_event(&fresh).is_some());

        let mut inactive = core_with_activation(30, ActivationType::Immediate);
        inactive.time_base_ns = 0;
        assert!(inactive.prepare_event(&fresh).is_none());
    }

    #[test]
    fn test_prepare_event_projects_dimensions() {
        let mut def = simple_def();
        def.dimensions_in_what = vec![FieldMatcher::leaf(2)];
        let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
        let core = ProducerCore::new(&def, &ctx, None, &[], HashMap::new(), HashMap::new());

        let mut event = LogEvent::new(42, NS_PER_SEC, 0);
        event.push_value(Value::Int(7));
        event.push_value(Value::Str("disk".into()));

        let prepared = core.prepare_event(&event).expect("kept");
        assert!(prepared.condition);
        let dims = prepared.metric_key.dimension_in_what().values();
        assert_eq!(dims.len(), 1);
        assert_eq!(dims[0].value, Value::Str("disk".into()));
    }

    #[test]
    fn test_sliced_state_maps_to_group_or_unknown() {
        struct OneState;
        impl StateProvider for OneState {
            fn state_value(
                &self,
                atom_id: i32,
                _key: &HashableDimensionKey,
            ) -> Option<FieldValue> {
                Some(FieldValue::new(atom_id, Value::Int(2)))
            }
        }

        let mut def = simple_def();
        def.sliced_state_atoms = vec![27];
        def.state_group_map
            .insert(27, HashMap::from([(2, 100i64)]));
        let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0)
            .with_state_provider(Arc::new(OneState));
        let core = ProducerCore::new(&def, &ctx, None, &[], HashMap::new(), HashMap::new());

        let event = LogEvent::new(42, NS_PER_SEC, 0);
        let prepared = core.prepare_event(&event).expect("kept");
        let states = prepared.metric_key.state_values_key().values();
        assert_eq!(states, &[FieldValue::new(27, Value::Long(100))]);

        // A value outside the group map reports unknown.
        let mut def2 = simple_def();
        def2.sliced_state_atoms = vec![27];
        def2.state_group_map.insert(27, HashMap::from([(9, 1i64)]));
        let ctx2 = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0)
            .with_state_provider(Arc::new(OneState));
        let core2 = ProducerCore::new(&def2, &ctx2, None, &[], HashMap::new(), HashMap::new());
        let prepared = core2.prepare_event(&event).expect("kept");
        assert_eq!(
            prepared.metric_key.state_values_key().values(),
            &[FieldValue::new(27, Value::Int(STATE_UNKNOWN))]
        );
    }

    #[test]
    fn test_sample_check_filters_by_shard() {
        let mut def = simple_def();
        def.shard_count = 2;
        def.sampled_what_fields = vec![Matcher {
            field: 1,
            position: Position::None,
        }];
        let ctx = ProducerContext::new(ConfigKey::new(1000, 1), 0, 0);
        let core = ProducerCore::new(&def, &ctx, None, &[], HashMap::new(), HashMap::new());

        let mut kept = 0;
        for i in 0..64 {
            let mut event = LogEvent::new(42, NS_PER_SEC, 0);
            event.push_value(Value::Int(i));
            if core.prepare_event(&event).is_some() {
                kept += 1;
            }
        }
        // Hash sharding keeps a strict, deterministic subset.
        assert!(kept > 0 && kept < 64, "kept {kept} of 64");

        // Events missing the sampled field bypass sampling.
        let event = LogEvent::new(42, NS_PER_SEC, 0);
        assert!(core.prepare_event(&event).is_some());
    }

    #[test]
    fn test_config_update_remaps_activation_indices() {
        let mut core = core_with_activation(30, ActivationType::Immediate);
        core.activate_internal(3, 0);

        let remap = HashMap::from([(3usize, 7usize), (9usize, 11usize)]);
        core.on_config_updated(Arc::new(TrivialWizard), Some(2), &remap);

        assert!(core.event_activations.contains_key(&7));
        assert!(!core.event_activations.contains_key(&3));
        assert_eq!(core.event_activations[&7].state, ActivationState::Active);
        assert_eq!(core.event_deactivations[&11], vec![7]);
        assert_eq!(core.condition_tracker_index, Some(2));
    }
}
