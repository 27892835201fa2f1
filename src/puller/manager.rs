use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock;
use crate::dimension::{ConfigKey, PullerKey, ReceiverKey};
use crate::error::PullError;
use crate::event::LogEvent;
use crate::monitor::Monitor;
use crate::{config::PullerConfig, DAEMON_UID};

use super::{
    BuildInfoPuller, PullAtomCallback, PullDataReceiver, PullResult, PullUidProvider, Puller,
    BUILD_INFO_TAG,
};

/// Sentinel: no receiver has a scheduled pull.
const NO_ALARM_UPDATE: i64 = i64::MAX;

/// Host alarm used for scheduled pulls. One alarm serves every
/// receiver; it is programmed to the minimum deadline.
pub trait AlarmScheduler: Send + Sync {
    /// Programs the pull alarm to a millisecond-truncated deadline on
    /// the elapsed clock.
    fn set_pulling_alarm(&self, elapsed_millis: i64);
}

/// Strong handle under which receivers are registered.
pub type ReceiverRef = Arc<Mutex<dyn PullDataReceiver>>;
type WeakReceiver = Weak<Mutex<dyn PullDataReceiver>>;

struct ReceiverInfo {
    receiver: WeakReceiver,
    interval_ns: i64,
    next_pull_time_ns: i64,
}

impl ReceiverInfo {
    /// Jumps the deadline forward past `elapsed_ns` by whole
    /// intervals, preserving alignment across device sleep.
    fn advance_past(&mut self, elapsed_ns: i64) {
        let buckets_ahead = (elapsed_ns - self.next_pull_time_ns) / self.interval_ns;
        self.next_pull_time_ns += (buckets_ahead + 1) * self.interval_ns;
    }
}

struct ManagerState {
    pullers: HashMap<PullerKey, Puller>,
    receivers: HashMap<ReceiverKey, Vec<ReceiverInfo>>,
    uid_providers: HashMap<ConfigKey, Weak<dyn PullUidProvider>>,
    next_pull_time_ns: i64,
    alarm: Option<Arc<dyn AlarmScheduler>>,
}

/// Owns the registered pullers and the single pull alarm, and
/// dispatches pulled batches to receivers.
pub struct PullerManager {
    state: Mutex<ManagerState>,
    monitor: Arc<Monitor>,
    min_cool_down_ns: i64,
    max_timeout_ns: i64,
}

impl PullerManager {
    pub fn new(cfg: &PullerConfig, monitor: Arc<Monitor>) -> Self {
        let mut pullers = HashMap::new();
        // Atoms the daemon can serve about itself.
        pullers.insert(
            PullerKey {
                uid: DAEMON_UID,
                atom_tag: BUILD_INFO_TAG,
            },
            Puller::new(
                BUILD_INFO_TAG,
                Arc::new(BuildInfoPuller),
                cfg.min_cool_down.as_nanos() as i64,
                cfg.max_timeout.as_nanos() as i64,
                Vec::new(),
            ),
        );

        Self {
            state: Mutex::new(ManagerState {
                pullers,
                receivers: HashMap::new(),
                uid_providers: HashMap::new(),
                next_pull_time_ns: NO_ALARM_UPDATE,
                alarm: None,
            }),
            monitor,
            min_cool_down_ns: cfg.min_cool_down.as_nanos() as i64,
            max_timeout_ns: cfg.max_timeout.as_nanos() as i64,
        }
    }

    /// Attaches the host alarm. Reprograms immediately if a deadline
    /// is already pending.
    pub fn set_alarm_scheduler(&self, alarm: Arc<dyn AlarmScheduler>) {
        let pending = {
            let mut state = self.state.lock();
            state.alarm = Some(alarm.clone());
            (state.next_pull_time_ns != NO_ALARM_UPDATE).then_some(state.next_pull_time_ns)
        };
        if let Some(deadline_ns) = pending {
            alarm.set_pulling_alarm(clock::ns_to_millis(deadline_ns));
        }
    }

    /// Pulls a tag on behalf of a configuration, resolving the uid
    /// order through the config's uid provider.
    pub fn pull(
        &self,
        tag_id: i32,
        config_key: &ConfigKey,
        event_time_ns: i64,
    ) -> Option<Vec<LogEvent>> {
        let mut state = self.state.lock();
        Self::pull_for_config(&mut state, &self.monitor, tag_id, config_key, event_time_ns)
    }

    /// Pulls a tag from the first registered `(uid, tag)` puller in
    /// the given uid order.
    pub fn pull_uids(&self, tag_id: i32, uids: &[i32], event_time_ns: i64) -> Option<Vec<LogEvent>> {
        let mut state = self.state.lock();
        Self::pull_locked(&mut state.pullers, &self.monitor, tag_id, uids, event_time_ns)
    }

    fn pull_for_config(
        state: &mut ManagerState,
        monitor: &Monitor,
        tag_id: i32,
        config_key: &ConfigKey,
        event_time_ns: i64,
    ) -> Option<Vec<LogEvent>> {
        let Some(weak_provider) = state.uid_providers.get(config_key) else {
            warn!(atom = tag_id, config = %config_key, "no pull uid provider for config");
            monitor.note_uid_provider_missing(tag_id);
            return None;
        };
        let Some(provider) = weak_provider.upgrade() else {
            warn!(atom = tag_id, config = %config_key, "pull uid provider for config is gone");
            monitor.note_uid_provider_missing(tag_id);
            return None;
        };
        let uids = provider.pull_atom_uids(tag_id);
        Self::pull_locked(&mut state.pullers, monitor, tag_id, &uids, event_time_ns)
    }

    fn pull_locked(
        pullers: &mut HashMap<PullerKey, Puller>,
        monitor: &Monitor,
        tag_id: i32,
        uids: &[i32],
        event_time_ns: i64,
    ) -> Option<Vec<LogEvent>> {
        debug!(atom = tag_id, "initiating pull");
        for &uid in uids {
            let key = PullerKey {
                uid,
                atom_tag: tag_id,
            };
            let Some(puller) = pullers.get_mut(&key) else {
                continue;
            };
            return match puller.pull(event_time_ns) {
                Ok(events) => {
                    debug!(atom = tag_id, count = events.len(), "pulled");
                    Some(events)
                }
                Err(PullError::DeadObject) => {
                    // The client process has died; drop its puller.
                    monitor.note_pull_failed(tag_id);
                    monitor.note_puller_registration_changed(tag_id, false);
                    pullers.remove(&key);
                    None
                }
                Err(_) => {
                    monitor.note_pull_failed(tag_id);
                    None
                }
            };
        }
        monitor.note_puller_not_found(tag_id);
        warn!(atom = tag_id, "no puller registered for tag");
        None
    }

    /// Registers a receiver for scheduled pulls of a tag. Intervals
    /// are floored to whole minutes with a 60s minimum; the shared
    /// alarm is pulled earlier if this deadline precedes it.
    pub fn register_receiver(
        &self,
        tag_id: i32,
        config_key: ConfigKey,
        receiver: &ReceiverRef,
        next_pull_time_ns: i64,
        interval_ns: i64,
    ) {
        let reprogram = {
            let mut state = self.state.lock();
            let infos = state
                .receivers
                .entry(ReceiverKey {
                    atom_tag: tag_id,
                    config_key,
                })
                .or_default();
            if infos
                .iter()
                .any(|info| Weak::ptr_eq(&info.receiver, &Arc::downgrade(receiver)))
            {
                debug!(atom = tag_id, "receiver already registered");
                return;
            }

            // Scheduled pulls are at least one minute apart, on whole
            // minutes: the resolution limit of the host alarm.
            let mut rounded_interval_ns =
                interval_ns / clock::NS_PER_SEC / 60 * clock::NS_PER_SEC * 60;
            if rounded_interval_ns < 60 * clock::NS_PER_SEC {
                rounded_interval_ns = 60 * clock::NS_PER_SEC;
            }

            infos.push(ReceiverInfo {
                receiver: Arc::downgrade(receiver),
                interval_ns: rounded_interval_ns,
                next_pull_time_ns,
            });
            debug!(atom = tag_id, receivers = infos.len(), "receiver registered");

            if next_pull_time_ns < state.next_pull_time_ns {
                state.next_pull_time_ns = next_pull_time_ns;
                state
                    .alarm
                    .clone()
                    .map(|alarm| (alarm, next_pull_time_ns))
            } else {
                None
            }
        };
        if let Some((alarm, deadline_ns)) = reprogram {
            alarm.set_pulling_alarm(clock::ns_to_millis(deadline_ns));
        }
    }

    /// Removes a receiver. The alarm is left alone; it advances
    /// naturally on its next firing.
    pub fn unregister_receiver(&self, tag_id: i32, config_key: ConfigKey, receiver: &ReceiverRef) {
        let mut state = self.state.lock();
        let key = ReceiverKey {
            atom_tag: tag_id,
            config_key,
        };
        let Some(infos) = state.receivers.get_mut(&key) else {
            debug!(atom = tag_id, "no receivers for tag");
            return;
        };
        let target = Arc::downgrade(receiver);
        infos.retain(|info| !Weak::ptr_eq(&info.receiver, &target));
    }

    pub fn register_pull_uid_provider(
        &self,
        config_key: ConfigKey,
        provider: &Arc<dyn PullUidProvider>,
    ) {
        let mut state = self.state.lock();
        state
            .uid_providers
            .insert(config_key, Arc::downgrade(provider));
    }

    pub fn unregister_pull_uid_provider(
        &self,
        config_key: ConfigKey,
        provider: &Arc<dyn PullUidProvider>,
    ) {
        let mut state = self.state.lock();
        if let Some(existing) = state.uid_providers.get(&config_key) {
            if Weak::ptr_eq(existing, &Arc::downgrade(provider)) {
                state.uid_providers.remove(&config_key);
            }
        }
    }

    /// Registers (or replaces) the pull callback for `(uid, tag)`.
    /// Cooldown and timeout are clamped into the configured range.
    pub fn register_pull_atom_callback(
        &self,
        uid: i32,
        atom_tag: i32,
        cool_down_ns: i64,
        timeout_ns: i64,
        additive_fields: Vec<i32>,
        callback: Arc<dyn PullAtomCallback>,
    ) {
        debug!(atom = atom_tag, uid, "registering pull callback");

        let cool_down_ns = cool_down_ns.max(self.min_cool_down_ns);
        let timeout_ns = timeout_ns.min(self.max_timeout_ns);

        let mut state = self.state.lock();
        let key = PullerKey { uid, atom_tag };
        if state.pullers.contains_key(&key) {
            self.monitor.note_puller_registration_changed(atom_tag, false);
        }
        state.pullers.insert(
            key,
            Puller::new(atom_tag, callback, cool_down_ns, timeout_ns, additive_fields),
        );
        self.monitor.note_puller_registration_changed(atom_tag, true);
    }

    pub fn unregister_pull_atom_callback(&self, uid: i32, atom_tag: i32) {
        let mut state = self.state.lock();
        let key = PullerKey { uid, atom_tag };
        if state.pullers.remove(&key).is_some() {
            self.monitor.note_puller_registration_changed(atom_tag, false);
        }
    }

    /// Drops every puller's cached batch. Returns total events cleared.
    pub fn force_clear_puller_cache(&self) -> usize {
        let mut state = self.state.lock();
        state
            .pullers
            .values_mut()
            .map(Puller::force_clear_cache)
            .sum()
    }

    /// Drops cached batches whose cooldown has lapsed.
    pub fn clear_puller_cache_if_necessary(&self, now_ns: i64) -> usize {
        let mut state = self.state.lock();
        state
            .pullers
            .values_mut()
            .map(|p| p.clear_cache_if_necessary(now_ns))
            .sum()
    }

    /// Handles the pull alarm: pulls every due tag once, delivers the
    /// batch to all interested receivers, and reprograms the alarm to
    /// the new minimum deadline.
    pub fn on_alarm_fired(&self, elapsed_ns: i64) {
        self.monitor.alarms_fired.inc();
        let reprogram = {
            let mut state = self.state.lock();
            let wall_ns = clock::wall_clock_ns();

            let mut min_next_ns = NO_ALARM_UPDATE;
            let mut need_pull: Vec<(ReceiverKey, Vec<usize>)> = Vec::new();

            let ManagerState {
                pullers,
                receivers,
                uid_providers,
                ..
            } = &mut *state;

            for (key, infos) in receivers.iter_mut() {
                let mut due_indexes = Vec::new();
                for (idx, info) in infos.iter_mut().enumerate() {
                    let due = info.next_pull_time_ns <= elapsed_ns;
                    let live = info.receiver.upgrade();
                    let pull_necessary = live
                        .as_ref()
                        .map(|r| r.lock().is_pull_needed())
                        .unwrap_or(false);

                    if due && pull_necessary {
                        // Deadline advances after the pull below.
                        due_indexes.push(idx);
                        continue;
                    }
                    if due {
                        if let Some(receiver) = live {
                            receiver
                                .lock()
                                .on_data_pulled(&[], PullResult::NotNeeded, elapsed_ns);
                        }
                        info.advance_past(elapsed_ns);
                    }
                    min_next_ns = min_next_ns.min(info.next_pull_time_ns);
                }
                if !due_indexes.is_empty() {
                    need_pull.push((*key, due_indexes));
                }
            }

            for (key, due_indexes) in need_pull {
                let uids = uid_providers
                    .get(&key.config_key)
                    .and_then(Weak::upgrade)
                    .map(|p| p.pull_atom_uids(key.atom_tag));
                let pulled = match uids {
                    Some(uids) => Self::pull_locked(
                        pullers,
                        &self.monitor,
                        key.atom_tag,
                        &uids,
                        elapsed_ns,
                    ),
                    None => {
                        self.monitor.note_uid_provider_missing(key.atom_tag);
                        None
                    }
                };
                let (mut data, result) = match pulled {
                    Some(events) => (events, PullResult::Success),
                    None => {
                        debug!(
                            atom = key.atom_tag,
                            elapsed_ns, "pull failed, will try again next interval"
                        );
                        (Vec::new(), PullResult::Fail)
                    }
                };

                // Pulled atoms are stamped with the request time: the
                // alarm firing is their triggering event, not however
                // long the pull itself took.
                for event in &mut data {
                    event.stamp(elapsed_ns, wall_ns);
                }

                let infos = receivers.get_mut(&key).expect("receiver list exists");
                for idx in due_indexes {
                    let info = &mut infos[idx];
                    if let Some(receiver) = info.receiver.upgrade() {
                        receiver.lock().on_data_pulled(&data, result, elapsed_ns);
                    } else {
                        debug!(atom = key.atom_tag, "receiver already gone");
                    }
                    // We may have just come out of a coma; jump to the
                    // next future boundary rather than backfilling.
                    info.advance_past(elapsed_ns);
                    min_next_ns = min_next_ns.min(info.next_pull_time_ns);
                }
            }

            debug!(
                from = state.next_pull_time_ns,
                to = min_next_ns,
                "next pull time updated"
            );
            state.next_pull_time_ns = min_next_ns;
            if min_next_ns != NO_ALARM_UPDATE {
                state.alarm.clone().map(|alarm| (alarm, min_next_ns))
            } else {
                None
            }
        };

        // The alarm call can block on the host; never hold the
        // manager lock across it.
        if let Some((alarm, deadline_ns)) = reprogram {
            alarm.set_pulling_alarm(clock::ns_to_millis(deadline_ns));
        }
    }

    /// The currently programmed minimum deadline, for shell dumps.
    pub fn next_pull_time_ns(&self) -> i64 {
        self.state.lock().next_pull_time_ns
    }

    /// Whether a puller is registered for `(uid, tag)`.
    pub fn has_puller(&self, uid: i32, atom_tag: i32) -> bool {
        self.state.lock().pullers.contains_key(&PullerKey { uid, atom_tag })
    }

    pub fn dump(&self) {
        let state = self.state.lock();
        info!(
            pullers = state.pullers.len(),
            receiver_lists = state.receivers.len(),
            next_pull_time_ns = state.next_pull_time_ns,
            "puller manager state"
        );
    }
}
