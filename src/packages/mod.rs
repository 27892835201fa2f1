use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::UidMapConfig;
use crate::dimension::ConfigKey;
use crate::monitor::Monitor;
use crate::report::{hash64, PackageInfo, PackageInfoSnapshot, UidMapping, UidMappingChange};

/// Notified when the package table changes, so report owners can
/// split buckets and annotate uploads.
pub trait PackageInfoListener: Send + Sync {
    /// A whole-table snapshot arrived.
    fn on_uid_map_received(&self, timestamp_ns: i64);

    fn notify_app_upgrade(&self, timestamp_ns: i64, package: &str, uid: i32, version: i64);

    fn notify_app_removed(&self, timestamp_ns: i64, package: &str, uid: i32);
}

/// Application data keyed by `(uid, package)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub version_code: i64,
    pub version_string: String,
    pub installer: String,
    pub deleted: bool,
    pub certificate_hash: Vec<u8>,
}

/// One install/update/remove delta, retained until every registered
/// config has uploaded it.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub deletion: bool,
    pub timestamp_ns: i64,
    pub package: String,
    pub uid: i32,
    pub version: i64,
    pub prev_version: i64,
    pub version_string: String,
    pub prev_version_string: String,
}

impl ChangeRecord {
    fn bytes(&self) -> usize {
        std::mem::size_of::<ChangeRecord>()
            + self.package.len()
            + self.version_string.len()
            + self.prev_version_string.len()
    }
}

/// One entry of a full snapshot delivered by the host.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub uid: i32,
    pub package_name: String,
    pub version: i64,
    pub version_string: String,
    pub installer: String,
    pub certificate_hash: Vec<u8>,
}

/// `last_update_per_config` value for a config that has never
/// consumed an upload.
const NEVER_UPLOADED: i64 = -1;

struct UidMapState {
    map: HashMap<(i32, String), AppData>,
    changes: VecDeque<ChangeRecord>,
    deleted_apps: VecDeque<(i32, String)>,
    /// Per config: elapsed time of its last uid-map append. Lets us
    /// trim deltas every registered config has already consumed.
    last_update_per_config: HashMap<ConfigKey, i64>,
    bytes_used: usize,
    listener: Weak<dyn PackageInfoListener>,
}

/// Process-wide uid↔package table and change log.
///
/// The isolated-uid side table lives outside the main lock; a host
/// query for an isolated uid must never wait on a snapshot update.
pub struct UidMap {
    state: Mutex<UidMapState>,
    isolated: DashMap<i32, i32>,
    max_bytes: usize,
    max_deleted_apps: usize,
    monitor: Arc<Monitor>,
}

impl UidMap {
    pub fn new(cfg: &UidMapConfig, monitor: Arc<Monitor>) -> Self {
        Self {
            state: Mutex::new(UidMapState {
                map: HashMap::new(),
                changes: VecDeque::new(),
                deleted_apps: VecDeque::new(),
                last_update_per_config: HashMap::new(),
                bytes_used: 0,
                listener: Weak::<NullListener>::new(),
            }),
            isolated: DashMap::new(),
            max_bytes: cfg.max_bytes,
            max_deleted_apps: cfg.max_deleted_apps,
            monitor,
        }
    }

    pub fn set_listener(&self, listener: &Arc<dyn PackageInfoListener>) {
        self.state.lock().listener = Arc::downgrade(listener);
    }

    /// Replaces the whole table atomically, recording one change per
    /// added, updated, or vanished entry.
    pub fn update_map(&self, timestamp_ns: i64, data: &[AppInfo]) {
        let listener = {
            let mut state = self.state.lock();

            let mut new_map: HashMap<(i32, String), AppData> = HashMap::with_capacity(data.len());
            for info in data {
                new_map.insert(
                    (info.uid, info.package_name.clone()),
                    AppData {
                        version_code: info.version,
                        version_string: info.version_string.clone(),
                        installer: info.installer.clone(),
                        deleted: false,
                        certificate_hash: info.certificate_hash.clone(),
                    },
                );
            }

            for (key, app) in &new_map {
                let old = state.map.get(key).cloned();
                let unchanged = old
                    .as_ref()
                    .is_some_and(|o| o.version_code == app.version_code && !o.deleted);
                if unchanged {
                    continue;
                }
                let record = ChangeRecord {
                    deletion: false,
                    timestamp_ns,
                    package: key.1.clone(),
                    uid: key.0,
                    version: app.version_code,
                    prev_version: old.as_ref().map(|o| o.version_code).unwrap_or(0),
                    version_string: app.version_string.clone(),
                    prev_version_string: old
                        .map(|o| o.version_string)
                        .unwrap_or_default(),
                };
                push_change(&mut state, record);
            }
            for (key, old) in &state.map.clone() {
                if !old.deleted && !new_map.contains_key(key) {
                    let record = ChangeRecord {
                        deletion: true,
                        timestamp_ns,
                        package: key.1.clone(),
                        uid: key.0,
                        version: old.version_code,
                        prev_version: old.version_code,
                        version_string: old.version_string.clone(),
                        prev_version_string: old.version_string.clone(),
                    };
                    push_change(&mut state, record);
                }
            }

            state.map = new_map;
            state.deleted_apps.clear();
            self.shrink_to_budget(&mut state);
            self.monitor.note_uid_map_bytes(state.bytes_used);
            state.listener.upgrade()
        };

        if let Some(listener) = listener {
            listener.on_uid_map_received(timestamp_ns);
        }
    }

    /// Upserts a single app, recording a change when its version or
    /// installer moved.
    pub fn update_app(
        &self,
        timestamp_ns: i64,
        app_name: &str,
        uid: i32,
        version_code: i64,
        version_string: &str,
        installer: &str,
        certificate_hash: &[u8],
    ) {
        let listener = {
            let mut state = self.state.lock();
            let key = (uid, app_name.to_string());
            let old = state.map.get(&key).cloned();

            let changed = match &old {
                None => true,
                Some(o) => {
                    o.deleted || o.version_code != version_code || o.installer != installer
                }
            };
            if changed {
                let record = ChangeRecord {
                    deletion: false,
                    timestamp_ns,
                    package: app_name.to_string(),
                    uid,
                    version: version_code,
                    prev_version: old.as_ref().map(|o| o.version_code).unwrap_or(0),
                    version_string: version_string.to_string(),
                    prev_version_string: old
                        .as_ref()
                        .map(|o| o.version_string.clone())
                        .unwrap_or_default(),
                };
                push_change(&mut state, record);
            }

            state.map.insert(
                key.clone(),
                AppData {
                    version_code,
                    version_string: version_string.to_string(),
                    installer: installer.to_string(),
                    deleted: false,
                    certificate_hash: certificate_hash.to_vec(),
                },
            );
            state.deleted_apps.retain(|entry| entry != &key);
            self.shrink_to_budget(&mut state);
            self.monitor.note_uid_map_bytes(state.bytes_used);
            changed.then(|| state.listener.upgrade()).flatten()
        };

        if let Some(listener) = listener {
            listener.notify_app_upgrade(timestamp_ns, app_name, uid, version_code);
        }
    }

    /// Marks an app deleted. The entry is retained (bounded) so late
    /// events from the dying uid still resolve.
    pub fn remove_app(&self, timestamp_ns: i64, app_name: &str, uid: i32) {
        let listener = {
            let mut state = self.state.lock();
            let key = (uid, app_name.to_string());
            let Some(app) = state.map.get_mut(&key) else {
                warn!(uid, app = app_name, "removing unknown app");
                return;
            };
            app.deleted = true;
            let version = app.version_code;
            let version_string = app.version_string.clone();

            state.deleted_apps.push_back(key.clone());
            while state.deleted_apps.len() > self.max_deleted_apps {
                if let Some(evicted) = state.deleted_apps.pop_front() {
                    state.map.remove(&evicted);
                }
            }

            let record = ChangeRecord {
                deletion: true,
                timestamp_ns,
                package: app_name.to_string(),
                uid,
                version,
                prev_version: version,
                version_string: version_string.clone(),
                prev_version_string: version_string,
            };
            push_change(&mut state, record);
            self.shrink_to_budget(&mut state);
            self.monitor.note_uid_map_bytes(state.bytes_used);
            state.listener.upgrade()
        };

        if let Some(listener) = listener {
            listener.notify_app_removed(timestamp_ns, app_name, uid);
        }
    }

    // --- Isolated uids ---

    pub fn assign_isolated_uid(&self, isolated_uid: i32, parent_uid: i32) {
        self.isolated.insert(isolated_uid, parent_uid);
    }

    pub fn remove_isolated_uid(&self, isolated_uid: i32) {
        self.isolated.remove(&isolated_uid);
    }

    /// Rewrites an isolated uid to its parent; other uids pass
    /// through unchanged.
    pub fn get_host_uid_or_self(&self, uid: i32) -> i32 {
        self.isolated.get(&uid).map(|entry| *entry).unwrap_or(uid)
    }

    // --- Read-only lookups ---

    pub fn has_app(&self, uid: i32, package_name: &str) -> bool {
        let state = self.state.lock();
        state.map.contains_key(&(uid, package_name.to_string()))
    }

    pub fn get_app_names_from_uid(&self, uid: i32, normalized: bool) -> BTreeSet<String> {
        let state = self.state.lock();
        state
            .map
            .keys()
            .filter(|(u, _)| *u == uid)
            .map(|(_, name)| {
                if normalized {
                    name.to_lowercase()
                } else {
                    name.clone()
                }
            })
            .collect()
    }

    pub fn get_app_version(&self, uid: i32, package_name: &str) -> i64 {
        let state = self.state.lock();
        state
            .map
            .get(&(uid, package_name.to_string()))
            .map(|app| app.version_code)
            .unwrap_or(0)
    }

    pub fn get_app_uid(&self, package_name: &str) -> BTreeSet<i32> {
        let state = self.state.lock();
        state
            .map
            .keys()
            .filter(|(_, name)| name == package_name)
            .map(|(uid, _)| *uid)
            .collect()
    }

    // --- Config lifecycle ---

    pub fn on_config_updated(&self, key: ConfigKey) {
        let mut state = self.state.lock();
        state.last_update_per_config.entry(key).or_insert(NEVER_UPLOADED);
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        let mut state = self.state.lock();
        state.last_update_per_config.remove(&key);
    }

    // --- Output ---

    /// Writes a snapshot plus every change since this config's last
    /// append; then trims the prefix of changes every registered
    /// config has consumed.
    pub fn append_uid_map(
        &self,
        timestamp_ns: i64,
        config_key: ConfigKey,
        include_version_strings: bool,
        include_installer: bool,
        truncated_certificate_hash_size: usize,
        str_set: Option<&mut BTreeSet<String>>,
    ) -> UidMapping {
        let mut state = self.state.lock();

        let since = state
            .last_update_per_config
            .get(&config_key)
            .copied()
            .unwrap_or(NEVER_UPLOADED);

        let out = UidMapping {
            snapshots: vec![snapshot_locked(
                &state.map,
                timestamp_ns,
                include_version_strings,
                include_installer,
                truncated_certificate_hash_size,
                &[],
                str_set,
            )],
            changes: state
                .changes
                .iter()
                .filter(|change| change.timestamp_ns > since)
                .map(|change| UidMappingChange {
                    deletion: Some(change.deletion),
                    app: Some(change.package.clone()),
                    uid: Some(change.uid),
                    new_version: Some(change.version),
                    prev_version: Some(change.prev_version),
                    elapsed_timestamp_ns: Some(change.timestamp_ns),
                    new_version_string: include_version_strings
                        .then(|| change.version_string.clone()),
                    prev_version_string: include_version_strings
                        .then(|| change.prev_version_string.clone()),
                })
                .collect(),
        };

        state.last_update_per_config.insert(config_key, timestamp_ns);

        // Drop the prefix every config has now consumed.
        let min_consumed = state
            .last_update_per_config
            .values()
            .copied()
            .min()
            .unwrap_or(NEVER_UPLOADED);
        if min_consumed > NEVER_UPLOADED {
            while let Some(front) = state.changes.front() {
                if front.timestamp_ns > min_consumed {
                    break;
                }
                let bytes = front.bytes();
                state.changes.pop_front();
                state.bytes_used = state.bytes_used.saturating_sub(bytes);
            }
        }
        self.monitor.note_uid_map_bytes(state.bytes_used);

        out
    }

    /// Writes the current table as a snapshot. `interesting_uids`
    /// restricts the output when non-empty.
    pub fn write_snapshot(
        &self,
        timestamp_ns: i64,
        include_version_strings: bool,
        include_installer: bool,
        truncated_certificate_hash_size: usize,
        interesting_uids: &[i32],
        str_set: Option<&mut BTreeSet<String>>,
    ) -> PackageInfoSnapshot {
        let state = self.state.lock();
        snapshot_locked(
            &state.map,
            timestamp_ns,
            include_version_strings,
            include_installer,
            truncated_certificate_hash_size,
            interesting_uids,
            str_set,
        )
    }

    /// Drops all pending deltas. The next append still carries a full
    /// snapshot, so the server can rebuild the mapping.
    pub fn clear_output(&self) {
        let mut state = self.state.lock();
        state.changes.clear();
        state.bytes_used = 0;
        self.monitor.note_uid_map_bytes(0);
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes_used
    }

    pub fn change_count(&self) -> usize {
        self.state.lock().changes.len()
    }

    /// Evicts oldest changes until retained bytes fit the budget.
    fn shrink_to_budget(&self, state: &mut UidMapState) {
        while state.bytes_used > self.max_bytes {
            let Some(evicted) = state.changes.pop_front() else {
                break;
            };
            state.bytes_used = state.bytes_used.saturating_sub(evicted.bytes());
            self.monitor.uid_map_changes_evicted.inc();
            debug!(bytes_used = state.bytes_used, "uid map change evicted");
        }
    }
}

fn push_change(state: &mut UidMapState, record: ChangeRecord) {
    state.bytes_used += record.bytes();
    state.changes.push_back(record);
}

fn snapshot_locked(
    map: &HashMap<(i32, String), AppData>,
    timestamp_ns: i64,
    include_version_strings: bool,
    include_installer: bool,
    truncated_certificate_hash_size: usize,
    interesting_uids: &[i32],
    mut str_set: Option<&mut BTreeSet<String>>,
) -> PackageInfoSnapshot {
    let mut snapshot = PackageInfoSnapshot {
        elapsed_timestamp_ns: Some(timestamp_ns),
        package_info: Vec::new(),
    };
    for ((uid, name), app) in map {
        if !interesting_uids.is_empty() && !interesting_uids.contains(uid) {
            continue;
        }
        let mut info = PackageInfo {
            version: Some(app.version_code),
            uid: Some(*uid),
            deleted: Some(app.deleted),
            ..Default::default()
        };
        match str_set.as_deref_mut() {
            Some(set) => {
                info.name_hash = Some(hash64(name));
                set.insert(name.clone());
                if include_version_strings {
                    info.version_string_hash = Some(hash64(&app.version_string));
                    set.insert(app.version_string.clone());
                }
            }
            None => {
                info.name = Some(name.clone());
                if include_version_strings {
                    info.version_string = Some(app.version_string.clone());
                }
            }
        }
        if include_installer {
            info.installer = Some(app.installer.clone());
        }
        if truncated_certificate_hash_size > 0 && !app.certificate_hash.is_empty() {
            let len = truncated_certificate_hash_size.min(app.certificate_hash.len());
            info.truncated_certificate_hash = Some(app.certificate_hash[..len].to_vec());
        }
        snapshot.package_info.push(info);
    }
    snapshot
}

struct NullListener;

impl PackageInfoListener for NullListener {
    fn on_uid_map_received(&self, _timestamp_ns: i64) {}
    fn notify_app_upgrade(&self, _timestamp_ns: i64, _package: &str, _uid: i32, _version: i64) {}
    fn notify_app_removed(&self, _timestamp_ns: i64, _package: &str, _uid: i32) {}
}
