pub mod manager;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::clock;
use crate::error::PullError;
use crate::event::{LogEvent, Value, ATOM_BUILD_INFO};

/// Host-side implementation of a pulled atom. Invoked synchronously;
/// the owning [`Puller`] enforces the timeout budget.
pub trait PullAtomCallback: Send + Sync {
    fn on_pull_atom(&self, atom_tag: i32) -> Result<Vec<LogEvent>, PullError>;
}

/// Outcome delivered to pull-data receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    Success,
    Fail,
    /// The receiver was due but reported no pull was needed; an empty
    /// batch is delivered so it can still advance its bucket.
    NotNeeded,
}

/// Consumer of pulled atom batches, registered with the manager per
/// `(atom_tag, config_key)`. Held weakly: an expired receiver is
/// skipped at dispatch time.
pub trait PullDataReceiver: Send {
    /// Whether the receiver actually wants data for its next bucket.
    fn is_pull_needed(&self) -> bool;

    fn on_data_pulled(&mut self, data: &[LogEvent], result: PullResult, elapsed_ns: i64);
}

/// Resolves which uids a configuration is allowed to pull a tag from,
/// in priority order.
pub trait PullUidProvider: Send + Sync {
    fn pull_atom_uids(&self, atom_tag: i32) -> Vec<i32>;
}

/// A registered puller: the callback plus its rate limits and the
/// cooldown cache.
///
/// At most one pull is in flight per puller; the manager's lock
/// guarantees it.
pub struct Puller {
    atom_tag: i32,
    callback: Arc<dyn PullAtomCallback>,
    cool_down_ns: i64,
    timeout_ns: i64,
    /// Field ids whose values are additive across merged batches.
    /// Recorded at registration for downstream diffing producers.
    additive_fields: Vec<i32>,

    last_pull_time_ns: i64,
    last_pull_failed: bool,
    cached: Vec<LogEvent>,
}

impl Puller {
    pub fn new(
        atom_tag: i32,
        callback: Arc<dyn PullAtomCallback>,
        cool_down_ns: i64,
        timeout_ns: i64,
        additive_fields: Vec<i32>,
    ) -> Self {
        Self {
            atom_tag,
            callback,
            cool_down_ns,
            timeout_ns,
            additive_fields,
            last_pull_time_ns: 0,
            last_pull_failed: false,
            cached: Vec::new(),
        }
    }

    pub fn additive_fields(&self) -> &[i32] {
        &self.additive_fields
    }

    /// Performs a pull, re-serving the cached batch when invoked again
    /// within the cooldown window.
    pub fn pull(&mut self, elapsed_ns: i64) -> Result<Vec<LogEvent>, PullError> {
        if self.last_pull_time_ns > 0 && elapsed_ns - self.last_pull_time_ns < self.cool_down_ns {
            debug!(atom = self.atom_tag, "pull served from cooldown cache");
            if self.last_pull_failed {
                return Err(PullError::Failed);
            }
            return Ok(self.cached.clone());
        }

        self.last_pull_time_ns = elapsed_ns;

        let started = Instant::now();
        let result = self.callback.on_pull_atom(self.atom_tag);
        let took_ns = started.elapsed().as_nanos() as i64;

        match result {
            Err(PullError::DeadObject) => Err(PullError::DeadObject),
            Err(e) => {
                self.last_pull_failed = true;
                self.cached.clear();
                Err(e)
            }
            Ok(_) if took_ns > self.timeout_ns => {
                warn!(
                    atom = self.atom_tag,
                    took_ms = took_ns / clock::NS_PER_MS,
                    "pull exceeded timeout, discarding"
                );
                self.last_pull_failed = true;
                self.cached.clear();
                Err(PullError::Timeout)
            }
            Ok(events) => {
                self.last_pull_failed = false;
                self.cached = events.clone();
                Ok(events)
            }
        }
    }

    /// Unconditionally drops the cached batch. Returns the number of
    /// events cleared.
    pub fn force_clear_cache(&mut self) -> usize {
        let cleared = self.cached.len();
        self.cached.clear();
        self.last_pull_time_ns = 0;
        self.last_pull_failed = false;
        cleared
    }

    /// Drops the cached batch once the cooldown has lapsed.
    pub fn clear_cache_if_necessary(&mut self, now_ns: i64) -> usize {
        if self.last_pull_time_ns > 0 && now_ns - self.last_pull_time_ns > self.cool_down_ns {
            self.force_clear_cache()
        } else {
            0
        }
    }
}

/// Built-in puller serving the daemon's own build-info atom. Always
/// registered under the daemon uid so configs can pull it without a
/// host-side callback.
pub struct BuildInfoPuller;

impl PullAtomCallback for BuildInfoPuller {
    fn on_pull_atom(&self, atom_tag: i32) -> Result<Vec<LogEvent>, PullError> {
        let mut event = LogEvent::new(
            atom_tag,
            clock::elapsed_realtime_ns(),
            clock::wall_clock_ns(),
        );
        event.push_value(Value::Str(env!("CARGO_PKG_VERSION").to_string()));
        event.push_value(Value::Str(std::env::consts::OS.to_string()));
        event.push_value(Value::Str(std::env::consts::ARCH.to_string()));
        Ok(vec![event])
    }
}

/// Atom tag served by [`BuildInfoPuller`].
pub const BUILD_INFO_TAG: i32 = ATOM_BUILD_INFO;
