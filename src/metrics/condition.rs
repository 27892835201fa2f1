/// Truth state of a metric's condition. `Unknown` gates exactly like
/// `False`; it exists so restored producers don't fabricate true-time
/// before the first real condition event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionState {
    #[default]
    Unknown,
    False,
    True,
}

impl ConditionState {
    pub fn from_met(met: bool) -> Self {
        if met {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }
}

/// Accumulates how long the condition held true within each bucket.
///
/// `new_bucket_start` closes the accounting period and reports the
/// accumulated true-time along with a correction term: the skew
/// between the moment the bucket actually closed (a dump can close it
/// early) and its nominal boundary.
#[derive(Debug)]
pub struct ConditionTimer {
    condition: bool,
    timer_ns: i64,
    last_condition_change_ns: i64,
    current_bucket_start_delay_ns: i64,
}

impl ConditionTimer {
    pub fn new(init_condition: bool, bucket_start_ns: i64) -> Self {
        Self {
            condition: init_condition,
            timer_ns: 0,
            last_condition_change_ns: bucket_start_ns,
            current_bucket_start_delay_ns: 0,
        }
    }

    pub fn on_condition_changed(&mut self, new_condition: bool, timestamp_ns: i64) {
        if new_condition == self.condition {
            return;
        }
        if self.condition {
            self.timer_ns += timestamp_ns - self.last_condition_change_ns;
        }
        self.condition = new_condition;
        self.last_condition_change_ns = timestamp_ns;
    }

    /// Closes the current accounting period at `event_time_ns` and
    /// starts the next one. Returns `(condition_true_ns, correction_ns)`.
    pub fn new_bucket_start(&mut self, event_time_ns: i64, next_bucket_start_ns: i64) -> (i64, i64) {
        let mut duration_ns = self.timer_ns;
        self.timer_ns = 0;

        let mut correction_ns = self.current_bucket_start_delay_ns;
        if self.condition {
            duration_ns += event_time_ns - self.last_condition_change_ns;
            self.last_condition_change_ns = event_time_ns;

            // True-time between the actual close and the nominal
            // boundary belongs to the next bucket.
            self.current_bucket_start_delay_ns = next_bucket_start_ns - event_time_ns;
            correction_ns -= self.current_bucket_start_delay_ns;
        } else {
            self.current_bucket_start_delay_ns = 0;
        }

        (duration_ns, correction_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NS_PER_SEC;

    #[test]
    fn test_true_time_accumulates_within_bucket() {
        let mut timer = ConditionTimer::new(false, 0);
        timer.on_condition_changed(true, 20 * NS_PER_SEC);
        timer.on_condition_changed(false, 50 * NS_PER_SEC);

        let (true_ns, _) = timer.new_bucket_start(60 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(true_ns, 30 * NS_PER_SEC);
    }

    #[test]
    fn test_open_true_interval_closed_at_bucket_boundary() {
        let mut timer = ConditionTimer::new(false, 0);
        timer.on_condition_changed(true, 45 * NS_PER_SEC);

        let (true_ns, _) = timer.new_bucket_start(60 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(true_ns, 15 * NS_PER_SEC);

        // Still true into the next bucket.
        let (true_ns, _) = timer.new_bucket_start(120 * NS_PER_SEC, 120 * NS_PER_SEC);
        assert_eq!(true_ns, 60 * NS_PER_SEC);
    }

    #[test]
    fn test_initially_true_condition_counts_from_bucket_start() {
        let mut timer = ConditionTimer::new(true, 10 * NS_PER_SEC);
        let (true_ns, _) = timer.new_bucket_start(60 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(true_ns, 50 * NS_PER_SEC);
    }

    #[test]
    fn test_redundant_condition_changes_are_ignored() {
        let mut timer = ConditionTimer::new(false, 0);
        timer.on_condition_changed(true, 10 * NS_PER_SEC);
        timer.on_condition_changed(true, 30 * NS_PER_SEC);
        timer.on_condition_changed(false, 40 * NS_PER_SEC);
        timer.on_condition_changed(false, 50 * NS_PER_SEC);

        let (true_ns, _) = timer.new_bucket_start(60 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(true_ns, 30 * NS_PER_SEC);
    }

    #[test]
    fn test_early_close_produces_correction() {
        let mut timer = ConditionTimer::new(true, 0);

        // Dump closes the bucket 10s before its nominal boundary.
        let (true_ns, correction) = timer.new_bucket_start(50 * NS_PER_SEC, 60 * NS_PER_SEC);
        assert_eq!(true_ns, 50 * NS_PER_SEC);
        assert_eq!(correction, -10 * NS_PER_SEC);

        // The next bucket regains the borrowed 10s.
        let (true_ns, correction) = timer.new_bucket_start(120 * NS_PER_SEC, 120 * NS_PER_SEC);
        assert_eq!(true_ns, 70 * NS_PER_SEC);
        assert_eq!(correction, 10 * NS_PER_SEC);
    }
}
