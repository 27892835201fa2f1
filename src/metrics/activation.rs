/// How an activation turns on when its trigger atom fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationType {
    /// Starts the ttl countdown at the trigger timestamp.
    Immediate,
    /// Defers until the next boot; the trigger only arms it.
    OnBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NotActive,
    Active,
    /// Armed; becomes active when restored after a reboot.
    ActiveOnBoot,
}

/// A time-bounded enablement of a metric, keyed by the atom matcher
/// that triggers it.
#[derive(Debug, Clone)]
pub struct Activation {
    pub activation_type: ActivationType,
    pub ttl_ns: i64,
    pub start_ns: i64,
    pub state: ActivationState,
}

impl Activation {
    pub fn new(activation_type: ActivationType, ttl_ns: i64) -> Self {
        Self {
            activation_type,
            ttl_ns,
            start_ns: 0,
            state: ActivationState::NotActive,
        }
    }

    /// Whether the activation has lapsed at `elapsed_ns`.
    pub fn expired(&self, elapsed_ns: i64) -> bool {
        elapsed_ns > self.start_ns + self.ttl_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NS_PER_SEC;

    #[test]
    fn test_new_activation_starts_not_active() {
        let a = Activation::new(ActivationType::Immediate, 30 * NS_PER_SEC);
        assert_eq!(a.state, ActivationState::NotActive);
        assert_eq!(a.start_ns, 0);
    }

    #[test]
    fn test_expiry_boundary_is_exclusive() {
        let mut a = Activation::new(ActivationType::Immediate, 30 * NS_PER_SEC);
        a.start_ns = 10 * NS_PER_SEC;
        assert!(!a.expired(40 * NS_PER_SEC));
        assert!(a.expired(40 * NS_PER_SEC + 1));
    }
}
