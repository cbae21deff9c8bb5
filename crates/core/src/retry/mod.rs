/// Default number of restart attempts before the engine is treated as failed.
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Bounded counter gating self-healing restarts after driver failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    count: u32,
    ceiling: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_ceiling(DEFAULT_RETRY_CEILING)
    }
}

impl RetryPolicy {
    pub fn with_ceiling(ceiling: u32) -> Self {
        Self { count: 0, ceiling }
    }

    /// Records a restart attempt and reports whether it is still permitted.
    pub fn attempt(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count < self.ceiling
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_four_attempts_then_refuses() {
        let mut policy = RetryPolicy::default();
        let outcomes: Vec<bool> = (0..5).map(|_| policy.attempt()).collect();

        assert_eq!(outcomes, vec![true, true, true, true, false]);
        assert!(policy.is_exhausted());
        assert!(!policy.attempt());
    }

    #[test]
    fn reset_restores_the_pattern() {
        let mut policy = RetryPolicy::default();
        for _ in 0..7 {
            policy.attempt();
        }
        policy.reset();

        assert_eq!(policy.count(), 0);
        let permitted = (0..5).filter(|_| policy.attempt()).count();
        assert_eq!(permitted, 4);
    }

    #[test]
    fn zero_ceiling_never_permits() {
        let mut policy = RetryPolicy::with_ceiling(0);
        assert!(!policy.attempt());
    }
}
