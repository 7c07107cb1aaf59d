//! Fault injection for crash-recovery testing
//!
//! Only compiled for tests or with the `fault-injection` feature.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Environment variable that arms [`CrashAfterCheckpoint`] with p = 0.5
pub const CRASH_ENV: &str = "A3S_SERVE_INTENTIONALLY_CRASH";

/// Decides whether the controller dies right after persisting a checkpoint
pub trait FaultPolicy: Send + Sync {
    /// Called after the checkpoint for mutation `seq` was written
    fn crash_after_checkpoint(&self, seq: u64) -> bool;
}

/// Crash with a fixed probability after each checkpoint
#[derive(Debug, Clone)]
pub struct CrashAfterCheckpoint {
    probability: f64,
}

impl CrashAfterCheckpoint {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Armed from the environment, if the variable is set
    pub fn from_env() -> Option<Self> {
        std::env::var_os(CRASH_ENV).map(|_| Self::new(0.5))
    }
}

impl FaultPolicy for CrashAfterCheckpoint {
    fn crash_after_checkpoint(&self, _seq: u64) -> bool {
        rand::thread_rng().gen::<f64>() < self.probability
    }
}

/// Crash exactly once, after the checkpoint of the given mutation
#[derive(Debug)]
pub struct CrashAtSeq {
    seq: AtomicU64,
}

impl CrashAtSeq {
    pub fn new(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
        }
    }
}

impl FaultPolicy for CrashAtSeq {
    fn crash_after_checkpoint(&self, seq: u64) -> bool {
        self.seq
            .compare_exchange(seq, u64::MAX, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_bounds() {
        let never = CrashAfterCheckpoint::new(0.0);
        let always = CrashAfterCheckpoint::new(3.0);
        for seq in 0..100 {
            assert!(!never.crash_after_checkpoint(seq));
            assert!(always.crash_after_checkpoint(seq));
        }
    }

    #[test]
    fn test_crash_at_seq_fires_once() {
        let policy = CrashAtSeq::new(3);
        assert!(!policy.crash_after_checkpoint(1));
        assert!(!policy.crash_after_checkpoint(2));
        assert!(policy.crash_after_checkpoint(3));
        assert!(!policy.crash_after_checkpoint(3));
    }
}
