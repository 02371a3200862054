//! Execution sandbox enforcing resource limits.
//!
//! A machine runs untrusted code, so `run` consults the sandbox before every
//! instruction.  Two budgets can stop a run: a total instruction count and a
//! wall-clock limit measured from the start of the current run.  Either one
//! stops the run with a sentinel carrying the `Break` code, so the host can
//! inspect the state and resume.  The sandbox also owns the auto-extension policy: when enabled, a
//! run that overflows the operand stack or writes past the end of memory has
//! the offending resource grown (up to a ceiling) and the instruction retried.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::DEFAULT_MEMORY_BYTES;
use crate::stack::DEFAULT_STACK_WORDS;

/// Durations travel through JSON as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Budgets and growth ceilings for one machine.  A zero budget is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    pub instruction_limit: u64,
    #[serde(with = "millis")]
    pub wall_time: Duration,
    /// Grow the stack or memory instead of failing on overflow.
    pub auto_extend: bool,
    /// Ceiling for auto-extended memory and for child machines.
    pub max_memory_bytes: usize,
    /// Ceiling for auto-extended stacks and for child machines.
    pub max_stack_words: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            instruction_limit: 0,
            wall_time: Duration::ZERO,
            auto_extend: false,
            max_memory_bytes: 64 * DEFAULT_MEMORY_BYTES,
            max_stack_words: 1024 * DEFAULT_STACK_WORDS,
        }
    }
}

/// Counters accumulated across runs until [`Sandbox::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub instruction_count: u64,
    pub max_stack_depth: usize,
    pub extensions: u64,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
    start: Instant,
    metrics: SandboxMetrics,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            start: Instant::now(),
            metrics: SandboxMetrics::default(),
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: SandboxLimits) {
        self.limits = limits;
    }

    pub fn metrics(&self) -> SandboxMetrics {
        let mut metrics = self.metrics;
        metrics.elapsed = self.start.elapsed();
        metrics
    }

    /// Restart the wall clock; called at the top of every run.
    pub fn start_run(&mut self) {
        self.start = Instant::now();
    }

    /// Clear the counters, giving the instruction budget back.
    pub fn reset(&mut self) {
        self.metrics = SandboxMetrics::default();
        self.start = Instant::now();
    }

    /// Charge one instruction against the budgets.
    pub fn observe_instruction(&mut self) -> Result<(), SandboxError> {
        if self.limits.instruction_limit != 0
            && self.metrics.instruction_count >= self.limits.instruction_limit
        {
            return Err(SandboxError::InstructionLimit {
                limit: self.limits.instruction_limit,
            });
        }
        self.enforce_wall_time()?;
        self.metrics.instruction_count += 1;
        Ok(())
    }

    pub fn record_stack_depth(&mut self, depth: usize) {
        if depth > self.metrics.max_stack_depth {
            self.metrics.max_stack_depth = depth;
        }
    }

    /// New size for a resource of `current` units that needs at least
    /// `needed`, or `None` when extension is off, `needed` already fits, or
    /// `needed` is past the ceiling.  Sizes at least double.
    pub fn extended_size(&self, current: usize, needed: usize, ceiling: usize) -> Option<usize> {
        if !self.limits.auto_extend || needed <= current || needed > ceiling {
            return None;
        }
        let size = needed.max(current.saturating_mul(2)).min(ceiling);
        (size > current).then_some(size)
    }

    pub fn record_extension(&mut self) {
        self.metrics.extensions += 1;
    }

    fn enforce_wall_time(&self) -> Result<(), SandboxError> {
        if self.limits.wall_time.is_zero() {
            return Ok(());
        }
        if self.start.elapsed() > self.limits.wall_time {
            return Err(SandboxError::Timeout {
                limit: self.limits.wall_time,
            });
        }
        Ok(())
    }
}

/// Budget exhaustion; reports the `Break` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("instruction limit exceeded (limit {limit})")]
    InstructionLimit { limit: u64 },
    #[error("execution timed out after {limit:?}")]
    Timeout { limit: Duration },
}
