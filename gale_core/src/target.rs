use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::coverage::CoverageSample;
use crate::crash::{FaultContext, FAULT_ACCESS_VIOLATION};
use crate::util;

/// Classification of one target execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzResult {
    /// The target returned normally; `coverage` carries the execution's
    /// sample when the adapter can observe one.
    Success { coverage: Option<CoverageSample> },
    /// The target returned normally and the adapter already knows no new
    /// code was reached.
    NoNewCoverage,
    /// The target faulted; the context is best-effort.
    Crash(FaultContext),
    /// The target did not return within its timeout and was abandoned.
    Hang,
    /// Adapter-internal failure; the iteration is counted and skipped.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

/// The component that knows how to feed a byte string into one kind of
/// target and classify the outcome. This is the core's main extension
/// point; adapters own timeout enforcement and must never panic through
/// `execute` — adapter-internal failures come back as `FuzzResult::Error`.
pub trait TargetAdapter: Send + Sync {
    fn setup(&self) -> Result<(), String>;
    /// Runs one input. May block up to `timeout` plus a small bounded
    /// epsilon; past that the adapter must return `Hang`.
    fn execute(&self, input: &[u8], timeout: Duration) -> FuzzResult;
    fn cleanup(&self);
    fn name(&self) -> String;
    fn architecture(&self) -> Architecture;
}

/// Adapter for targets that are plain functions in this process: wraps a
/// harness closure and converts panics into `Crash` classifications with a
/// synthesized fault context. Timeout enforcement does not apply; the
/// harness runs to completion on the worker thread.
pub struct InProcessTarget<F>
where
    F: Fn(&[u8]) -> FuzzResult,
{
    name: String,
    harness: F,
}

impl<F> InProcessTarget<F>
where
    F: Fn(&[u8]) -> FuzzResult,
{
    pub fn new(name: impl Into<String>, harness: F) -> Self {
        Self {
            name: name.into(),
            harness,
        }
    }
}

impl<F> TargetAdapter for InProcessTarget<F>
where
    F: Fn(&[u8]) -> FuzzResult + Send + Sync,
{
    fn setup(&self) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, input: &[u8], _timeout: Duration) -> FuzzResult {
        match catch_unwind(AssertUnwindSafe(|| (self.harness)(input))) {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                // No hardware fault state exists for a panic; key the crash
                // on the panic message so distinct panics dedup apart.
                let mut context = FaultContext::new(
                    FAULT_ACCESS_VIOLATION,
                    util::hash_data(message.as_bytes()),
                    Vec::new(),
                );
                context.function_name = message;
                FuzzResult::Crash(context)
            }
        }
    }

    fn cleanup(&self) {}

    fn name(&self) -> String {
        self.name.clone()
    }

    fn architecture(&self) -> Architecture {
        if cfg!(target_pointer_width = "64") {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> Duration {
        Duration::from_millis(100)
    }

    #[test]
    fn in_process_target_passes_through_harness_results() {
        let target = InProcessTarget::new("passthrough", |input: &[u8]| {
            if input.first() == Some(&0xFF) {
                FuzzResult::Hang
            } else {
                FuzzResult::Success { coverage: None }
            }
        });
        assert!(target.setup().is_ok());
        assert_eq!(
            target.execute(&[0x01], timeout()),
            FuzzResult::Success { coverage: None }
        );
        assert_eq!(target.execute(&[0xFF], timeout()), FuzzResult::Hang);
        target.cleanup();
    }

    #[test]
    fn in_process_target_converts_panics_into_crashes() {
        let target = InProcessTarget::new("panicky", |input: &[u8]| {
            if input.starts_with(b"BAD") {
                panic!("BAD input reached the harness");
            }
            FuzzResult::Success { coverage: None }
        });

        match target.execute(b"BADBAD", timeout()) {
            FuzzResult::Crash(context) => {
                assert_eq!(context.fault_code, FAULT_ACCESS_VIOLATION);
                assert!(context.function_name.contains("BAD input"));
            }
            other => panic!("Expected a crash classification, got {other:?}"),
        }
    }

    #[test]
    fn distinct_panic_messages_synthesize_distinct_fault_addresses() {
        let target = InProcessTarget::new("two-bugs", |input: &[u8]| {
            match input.first() {
                Some(1) => panic!("bug one"),
                Some(2) => panic!("bug two"),
                _ => FuzzResult::Success { coverage: None },
            }
        });

        let first = match target.execute(&[1], timeout()) {
            FuzzResult::Crash(c) => c.fault_address,
            other => panic!("Expected crash, got {other:?}"),
        };
        let second = match target.execute(&[2], timeout()) {
            FuzzResult::Crash(c) => c.fault_address,
            other => panic!("Expected crash, got {other:?}"),
        };
        assert_ne!(first, second);
    }

    #[test]
    fn in_process_target_reports_name_and_architecture() {
        let target = InProcessTarget::new("named", |_: &[u8]| FuzzResult::NoNewCoverage);
        assert_eq!(target.name(), "named");
        let _ = target.architecture();
    }
}
