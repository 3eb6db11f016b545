use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Access violation (the fault most targets die of).
pub const FAULT_ACCESS_VIOLATION: u32 = 0xC000_0005;
/// Illegal instruction, a common sign of a corrupted control flow.
pub const FAULT_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
/// Guard-page exhaustion from runaway recursion.
pub const FAULT_STACK_OVERFLOW: u32 = 0xC000_00FD;
/// Allocator metadata damage detected by the runtime.
pub const FAULT_HEAP_CORRUPTION: u32 = 0xC000_0374;

/// Call stacks are capped at this many frames on construction.
pub const MAX_CALL_STACK_FRAMES: usize = 64;

/// Fault state reported by a target adapter when an execution crashes.
/// Every field is best-effort: backends that cannot recover a value leave
/// it zero or empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultContext {
    pub fault_code: u32,
    pub fault_address: u64,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub call_stack: Vec<u64>,
    pub module_name: String,
    pub function_name: String,
}

impl FaultContext {
    /// Builds a context from raw fields, truncating the call stack to
    /// [`MAX_CALL_STACK_FRAMES`].
    pub fn new(fault_code: u32, fault_address: u64, mut call_stack: Vec<u64>) -> Self {
        call_stack.truncate(MAX_CALL_STACK_FRAMES);
        Self {
            fault_code,
            fault_address,
            call_stack,
            ..Self::default()
        }
    }
}

/// A triaged crash: the input that caused it, the fault state, the
/// canonical dedup key, and an exploitability hint. Records are written
/// once and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub input: Vec<u8>,
    pub context: FaultContext,
    pub dedup_key: String,
    pub exploitable: bool,
    /// Unix seconds at analysis time.
    pub timestamp: u64,
}

/// Canonical key identifying a bug: fault code, fault address, and the top
/// three call-stack frames, hex-joined with underscores. Missing frames are
/// omitted, never padded, so equal contexts always produce equal keys.
pub fn dedup_key(context: &FaultContext) -> String {
    let mut key = format!("{:x}_{:x}", context.fault_code, context.fault_address);
    for frame in context.call_stack.iter().take(3) {
        key.push_str(&format!("_{frame:x}"));
    }
    key
}

/// Exploitability hint. True for access violations in the null region or
/// the classic attacker-pattern range, and for stack overflow, heap
/// corruption, and illegal instruction faults. A hint, not a verdict.
pub fn is_exploitable(context: &FaultContext) -> bool {
    match context.fault_code {
        FAULT_ACCESS_VIOLATION => {
            context.fault_address < 0x10000
                || (0x41414141..=0x42424242).contains(&context.fault_address)
        }
        FAULT_STACK_OVERFLOW | FAULT_HEAP_CORRUPTION | FAULT_ILLEGAL_INSTRUCTION => true,
        _ => false,
    }
}

/// Normalizes a target-reported fault into a [`CrashRecord`]. Deterministic
/// in everything but the timestamp: equal contexts get equal dedup keys and
/// equal exploitability flags.
pub fn analyze(input: Vec<u8>, mut context: FaultContext) -> CrashRecord {
    context.call_stack.truncate(MAX_CALL_STACK_FRAMES);
    let dedup_key = dedup_key(&context);
    let exploitable = is_exploitable(&context);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    CrashRecord {
        input,
        context,
        dedup_key,
        exploitable,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_composes_code_address_and_top_frames() {
        let context = FaultContext::new(
            FAULT_ACCESS_VIOLATION,
            0xdeadbeef,
            vec![0x1000, 0x2000, 0x3000, 0x4000],
        );
        assert_eq!(dedup_key(&context), "c0000005_deadbeef_1000_2000_3000");
    }

    #[test]
    fn dedup_key_omits_missing_frames_without_trailing_underscores() {
        let no_stack = FaultContext::new(FAULT_ACCESS_VIOLATION, 0, Vec::new());
        assert_eq!(dedup_key(&no_stack), "c0000005_0");

        let one_frame = FaultContext::new(0x1234, 0xFF, vec![0xAB]);
        assert_eq!(dedup_key(&one_frame), "1234_ff_ab");
    }

    #[test]
    fn dedup_key_is_a_pure_function_of_the_context() {
        let context = FaultContext::new(FAULT_HEAP_CORRUPTION, 0x7000, vec![1, 2, 3]);
        let twin = context.clone();
        assert_eq!(dedup_key(&context), dedup_key(&twin));

        let record_a = analyze(vec![1], context.clone());
        let record_b = analyze(vec![2, 3], twin);
        assert_eq!(
            record_a.dedup_key, record_b.dedup_key,
            "Equal FaultContext must yield equal keys regardless of input"
        );
    }

    #[test]
    fn exploitability_flags_null_region_access_violations() {
        let mut context = FaultContext::new(FAULT_ACCESS_VIOLATION, 0x0, Vec::new());
        assert!(is_exploitable(&context));
        context.fault_address = 0xFFFF;
        assert!(is_exploitable(&context));
        context.fault_address = 0x10000;
        assert!(!is_exploitable(&context));
    }

    #[test]
    fn exploitability_flags_attacker_pattern_range() {
        let inside = FaultContext::new(FAULT_ACCESS_VIOLATION, 0x41414141, Vec::new());
        assert!(is_exploitable(&inside));
        let upper = FaultContext::new(FAULT_ACCESS_VIOLATION, 0x42424242, Vec::new());
        assert!(is_exploitable(&upper));
        let outside = FaultContext::new(FAULT_ACCESS_VIOLATION, 0x42424243, Vec::new());
        assert!(!is_exploitable(&outside));
    }

    #[test]
    fn exploitability_covers_the_always_interesting_fault_codes() {
        for code in [
            FAULT_STACK_OVERFLOW,
            FAULT_HEAP_CORRUPTION,
            FAULT_ILLEGAL_INSTRUCTION,
        ] {
            let context = FaultContext::new(code, 0x7FFF_0000, Vec::new());
            assert!(is_exploitable(&context), "code {code:#x} should flag");
        }
        let benign = FaultContext::new(0xE06D7363, 0x7FFF_0000, Vec::new());
        assert!(!is_exploitable(&benign));
    }

    #[test]
    fn analyze_truncates_oversized_call_stacks() {
        let frames: Vec<u64> = (0..100).collect();
        let record = analyze(vec![0], FaultContext::new(1, 2, frames));
        assert_eq!(record.context.call_stack.len(), MAX_CALL_STACK_FRAMES);
    }

    #[test]
    fn analyze_populates_every_record_field() {
        let context = FaultContext::new(FAULT_STACK_OVERFLOW, 0x10, vec![0xA]);
        let record = analyze(vec![0xDE, 0xAD], context.clone());
        assert_eq!(record.input, vec![0xDE, 0xAD]);
        assert_eq!(record.context, context);
        assert_eq!(record.dedup_key, "c00000fd_10_a");
        assert!(record.exploitable);
        assert!(record.timestamp > 0);
    }
}
