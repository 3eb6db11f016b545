use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::crash::{CrashRecord, FaultContext};
use crate::util;

/// Sidecar metadata written next to each crash input. The `.bin` file is
/// the raw reproducer; this carries everything else a triager wants.
#[derive(Debug, Serialize)]
struct CrashMetadata<'a> {
    dedup_key: &'a str,
    exploitable: bool,
    timestamp: u64,
    input_len: usize,
    context: &'a FaultContext,
}

/// Writes `crash_<sequence>_<dedup-key>.bin` (the raw input bytes) and a
/// matching `.json` metadata sidecar under `dir`, creating `dir` if absent.
/// Returns the path of the `.bin` file.
pub fn write_crash(dir: &Path, sequence: u64, record: &CrashRecord) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let stem = format!("crash_{sequence}_{}", record.dedup_key);
    let input_path = dir.join(format!("{stem}.bin"));
    util::write_file(&input_path, &record.input)?;

    let metadata = CrashMetadata {
        dedup_key: &record.dedup_key,
        exploitable: record.exploitable,
        timestamp: record.timestamp,
        input_len: record.input.len(),
        context: &record.context,
    };
    let json = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    util::write_file(&dir.join(format!("{stem}.json")), &json)?;

    Ok(input_path)
}

/// Everything the end-of-session summary carries.
#[derive(Debug, Clone, Default)]
pub struct FinalReport {
    pub target_name: String,
    pub duration_secs: u64,
    pub iterations: u64,
    pub crashes: u64,
    pub hangs: u64,
    pub execs_per_second: f64,
    pub coverage_percentage: Option<f64>,
    pub basic_blocks: Option<u64>,
}

/// Renders the final report as plain text into `<dir>/final_report.txt`,
/// creating `dir` if absent. Returns the report path.
pub fn write_final_report(dir: &Path, report: &FinalReport) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let mut text = String::new();
    text.push_str("gale final report\n");
    text.push_str("=================\n\n");
    text.push_str(&format!("Target: {}\n", report.target_name));
    text.push_str(&format!("Duration: {} seconds\n", report.duration_secs));
    text.push_str(&format!("Iterations: {}\n", report.iterations));
    text.push_str(&format!("Crashes: {}\n", report.crashes));
    text.push_str(&format!("Hangs: {}\n", report.hangs));
    text.push_str(&format!("Exec/sec: {:.2}\n", report.execs_per_second));
    if let Some(percentage) = report.coverage_percentage {
        text.push_str(&format!("Coverage: {percentage:.2}%\n"));
    }
    if let Some(blocks) = report.basic_blocks {
        text.push_str(&format!("Basic blocks: {blocks}\n"));
    }

    let path = dir.join("final_report.txt");
    fs::write(&path, text)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::{analyze, FaultContext, FAULT_ACCESS_VIOLATION};
    use tempfile::tempdir;

    #[test]
    fn write_crash_produces_bin_and_json_with_key_in_name() {
        let dir = tempdir().unwrap();
        let record = analyze(
            vec![0xDE, 0xAD],
            FaultContext::new(FAULT_ACCESS_VIOLATION, 0, Vec::new()),
        );
        let path = write_crash(dir.path(), 1, &record).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "crash_1_c0000005_0.bin"
        );
        assert_eq!(util::read_file(&path).unwrap(), vec![0xDE, 0xAD]);

        let sidecar = dir.path().join("crash_1_c0000005_0.json");
        let json: serde_json::Value =
            serde_json::from_slice(&util::read_file(&sidecar).unwrap()).unwrap();
        assert_eq!(json["dedup_key"], "c0000005_0");
        assert_eq!(json["input_len"], 2);
        assert_eq!(json["context"]["fault_code"], FAULT_ACCESS_VIOLATION);
        dir.close().unwrap();
    }

    #[test]
    fn write_crash_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("deep").join("crashes");
        let record = analyze(vec![1], FaultContext::new(1, 2, vec![3]));
        let path = write_crash(&nested, 0, &record).unwrap();
        assert!(path.exists());
        dir.close().unwrap();
    }

    #[test]
    fn final_report_contains_all_mandatory_fields() {
        let dir = tempdir().unwrap();
        let report = FinalReport {
            target_name: "demo".to_string(),
            duration_secs: 61,
            iterations: 1000,
            crashes: 2,
            hangs: 1,
            execs_per_second: 16.39,
            coverage_percentage: None,
            basic_blocks: None,
        };
        let path = write_final_report(dir.path(), &report).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Target: demo"));
        assert!(text.contains("Duration: 61 seconds"));
        assert!(text.contains("Iterations: 1000"));
        assert!(text.contains("Crashes: 2"));
        assert!(text.contains("Hangs: 1"));
        assert!(text.contains("Exec/sec: 16.39"));
        assert!(!text.contains("Coverage:"), "Optional fields stay absent");
        dir.close().unwrap();
    }

    #[test]
    fn final_report_includes_coverage_when_known() {
        let dir = tempdir().unwrap();
        let report = FinalReport {
            target_name: "demo".to_string(),
            coverage_percentage: Some(12.5),
            basic_blocks: Some(640),
            ..FinalReport::default()
        };
        let path = write_final_report(dir.path(), &report).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Coverage: 12.50%"));
        assert!(text.contains("Basic blocks: 640"));
        dir.close().unwrap();
    }
}
