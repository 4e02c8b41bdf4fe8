//! Three-stage firmware pipeline: download, external analyzer, LLM triage.
//! Stages run linearly; cancellation is consulted between stages via the
//! caller-supplied hook.

use async_trait::async_trait;

use crate::config::Settings;
use crate::error::Result;
use crate::firmware::adapters::{
    ai_triage_ollama, build_analyzer_invocation, build_prompt, count_severity, download_firmware,
    extract_findings, parse_risk_score, run_analyzer, NO_FINDINGS_REPORT,
};
use crate::types::FirmwareStatus;

/// Invoked between stages with the 1-based stage index and a label.
/// `host_status`, when `Some`, is the new value the host record's cached
/// `firmware_status` should mirror at this checkpoint; `None` means this
/// checkpoint has no host-level status of its own.
/// Returning `Err` (notably `EngineError::Cancelled`) aborts the pipeline.
#[async_trait]
pub trait FirmwareProgressHook: Send + Sync {
    async fn on_progress(&self, stage: u8, message: &str, host_status: Option<FirmwareStatus>) -> Result<()>;
}

pub struct NoopFirmwareProgressHook;

#[async_trait]
impl FirmwareProgressHook for NoopFirmwareProgressHook {
    async fn on_progress(&self, _stage: u8, _message: &str, _host_status: Option<FirmwareStatus>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FirmwareOutcome {
    pub firmware_path: String,
    pub firmware_hash: String,
    pub firmware_size_bytes: u64,
    pub analyzer_log_dir: String,
    pub risk_report: String,
    pub risk_score: Option<f32>,
    pub findings_count: u32,
    pub critical_count: u32,
    pub high_count: u32,
}

/// Run all three stages. `device_id` seeds the analyzer log-dir name;
/// `device_label`/`vendor`/`open_ports` feed the triage prompt.
#[allow(clippy::too_many_arguments)]
pub async fn run_firmware_pipeline(
    settings: &Settings,
    firmware_url: &str,
    ip: &str,
    mac: &str,
    device_id: &str,
    device_label: &str,
    vendor: Option<&str>,
    open_ports: &[u16],
    hook: &dyn FirmwareProgressHook,
) -> Result<FirmwareOutcome> {
    hook.on_progress(1, "Stage A: downloading firmware", None).await?;
    let (firmware_path, firmware_hash, firmware_size_bytes) =
        download_firmware(settings, firmware_url, ip, mac).await?;
    hook.on_progress(1, "Stage A complete", Some(FirmwareStatus::Downloaded)).await?;

    hook.on_progress(2, "Stage B: running analyzer", Some(FirmwareStatus::EmbaRunning)).await?;
    let (argv, log_dir, env) = build_analyzer_invocation(settings, &firmware_path, device_id, ip);
    tokio::fs::create_dir_all(&log_dir).await.ok();
    run_analyzer(&argv, &env).await?;
    hook.on_progress(2, "Stage B complete", Some(FirmwareStatus::EmbaDone)).await?;

    hook.on_progress(3, "Stage C: triage", Some(FirmwareStatus::Triaging)).await?;
    let findings = extract_findings(&log_dir);

    let (risk_report, risk_score, critical_count, high_count) = if findings.is_empty() {
        (NO_FINDINGS_REPORT.to_string(), None, 0, 0)
    } else {
        let prompt = build_prompt(device_label, vendor, ip, mac, open_ports, &findings);
        let report = ai_triage_ollama(settings, &prompt).await?;
        let score = parse_risk_score(&report);
        let (critical, high) = count_severity(&report);

        let report_path = log_dir.join("ai_triage.md");
        let _ = tokio::fs::write(&report_path, &report).await;

        (report, score, critical, high)
    };

    hook.on_progress(3, "Stage C complete", None).await?;

    Ok(FirmwareOutcome {
        firmware_path,
        firmware_hash,
        firmware_size_bytes,
        analyzer_log_dir: log_dir.to_string_lossy().into_owned(),
        risk_report,
        risk_score,
        findings_count: findings.len() as u32,
        critical_count,
        high_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_findings_report_has_expected_sections() {
        assert!(NO_FINDINGS_REPORT.starts_with("## Risk Score: N/A"));
        assert!(NO_FINDINGS_REPORT.contains("## Executive Summary"));
        assert!(NO_FINDINGS_REPORT.contains("## Recommendation"));
    }
}
