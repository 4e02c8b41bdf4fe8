//! Firmware pipeline adapters: streaming download, external analyzer
//! invocation, and LLM-backed triage.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::process_runner;

/// Signal keywords that promote a log line to a candidate finding, verbatim
/// from the original triage heuristic.
pub const SIGNALS: &[&str] = &[
    "cve-",
    "cwe-",
    "hardcoded",
    "password",
    "credential",
    "backdoor",
    "critical",
    "high",
    "outdated",
    "deprecated",
    "weak",
    "private key",
    "telnet",
    "default",
    "root:",
    "overflow",
    "injection",
    "unauthenticated",
    "cleartext",
    "insecure",
    "vulnerability",
    "exploit",
];

pub const NO_FINDINGS_REPORT: &str = "## Risk Score: N/A\n\n## Executive Summary\n\nNo security-relevant findings were extracted from the EMBA scan logs. This could indicate a clean firmware image, or that the firmware format was not fully supported by EMBA's analysis modules.\n\n## Recommendation\n\nManual review of the firmware binary is recommended.";

/// Stream-download firmware to `<firmware_dir>/<ip_with_underscores>_<mac_without_colons>.bin`,
/// hashing incrementally over 8 KiB chunks. Returns `(local_path, hex_digest, size_bytes)`.
pub async fn download_firmware(
    settings: &Settings,
    url: &str,
    ip: &str,
    mac: &str,
) -> Result<(String, String, u64)> {
    let filename = format!("{}_{}.bin", ip.replace('.', "_"), mac.replace(':', ""));
    let dest = Path::new(&settings.firmware_dir).join(&filename);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::ExternalServiceFailure(format!("cannot create {}: {e}", parent.display())))?;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(120))
        .user_agent("soc-core-firmware-downloader/1.0")
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;

    if !response.status().is_success() {
        return Err(EngineError::ExternalServiceFailure(format!(
            "firmware download returned status {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(&dest)
        .await
        .map_err(|e| EngineError::ExternalServiceFailure(format!("cannot create {}: {e}", dest.display())))?;

    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    let mut stream = response.bytes_stream();

    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;
        hasher.update(&chunk);
        size_bytes += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;
    }
    file.flush().await.ok();

    let digest = hasher.finalize();
    let hex_digest = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    Ok((dest.to_string_lossy().into_owned(), hex_digest, size_bytes))
}

/// Build the external analyzer invocation. `device_id` is truncated to its
/// first 8 characters for the log-dir name.
pub fn build_analyzer_invocation(
    settings: &Settings,
    firmware_path: &str,
    device_id: &str,
    ip: &str,
) -> (Vec<String>, PathBuf, Vec<(String, String)>) {
    let short_id: String = device_id.chars().take(8).collect();
    let log_dir_name = format!("device_{short_id}_{}", ip.replace('.', "_"));
    let log_dir = Path::new(&settings.analyzer_logs_dir).join(log_dir_name);

    let mut argv = vec![
        "sudo".to_string(),
        settings.analyzer_path.clone(),
        "-f".to_string(),
        firmware_path.to_string(),
        "-l".to_string(),
        log_dir.to_string_lossy().into_owned(),
    ];

    // GPT-assisted profile wins if present, otherwise fall back to the plain
    // default profile; if neither exists on disk, EMBA runs with no -p at all.
    let gpt_profile = "/opt/emba/scan-profiles/default-scan-gpt.emba";
    let default_profile = "/opt/emba/scan-profiles/default-scan.emba";
    if Path::new(gpt_profile).is_file() {
        argv.push("-p".to_string());
        argv.push(gpt_profile.to_string());
    } else if Path::new(default_profile).is_file() {
        argv.push("-p".to_string());
        argv.push(default_profile.to_string());
    }

    argv.push("-g".to_string());

    let env = vec![("GPT_OPTION".to_string(), settings.analyzer_gpt_level.clone())];

    (argv, log_dir, env)
}

/// Run the external analyzer, applying the documented 7200 s wall-clock cap.
/// A non-zero exit carries the first 500 characters of stderr.
pub async fn run_analyzer(argv: &[String], env: &[(String, String)]) -> Result<()> {
    let out = process_runner::run_with_env(argv, env, Duration::from_secs(7200)).await;
    if out.exit_code != 0 {
        let truncated = out.stderr.chars().take(500).collect::<String>();
        return Err(EngineError::ExternalServiceFailure(format!(
            "analyzer exited with code {}: {truncated}",
            out.exit_code
        )));
    }
    Ok(())
}

/// Recursively collect candidate signal lines from `*.txt`/`*.csv`/`*.log`
/// files under `log_dir`. Lines shorter than 10 characters are dropped.
/// Matching is case-insensitive substring against `SIGNALS`. De-duplicated
/// via a `HashSet`, so insertion order (and therefore which lines survive
/// the 120-line cap when more than 120 unique lines match) is not
/// deterministic across runs — this mirrors the original behavior exactly.
pub fn extract_findings(log_dir: &Path) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    walk_signal_files(log_dir, &mut seen);

    seen.into_iter().take(120).collect()
}

fn walk_signal_files(dir: &Path, seen: &mut HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_signal_files(&path, seen);
            continue;
        }
        let is_candidate = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e, "txt" | "csv" | "log"))
            .unwrap_or(false);
        if !is_candidate {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.chars().count() < 10 {
                continue;
            }
            let lower = trimmed.to_lowercase();
            if SIGNALS.iter().any(|sig| lower.contains(sig)) {
                seen.insert(trimmed.to_string());
            }
        }
    }
}

/// Build the fixed-skeleton LLM prompt.
pub fn build_prompt(
    device: &str,
    vendor: Option<&str>,
    ip: &str,
    mac: &str,
    open_ports: &[u16],
    findings: &[String],
) -> String {
    let vendor = vendor.unwrap_or("unknown");
    let ports_str = if open_ports.is_empty() {
        "none observed".to_string()
    } else {
        open_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
    };

    let findings_block = if findings.is_empty() {
        "- (no signal lines extracted)".to_string()
    } else {
        findings.iter().map(|f| format!("- {f}")).collect::<Vec<_>>().join("\n")
    };

    format!(
        "You are a firmware security analyst. Analyze the following device and its firmware \
         analysis findings, then produce a structured markdown report.\n\n\
         Device: {device}\n\
         Vendor: {vendor}\n\
         IP address: {ip}\n\
         MAC address: {mac}\n\
         Open ports: {ports_str}\n\n\
         Findings:\n{findings_block}\n\n\
         Produce a markdown report with exactly these sections, in this order:\n\
         ## Risk Score: X/10\n\
         ## Executive Summary\n\
         ## Critical Findings\n\
         ## High Findings\n\
         ## CVE Summary\n"
    )
}

/// POST the prompt to the local Ollama-compatible `/api/generate` endpoint.
pub async fn ai_triage_ollama(settings: &Settings, prompt: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(300))
        .build()
        .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;

    let body = serde_json::json!({
        "model": settings.ollama_model,
        "prompt": prompt,
        "stream": false,
        "options": {
            "temperature": 0.2,
            "num_predict": 4096,
        },
    });

    let response = client
        .post(format!("{}/api/generate", settings.ollama_url))
        .json(&body)
        .send()
        .await
        .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;

    if !response.status().is_success() {
        return Err(EngineError::ExternalServiceFailure(format!(
            "triage LLM returned status {}",
            response.status()
        )));
    }

    let parsed: serde_json::Value = response
        .json()
        .await
        .map_err(|e| EngineError::ExternalServiceFailure(e.to_string()))?;

    let text = parsed
        .get("response")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::ExternalServiceFailure("triage response missing 'response' field".to_string()))?;

    if text.trim().is_empty() {
        return Err(EngineError::ExternalServiceFailure("triage report body was empty".to_string()));
    }

    Ok(text.to_string())
}

/// Parse a risk score in `[0, 10]` from the report body, trying three
/// patterns in order; the first match that parses into range wins.
pub fn parse_risk_score(report: &str) -> Option<f32> {
    let patterns = [
        r"(?i)risk\s*score:\s*([0-9]+(?:\.[0-9]+)?)\s*/\s*10",
        r"([0-9]+(?:\.[0-9]+)?)\s*/\s*10",
        r"(?i)risk\s*score:\s*([0-9]+(?:\.[0-9]+)?)",
    ];
    for pat in patterns {
        let re = Regex::new(pat).expect("static regex is valid");
        if let Some(caps) = re.captures(report) {
            if let Ok(v) = caps[1].parse::<f32>() {
                if (0.0..=10.0).contains(&v) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Word-boundary, case-insensitive counts of "critical" and "high".
pub fn count_severity(report: &str) -> (u32, u32) {
    let critical_re = Regex::new(r"(?i)\bcritical\b").expect("static regex is valid");
    let high_re = Regex::new(r"(?i)\bhigh\b").expect("static regex is valid");
    (
        critical_re.find_iter(report).count() as u32,
        high_re.find_iter(report).count() as u32,
    )
}
