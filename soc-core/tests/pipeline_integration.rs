//! End-to-end scenarios from the testable-properties section. Scan-tool and
//! LLM invocations are exercised through the pure adapters/predicates
//! rather than real subprocesses or network calls, since this suite never
//! assumes `nmap`/`rustscan`/`arp-scan`/`ollama` are present in the
//! environment it runs in.

use std::time::Duration;

use soc_core::firmware::adapters::{count_severity, extract_findings, parse_risk_score, NO_FINDINGS_REPORT};
use soc_core::scan::{persist_scan_results, stage4_should_skip};
use soc_core::store::InventoryStore;
use soc_core::store_memory::MemoryStore;
use soc_core::substrate::{InMemorySubstrate, JobKind, Substrate};
use soc_core::types::DiscoveredHost;
use uuid::Uuid;

// 1. Empty subnet -> zero hosts persisted, zero counters.
#[tokio::test]
async fn empty_subnet_yields_zero_hosts_and_counters() {
    let store = MemoryStore::new();
    let summary = persist_scan_results(&store, Uuid::new_v4(), &[]).await.unwrap();
    assert_eq!(summary.hosts_discovered, 0);
    assert_eq!(summary.live_hosts, 0);
    assert_eq!(summary.open_ports_found, 0);
}

// 2. Single host, 2 open ports, fresh inventory -> host + 2 ports persisted.
#[tokio::test]
async fn single_host_two_ports_persists_host_and_ports() {
    let store = MemoryStore::new();
    let mut host = DiscoveredHost::new("192.168.1.50");
    host.mac = Some("aa:11:bb:22:cc:33".to_string());
    host.open_ports = vec![22, 443];

    let summary = persist_scan_results(&store, Uuid::new_v4(), std::slice::from_ref(&host))
        .await
        .unwrap();

    assert_eq!(summary.hosts_discovered, 1);
    assert_eq!(summary.live_hosts, 1);
    assert_eq!(summary.open_ports_found, 2);

    let loaded = store.load_host("aa:11:bb:22:cc:33").await.unwrap().unwrap();
    assert_eq!(loaded.ip_address, "192.168.1.50");
    assert_eq!(loaded.open_port_count, 2);
    let ports = store.load_ports("aa:11:bb:22:cc:33").await.unwrap();
    assert_eq!(ports.len(), 2);
}

// 3. Skip-unchanged -> stage 4's predicate skips hosts whose open-port count
// is unchanged and non-zero, leaving `open_port_count` untouched by a
// re-scan that would otherwise clobber it with the same value.
#[test]
fn skip_unchanged_predicate_matches_documented_rule() {
    assert!(stage4_should_skip(Some(2), 2));
    assert!(!stage4_should_skip(Some(2), 3), "changed count must not skip");
    assert!(!stage4_should_skip(Some(0), 0), "zero prior count must not skip");
    assert!(!stage4_should_skip(None, 2), "no prior snapshot must not skip");
}

#[tokio::test]
async fn skip_unchanged_host_keeps_prior_fields_on_reupsert() {
    let store = MemoryStore::new();
    let first_scan = Uuid::new_v4();
    let mut host = DiscoveredHost::new("10.1.1.9");
    host.mac = Some("de:ad:be:ef:00:01".to_string());
    host.open_ports = vec![80];
    host.os_name = Some("Linux 5.x".to_string());

    persist_scan_results(&store, first_scan, std::slice::from_ref(&host)).await.unwrap();
    let before = store.load_host("de:ad:be:ef:00:01").await.unwrap().unwrap();

    // A second scan whose stage-4 skip fires persists ports/host identically
    // (no OS/service fields to add since stage 4 was never invoked).
    let second_scan = Uuid::new_v4();
    assert!(stage4_should_skip(Some(before.open_port_count), host.open_ports.len()));
    persist_scan_results(&store, second_scan, std::slice::from_ref(&host)).await.unwrap();

    let after = store.load_host("de:ad:be:ef:00:01").await.unwrap().unwrap();
    assert_eq!(after.open_port_count, before.open_port_count);
    assert_eq!(after.os_name, before.os_name);
}

// 4. Cancel mid-scan -> cancel flag observed, then cleared, warning logged.
#[tokio::test]
async fn cancel_flag_round_trips_through_substrate() {
    let substrate = InMemorySubstrate::new();
    let job_id = Uuid::new_v4().to_string();

    assert!(!substrate.is_cancelled(JobKind::Scan, &job_id).await.unwrap());
    substrate.cancel(JobKind::Scan, &job_id).await.unwrap();
    assert!(substrate.is_cancelled(JobKind::Scan, &job_id).await.unwrap());

    // Worker-side handling: observe, then clear (orderly Cancelled transition).
    substrate.clear_cancel(JobKind::Scan, &job_id).await.unwrap();
    assert!(!substrate.is_cancelled(JobKind::Scan, &job_id).await.unwrap());
}

#[tokio::test]
async fn scan_job_logged_as_cancelled_records_warning() {
    let store = MemoryStore::new();
    let job_id = Uuid::new_v4();
    store
        .append_scan_log(job_id, 2, soc_core::types::LogLevel::Warning, "scan cancelled")
        .await
        .unwrap();
    // No direct read-back accessor for logs is exposed by the trait beyond
    // append; this exercises that the call succeeds against the in-memory
    // backend without panicking, matching the store's append-only contract.
}

// 5 & 6. Firmware triage: happy path risk score parsing, and the
// zero-findings canned report. The HTTP call to the LLM itself is not
// exercised here (no network in this suite); `ai_triage_ollama`'s
// surrounding logic (finding extraction, prompt building, response
// parsing) is, which is where the documented behavior actually lives.

#[test]
fn firmware_happy_path_parses_risk_score_seven_point_five() {
    let report = "## Risk Score: 7.5/10\n\n## Executive Summary\n\nSeveral findings.\n\n## Critical Findings\n\n- CRITICAL: hardcoded root password\n\n## High Findings\n\n- HIGH: outdated openssl\n";
    let score = parse_risk_score(report);
    assert_eq!(score, Some(7.5));
    let (critical, high) = count_severity(report);
    assert_eq!(critical, 1);
    assert_eq!(high, 1);
}

#[test]
fn firmware_no_findings_yields_canned_report_and_no_score() {
    let empty_dir = std::env::temp_dir().join(format!("soc-core-test-empty-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&empty_dir).unwrap();

    let findings = extract_findings(&empty_dir);
    assert!(findings.is_empty());

    // Mirrors firmware::pipeline::run_firmware_pipeline's branch when no
    // signal lines are extracted: canned report, no score, zero counts.
    let report = NO_FINDINGS_REPORT;
    assert_eq!(parse_risk_score(report), None);
    assert_eq!(count_severity(report), (0, 0));

    std::fs::remove_dir_all(&empty_dir).ok();
}

#[test]
fn firmware_with_signal_lines_extracts_matching_findings() {
    let dir = std::env::temp_dir().join(format!("soc-core-test-findings-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("scan.log"),
        "normal boot line with nothing interesting here at all today\n\
         found hardcoded password in /etc/config on this device\n\
         short\n",
    )
    .unwrap();

    let findings = extract_findings(&dir);
    assert_eq!(findings.len(), 1);
    assert!(findings[0].contains("hardcoded password"));

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test(flavor = "current_thread")]
async fn nmap_tool_timeout_path_does_not_panic() {
    // Exercises process_runner's timeout branch without asserting on a
    // specific external binary's presence.
    let argv = vec!["sleep".to_string(), "2".to_string()];
    let out = soc_core::process_runner::run(&argv, Duration::from_millis(50)).await;
    assert_eq!(out.exit_code, -1);
}
