//! The four-stage scan state machine: ping sweep, link-layer probe, fast
//! port scan, deep scan. Each stage consumes the previous stage's output
//! set; only stage 4 may shrink it (skip-unchanged).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::config::Settings;
use crate::error::{EngineError, Result};
use crate::process_runner;
use crate::scan::adapters::{
    build_arp_nmap_fallback_args, build_arp_scan_args, build_deep_scan_args,
    build_nmap_top_ports_args, build_ping_sweep_args, build_rustscan_args, parse_arp_nmap_fallback,
    parse_arp_scan_output, parse_deep_scan_xml, parse_nmap_open_ports, parse_ping_sweep_xml,
    parse_rustscan_greppable,
};
use crate::types::{DiscoveredHost, PriorHostSnapshot};

const STAGE2_CONCURRENCY: usize = 50;
const STAGE2_TIMEOUT: Duration = Duration::from_secs(15);
const STAGE3_CONCURRENCY: usize = 20;
const STAGE3_TIMEOUT_CAP: Duration = Duration::from_secs(60);
const STAGE4_CONCURRENCY: usize = 5;

/// Invoked at stage boundaries and, for stage 3, every 10 completed hosts
/// and once at the end. Returning `Err` (notably `EngineError::Cancelled`)
/// aborts the pipeline.
#[async_trait]
pub trait ScanProgressHook: Send + Sync {
    async fn on_progress(&self, stage: u8, message: &str, details: serde_json::Value) -> Result<()>;
}

/// A hook that never reports cancellation or failure; used by tests that
/// don't care about progress plumbing.
pub struct NoopProgressHook;

#[async_trait]
impl ScanProgressHook for NoopProgressHook {
    async fn on_progress(&self, _stage: u8, _message: &str, _details: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Run the full four-stage pipeline against `target`. `prior_port_counts` and
/// `prior_hosts` are dispatch-time snapshots used by stage 4's skip-unchanged
/// rule and rehydration path respectively.
pub async fn run_scan_pipeline(
    settings: &Settings,
    target: &str,
    prior_port_counts: &BTreeMap<String, u32>,
    prior_hosts: &BTreeMap<String, PriorHostSnapshot>,
    hook: &dyn ScanProgressHook,
) -> Result<Vec<DiscoveredHost>> {
    hook.on_progress(1, "Stage 1: ping sweep", json!({})).await?;
    let stage1 = run_stage1_ping_sweep(settings, target).await?;
    hook.on_progress(
        1,
        "Stage 1 complete",
        json!({"hosts_found": stage1.len()}),
    )
    .await?;

    if stage1.is_empty() {
        return Ok(Vec::new());
    }

    hook.on_progress(2, "Stage 2: link-layer probe", json!({"hosts": stage1.len()}))
        .await?;
    let stage2 = run_stage2_link_layer_probe(settings, stage1).await?;
    hook.on_progress(2, "Stage 2 complete", json!({})).await?;

    hook.on_progress(3, "Stage 3: fast port scan", json!({"hosts": stage2.len()}))
        .await?;
    let stage3 = run_stage3_fast_port_scan(settings, stage2, hook).await?;
    hook.on_progress(3, "Stage 3 complete", json!({})).await?;

    hook.on_progress(4, "Stage 4: deep scan", json!({})).await?;
    let stage4 = run_stage4_deep_scan(settings, stage3, prior_port_counts, prior_hosts).await?;
    hook.on_progress(4, "Stage 4 complete", json!({"hosts": stage4.len()}))
        .await?;

    Ok(stage4)
}

async fn run_stage1_ping_sweep(settings: &Settings, target: &str) -> Result<Vec<DiscoveredHost>> {
    let (argv, timeout) = build_ping_sweep_args(settings, target);
    let out = process_runner::run(&argv, timeout).await;
    if out.exit_code != 0 && out.stdout.trim().is_empty() {
        // Graceful empty result, not a pipeline failure.
        return Ok(Vec::new());
    }
    Ok(parse_ping_sweep_xml(&out.stdout))
}

async fn run_stage2_link_layer_probe(
    settings: &Settings,
    hosts: Vec<DiscoveredHost>,
) -> Result<Vec<DiscoveredHost>> {
    let semaphore = Arc::new(Semaphore::new(STAGE2_CONCURRENCY));
    let settings = settings.clone();

    let futures = hosts.into_iter().map(|mut host| {
        let semaphore = semaphore.clone();
        let settings = settings.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore not closed");

            if host.mac.is_none() {
                let argv = build_arp_scan_args(&settings, &host.ip);
                let out = process_runner::run(&argv, STAGE2_TIMEOUT).await;
                if let Some((mac, vendor)) = parse_arp_scan_output(&out.stdout, &host.ip) {
                    host.mac = Some(mac);
                    if host.vendor.is_none() {
                        host.vendor = vendor;
                    }
                } else {
                    let argv = build_arp_nmap_fallback_args(&settings, &host.ip);
                    let out = process_runner::run(&argv, STAGE2_TIMEOUT).await;
                    host.mac = parse_arp_nmap_fallback(&out.stdout);
                }
            }
            host
        }
    });

    Ok(join_all(futures).await)
}

async fn run_stage3_fast_port_scan(
    settings: &Settings,
    hosts: Vec<DiscoveredHost>,
    hook: &dyn ScanProgressHook,
) -> Result<Vec<DiscoveredHost>> {
    let semaphore = Arc::new(Semaphore::new(STAGE3_CONCURRENCY));
    let timeout = settings.scan_timeout().min(STAGE3_TIMEOUT_CAP);
    let total = hosts.len();
    let settings = settings.clone();

    let mut results = Vec::with_capacity(total);
    let mut completed = 0usize;

    // Chunked so the "every 10 completions" progress callback can fire
    // between batches without needing a shared counter across futures.
    for chunk in hosts.chunks(STAGE3_CONCURRENCY) {
        let futures = chunk.iter().cloned().map(|mut host| {
            let semaphore = semaphore.clone();
            let settings = settings.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");

                let argv = build_rustscan_args(&settings, &host.ip, timeout);
                let out = process_runner::run(&argv, timeout).await;
                let mut ports = parse_rustscan_greppable(&out.stdout);

                if ports.is_empty() {
                    let argv = build_nmap_top_ports_args(&settings, &host.ip);
                    let out = process_runner::run(&argv, timeout).await;
                    ports = parse_nmap_open_ports(&out.stdout);
                }

                host.open_ports = ports;
                host
            }
        });

        for host in join_all(futures).await {
            results.push(host);
            completed += 1;
            if completed % 10 == 0 || completed == total {
                hook.on_progress(
                    3,
                    "Stage 3 progress",
                    json!({"completed": completed, "total": total}),
                )
                .await?;
            }
        }
    }

    Ok(results)
}

async fn run_stage4_deep_scan(
    settings: &Settings,
    hosts: Vec<DiscoveredHost>,
    prior_port_counts: &BTreeMap<String, u32>,
    prior_hosts: &BTreeMap<String, PriorHostSnapshot>,
) -> Result<Vec<DiscoveredHost>> {
    let semaphore = Arc::new(Semaphore::new(STAGE4_CONCURRENCY));
    let timeout = settings.scan_timeout();
    let settings = settings.clone();

    let futures = hosts.into_iter().map(|mut host| {
        let semaphore = semaphore.clone();
        let settings = settings.clone();
        let prior_port_counts = prior_port_counts;
        let prior_hosts = prior_hosts;
        async move {
            if host.open_ports.is_empty() {
                // No ports discovered: passes through untouched.
                return host;
            }

            let link_layer_id = host.link_layer_id();
            let prior_count = prior_port_counts.get(&link_layer_id).copied();

            if stage4_should_skip(prior_count, host.open_ports.len()) {
                if let Some(snapshot) = prior_hosts.get(&link_layer_id) {
                    rehydrate_from_snapshot(&mut host, snapshot);
                }
                return host;
            }

            let _permit = semaphore.acquire().await.expect("semaphore not closed");
            let argv = build_deep_scan_args(&settings, &host.ip, &host.open_ports);
            let out = process_runner::run(&argv, timeout).await;
            let parsed = parse_deep_scan_xml(&out.stdout);

            host.os_name = parsed.os_name;
            host.os_family = parsed.os_family;
            host.os_accuracy = parsed.os_accuracy;
            host.os_cpe = parsed.os_cpe;
            if host.hostname.is_none() {
                host.hostname = parsed.hostname;
            }
            host.services = parsed.services;
            host.nmap_xml = Some(out.stdout);
            host
        }
    });

    Ok(join_all(futures).await)
}

/// Stage 4's skip-unchanged predicate: skip only when a prior count exists,
/// is non-zero, and matches the in-flight open-port count exactly.
pub fn stage4_should_skip(prior_count: Option<u32>, current_open_port_len: usize) -> bool {
    prior_count
        .map(|c| c > 0 && c as usize == current_open_port_len)
        .unwrap_or(false)
}

fn rehydrate_from_snapshot(host: &mut DiscoveredHost, snapshot: &PriorHostSnapshot) {
    host.os_name = snapshot.host.os_name.clone();
    host.os_family = snapshot.host.os_family.clone();
    host.os_accuracy = snapshot.host.os_accuracy;
    host.os_cpe = snapshot.host.os_cpe.clone();
    if host.hostname.is_none() {
        host.hostname = snapshot.host.hostname.clone();
    }
    host.services = snapshot
        .ports
        .iter()
        .map(|p| {
            (
                p.port_number,
                crate::types::ServiceInfo {
                    port: p.port_number,
                    protocol: p.protocol.clone(),
                    state: p.state.clone(),
                    name: p.service_name.clone(),
                    product: p.service_product.clone(),
                    version: p.service_version.clone(),
                    extra_info: p.service_extra_info.clone(),
                    cpe: p.service_cpe.clone(),
                    scripts: p.scripts_output.clone(),
                },
            )
        })
        .collect();
}

/// Returns `true` if the pipeline error is a cancellation signal, as opposed
/// to any other terminal failure.
pub fn is_cancellation(err: &EngineError) -> bool {
    matches!(err, EngineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_stage1_short_circuits_to_empty_result() {
        let settings = Settings::default();
        let prior_counts = BTreeMap::new();
        let prior_hosts = BTreeMap::new();
        // A target that resolves to nothing real under test sandboxing still
        // exercises the "stage1 empty -> Ok(vec![])" contract via the same
        // code path as a genuinely empty subnet, since `nmap`/`sudo` are
        // absent in the test environment and `run` reports a non-zero exit
        // with empty stdout.
        let result = run_scan_pipeline(
            &settings,
            "203.0.113.0/30",
            &prior_counts,
            &prior_hosts,
            &NoopProgressHook,
        )
        .await
        .unwrap();
        assert!(result.is_empty());
    }
}
