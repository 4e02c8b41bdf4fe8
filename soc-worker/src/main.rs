use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use soc_core::config::Settings;
use soc_core::error::{EngineError, Result};
use soc_core::firmware::{run_firmware_pipeline, FirmwareProgressHook};
use soc_core::scan::{run_scan_pipeline, ScanProgressHook};
use soc_core::store::InventoryStore;
use soc_core::store_memory::MemoryStore;
use soc_core::substrate::{JobKind, RedisSubstrate, Substrate};
use soc_core::types::{FirmwareStatus, LogLevel, ScanStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = Settings::from_env();

    let store: Arc<dyn InventoryStore> = match &settings.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg = soc_core::store_postgres::PostgresInventoryStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresInventoryStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL set but postgres feature not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no DATABASE_URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let substrate: Arc<dyn Substrate> = Arc::new(RedisSubstrate::connect(&settings.redis_url).await?);

    tracing::info!("soc-worker starting");
    worker_loop(settings, store, substrate).await;
    Ok(())
}

/// Long-running dequeue loop. Maintains a set of in-flight per-job tasks;
/// loop-level errors are logged and the loop sleeps briefly before resuming.
async fn worker_loop(settings: Settings, store: Arc<dyn InventoryStore>, substrate: Arc<dyn Substrate>) {
    let active_tasks: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let scan_id = substrate.dequeue(JobKind::Scan, Duration::from_secs(2)).await;
        let firmware_id = match &scan_id {
            Ok(None) => substrate.dequeue(JobKind::Firmware, Duration::from_secs(2)).await,
            _ => Ok(None),
        };

        let mut spawned = false;

        match scan_id {
            Ok(Some(id_str)) => {
                spawned = true;
                if let Ok(id) = Uuid::parse_str(&id_str) {
                    let settings = settings.clone();
                    let store = store.clone();
                    let substrate = substrate.clone();
                    let tasks = active_tasks.clone();
                    let handle = tokio::spawn(async move {
                        process_scan(id, settings, store, substrate).await;
                        tasks.lock().await.remove(&id);
                    });
                    active_tasks.lock().await.insert(id, handle);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "scan dequeue failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Ok(None) => {}
        }

        match firmware_id {
            Ok(Some(id_str)) => {
                spawned = true;
                if let Ok(id) = Uuid::parse_str(&id_str) {
                    let settings = settings.clone();
                    let store = store.clone();
                    let substrate = substrate.clone();
                    let tasks = active_tasks.clone();
                    let handle = tokio::spawn(async move {
                        process_firmware(id, settings, store, substrate).await;
                        tasks.lock().await.remove(&id);
                    });
                    active_tasks.lock().await.insert(id, handle);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "firmware dequeue failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Ok(None) => {}
        }

        if !spawned {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

struct WorkerScanHook {
    job_id: Uuid,
    store: Arc<dyn InventoryStore>,
    substrate: Arc<dyn Substrate>,
}

#[async_trait]
impl ScanProgressHook for WorkerScanHook {
    async fn on_progress(&self, stage: u8, message: &str, details: serde_json::Value) -> Result<()> {
        if self
            .substrate
            .is_cancelled(JobKind::Scan, &self.job_id.to_string())
            .await
            .unwrap_or(false)
        {
            return Err(EngineError::Cancelled);
        }

        if let Some(mut job) = self.store.load_scan_job(self.job_id).await.ok().flatten() {
            job.progress.current_stage = stage;
            job.progress.stage_label = Some(message.to_string());
            let _ = self.store.save_scan_job(&job).await;
        }
        let _ = self
            .store
            .append_scan_log(self.job_id, stage, LogLevel::Info, message)
            .await;

        let payload = serde_json::json!({
            "type": "scan_progress",
            "scan_id": self.job_id,
            "stage": stage,
            "stage_label": message,
            "data": details,
        });
        let _ = soc_core::substrate::publish_json(
            self.substrate.as_ref(),
            JobKind::Scan,
            &self.job_id.to_string(),
            &payload,
        )
        .await;

        Ok(())
    }
}

async fn process_scan(
    job_id: Uuid,
    settings: Settings,
    store: Arc<dyn InventoryStore>,
    substrate: Arc<dyn Substrate>,
) {
    let Some(mut job) = store.load_scan_job(job_id).await.ok().flatten() else {
        tracing::warn!(%job_id, "scan job not found");
        return;
    };
    if job.status == ScanStatus::Cancelled {
        return;
    }

    job.status = ScanStatus::Running;
    job.started_at = Some(chrono::Utc::now());
    let _ = store.save_scan_job(&job).await;

    let prior_port_counts = store.load_prior_port_counts().await.unwrap_or_default();
    let prior_hosts = store.load_prior_hosts().await.unwrap_or_default();

    let hook = WorkerScanHook {
        job_id,
        store: store.clone(),
        substrate: substrate.clone(),
    };

    let result = run_scan_pipeline(&settings, &job.target, &prior_port_counts, &prior_hosts, &hook).await;

    match result {
        Ok(hosts) => {
            let summary = soc_core::scan::persist_scan_results(store.as_ref(), job_id, &hosts)
                .await
                .unwrap_or_default();

            job.status = ScanStatus::Completed;
            job.hosts_discovered = summary.hosts_discovered;
            job.live_hosts = summary.live_hosts;
            job.open_ports_found = summary.open_ports_found;
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_scan_job(&job).await;

            let payload = serde_json::json!({
                "type": "scan_completed",
                "scan_id": job_id,
                "hosts_discovered": job.hosts_discovered,
                "live_hosts": job.live_hosts,
                "open_ports_found": job.open_ports_found,
            });
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Scan,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
        Err(EngineError::Cancelled) => {
            job.status = ScanStatus::Cancelled;
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_scan_job(&job).await;
            let _ = store
                .append_scan_log(job_id, job.progress.current_stage, LogLevel::Warning, "scan cancelled")
                .await;
            let _ = substrate.clear_cancel(JobKind::Scan, &job_id.to_string()).await;

            let payload = serde_json::json!({"type": "scan_cancelled", "scan_id": job_id});
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Scan,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
        Err(e) => {
            job.status = ScanStatus::Failed;
            job.error_message = Some(e.truncated_message());
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_scan_job(&job).await;

            let payload = serde_json::json!({
                "type": "scan_failed",
                "scan_id": job_id,
                "error": job.error_message,
            });
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Scan,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
    }
}

struct WorkerFirmwareHook {
    job_id: Uuid,
    host_link_layer_id: String,
    store: Arc<dyn InventoryStore>,
    substrate: Arc<dyn Substrate>,
}

#[async_trait]
impl FirmwareProgressHook for WorkerFirmwareHook {
    async fn on_progress(&self, stage: u8, message: &str, host_status: Option<FirmwareStatus>) -> Result<()> {
        if self
            .substrate
            .is_cancelled(JobKind::Firmware, &self.job_id.to_string())
            .await
            .unwrap_or(false)
        {
            return Err(EngineError::Cancelled);
        }

        if let Some(status) = host_status {
            let _ = self
                .store
                .update_firmware_fields(
                    &self.host_link_layer_id,
                    None,
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(status.as_str()),
                )
                .await;
        }

        let payload = serde_json::json!({
            "type": "firmware_progress",
            "firmware_id": self.job_id,
            "stage": stage,
            "stage_label": message,
        });
        let _ = soc_core::substrate::publish_json(
            self.substrate.as_ref(),
            JobKind::Firmware,
            &self.job_id.to_string(),
            &payload,
        )
        .await;

        Ok(())
    }
}

async fn process_firmware(
    job_id: Uuid,
    settings: Settings,
    store: Arc<dyn InventoryStore>,
    substrate: Arc<dyn Substrate>,
) {
    let Some(mut job) = store.load_firmware_job(job_id).await.ok().flatten() else {
        tracing::warn!(%job_id, "firmware job not found");
        return;
    };
    if job.status == FirmwareStatus::Cancelled {
        return;
    }

    job.status = FirmwareStatus::Downloading;
    job.started_at = Some(chrono::Utc::now());
    let _ = store.save_firmware_job(&job).await;

    let Some(url) = job.firmware_url.clone() else {
        job.status = FirmwareStatus::Failed;
        job.error_message = Some("firmware job has no URL".to_string());
        let _ = store.save_firmware_job(&job).await;
        return;
    };

    let host = store.load_host(&job.host_link_layer_id).await.ok().flatten();
    let ip = host.as_ref().map(|h| h.ip_address.clone()).unwrap_or_default();
    let vendor = host.as_ref().and_then(|h| h.vendor.clone());
    let ports = store
        .load_ports(&job.host_link_layer_id)
        .await
        .unwrap_or_default()
        .iter()
        .map(|p| p.port_number)
        .collect::<Vec<_>>();

    let hook = WorkerFirmwareHook {
        job_id,
        host_link_layer_id: job.host_link_layer_id.clone(),
        store: store.clone(),
        substrate: substrate.clone(),
    };

    let result = run_firmware_pipeline(
        &settings,
        &url,
        &ip,
        &job.host_link_layer_id,
        &job.id.to_string(),
        &job.host_link_layer_id,
        vendor.as_deref(),
        &ports,
        &hook,
    )
    .await;

    match result {
        Ok(outcome) => {
            job.status = FirmwareStatus::Completed;
            job.firmware_path = Some(outcome.firmware_path.clone());
            job.firmware_hash = Some(outcome.firmware_hash.clone());
            job.firmware_size_bytes = Some(outcome.firmware_size_bytes);
            job.analyzer_log_dir = Some(outcome.analyzer_log_dir.clone());
            job.risk_report = Some(outcome.risk_report.clone());
            job.risk_score = outcome.risk_score;
            job.findings_count = Some(outcome.findings_count);
            job.critical_count = Some(outcome.critical_count);
            job.high_count = Some(outcome.high_count);
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_firmware_job(&job).await;

            let _ = store
                .update_firmware_fields(
                    &job.host_link_layer_id,
                    Some(&url),
                    Some(&outcome.firmware_path),
                    Some(&outcome.firmware_hash),
                    Some(&outcome.analyzer_log_dir),
                    Some(&outcome.risk_report),
                    outcome.risk_score,
                    Some(FirmwareStatus::Completed.as_str()),
                )
                .await;

            let payload = serde_json::json!({
                "type": "firmware_completed",
                "firmware_id": job_id,
                "risk_score": job.risk_score,
                "findings_count": job.findings_count,
            });
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Firmware,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
        Err(EngineError::Cancelled) => {
            job.status = FirmwareStatus::Cancelled;
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_firmware_job(&job).await;
            let _ = substrate.clear_cancel(JobKind::Firmware, &job_id.to_string()).await;
            let _ = store
                .update_firmware_fields(
                    &job.host_link_layer_id,
                    None,
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(FirmwareStatus::Cancelled.as_str()),
                )
                .await;

            let payload = serde_json::json!({"type": "firmware_cancelled", "firmware_id": job_id});
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Firmware,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
        Err(e) => {
            job.status = FirmwareStatus::Failed;
            job.error_message = Some(e.truncated_message());
            job.completed_at = Some(chrono::Utc::now());
            let _ = store.save_firmware_job(&job).await;
            let _ = store
                .update_firmware_fields(
                    &job.host_link_layer_id,
                    None,
                    None,
                    None,
                    None,
                    None,
                    None,
                    Some(FirmwareStatus::Failed.as_str()),
                )
                .await;

            let payload = serde_json::json!({
                "type": "firmware_failed",
                "firmware_id": job_id,
                "error": job.error_message,
            });
            let _ = soc_core::substrate::publish_json(
                substrate.as_ref(),
                JobKind::Firmware,
                &job_id.to_string(),
                &payload,
            )
            .await;
        }
    }
}
