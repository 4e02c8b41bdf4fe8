//! In-memory `InventoryStore`, used by tests and as the fallback backend
//! when `DATABASE_URL` is unset.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::InventoryStore;
use crate::types::{
    FirmwareJob, HostUpsert, InventoryHost, LogLevel, PortRow, PriorHostSnapshot, ScanJob,
    ScanLogEntry,
};

struct Inner {
    scan_jobs: HashMap<Uuid, ScanJob>,
    scan_logs: HashMap<Uuid, Vec<ScanLogEntry>>,
    firmware_jobs: HashMap<Uuid, FirmwareJob>,
    hosts: BTreeMap<String, InventoryHost>,
    ports: HashMap<String, Vec<PortRow>>,
}

/// In-memory implementation of `InventoryStore` for tests and the
/// no-`DATABASE_URL` fallback path.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                scan_jobs: HashMap::new(),
                scan_logs: HashMap::new(),
                firmware_jobs: HashMap::new(),
                hosts: BTreeMap::new(),
                ports: HashMap::new(),
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn save_scan_job(&self, job: &ScanJob) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.scan_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_scan_job(&self, id: Uuid) -> anyhow::Result<Option<ScanJob>> {
        let inner = self.inner.read().await;
        Ok(inner.scan_jobs.get(&id).cloned())
    }

    async fn append_scan_log(
        &self,
        job_id: Uuid,
        stage: u8,
        level: LogLevel,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.scan_logs.entry(job_id).or_default().push(ScanLogEntry {
            stage,
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn save_firmware_job(&self, job: &FirmwareJob) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.firmware_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_firmware_job(&self, id: Uuid) -> anyhow::Result<Option<FirmwareJob>> {
        let inner = self.inner.read().await;
        Ok(inner.firmware_jobs.get(&id).cloned())
    }

    async fn load_firmware_jobs_for_host(&self, link_layer_id: &str) -> anyhow::Result<Vec<FirmwareJob>> {
        let inner = self.inner.read().await;
        Ok(inner
            .firmware_jobs
            .values()
            .filter(|j| j.host_link_layer_id == link_layer_id)
            .cloned()
            .collect())
    }

    async fn load_prior_port_counts(&self) -> anyhow::Result<BTreeMap<String, u32>> {
        let inner = self.inner.read().await;
        Ok(inner
            .hosts
            .iter()
            .map(|(k, v)| (k.clone(), v.open_port_count))
            .collect())
    }

    async fn load_prior_hosts(&self) -> anyhow::Result<BTreeMap<String, PriorHostSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .hosts
            .iter()
            .map(|(k, host)| {
                let ports = inner.ports.get(k).cloned().unwrap_or_default();
                (
                    k.clone(),
                    PriorHostSnapshot {
                        host: host.clone(),
                        ports,
                    },
                )
            })
            .collect())
    }

    async fn load_host(&self, link_layer_id: &str) -> anyhow::Result<Option<InventoryHost>> {
        let inner = self.inner.read().await;
        Ok(inner.hosts.get(link_layer_id).cloned())
    }

    async fn upsert_host(&self, fields: &HostUpsert) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let entry = inner
            .hosts
            .entry(fields.link_layer_id.clone())
            .or_insert_with(|| InventoryHost {
                link_layer_id: fields.link_layer_id.clone(),
                discovered_at: now,
                ..Default::default()
            });

        if let Some(v) = &fields.ip_address {
            entry.ip_address = v.clone();
        }
        if fields.hostname.is_some() {
            entry.hostname = fields.hostname.clone();
        }
        if fields.vendor.is_some() {
            entry.vendor = fields.vendor.clone();
        }
        if fields.os_name.is_some() {
            entry.os_name = fields.os_name.clone();
        }
        if fields.os_family.is_some() {
            entry.os_family = fields.os_family.clone();
        }
        if fields.os_accuracy.is_some() {
            entry.os_accuracy = fields.os_accuracy;
        }
        if fields.os_cpe.is_some() {
            entry.os_cpe = fields.os_cpe.clone();
        }
        if let Some(v) = fields.is_up {
            entry.is_up = v;
        }
        if fields.response_time_ms.is_some() {
            entry.response_time_ms = fields.response_time_ms;
        }
        if fields.nmap_raw_xml.is_some() {
            entry.nmap_raw_xml = fields.nmap_raw_xml.clone();
        }
        if let Some(v) = fields.open_port_count {
            entry.open_port_count = v;
        }
        if fields.last_scan_id.is_some() {
            entry.last_scan_id = fields.last_scan_id;
        }
        entry.last_seen = now;
        Ok(())
    }

    async fn replace_ports(&self, link_layer_id: &str, ports: &[PortRow]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.ports.insert(link_layer_id.to_string(), ports.to_vec());
        Ok(())
    }

    async fn load_ports(&self, link_layer_id: &str) -> anyhow::Result<Vec<PortRow>> {
        let inner = self.inner.read().await;
        Ok(inner.ports.get(link_layer_id).cloned().unwrap_or_default())
    }

    async fn update_firmware_fields(
        &self,
        link_layer_id: &str,
        firmware_url: Option<&str>,
        firmware_path: Option<&str>,
        firmware_hash: Option<&str>,
        analyzer_log_dir: Option<&str>,
        risk_report: Option<&str>,
        risk_score: Option<f32>,
        firmware_status: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .hosts
            .entry(link_layer_id.to_string())
            .or_insert_with(|| InventoryHost {
                link_layer_id: link_layer_id.to_string(),
                discovered_at: Utc::now(),
                ..Default::default()
            });
        if let Some(v) = firmware_url {
            entry.firmware_url = Some(v.to_string());
        }
        if let Some(v) = firmware_path {
            entry.firmware_path = Some(v.to_string());
        }
        if let Some(v) = firmware_hash {
            entry.firmware_hash = Some(v.to_string());
        }
        if let Some(v) = analyzer_log_dir {
            entry.analyzer_log_dir = Some(v.to_string());
        }
        if let Some(v) = risk_report {
            entry.risk_report = Some(v.to_string());
        }
        if risk_score.is_some() {
            entry.risk_score = risk_score;
        }
        if let Some(v) = firmware_status {
            entry.firmware_status = Some(v.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_host_preserves_unset_fields_on_import() {
        let store = MemoryStore::new();
        store
            .upsert_host(&HostUpsert {
                link_layer_id: "aa:bb:cc:dd:ee:ff".to_string(),
                ip_address: Some("10.0.0.5".to_string()),
                hostname: Some("box1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Import-style upsert with hostname omitted must not clobber it.
        store
            .upsert_host(&HostUpsert {
                link_layer_id: "aa:bb:cc:dd:ee:ff".to_string(),
                vendor: Some("Acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let host = store.load_host("aa:bb:cc:dd:ee:ff").await.unwrap().unwrap();
        assert_eq!(host.hostname.as_deref(), Some("box1"));
        assert_eq!(host.vendor.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn replace_ports_overwrites_prior_set() {
        let store = MemoryStore::new();
        let ports = vec![PortRow {
            port_number: 22,
            protocol: "tcp".to_string(),
            state: "open".to_string(),
            discovered_at: Utc::now(),
            ..Default::default()
        }];
        store.replace_ports("aa:bb:cc:dd:ee:ff", &ports).await.unwrap();
        assert_eq!(store.load_ports("aa:bb:cc:dd:ee:ff").await.unwrap().len(), 1);
        store.replace_ports("aa:bb:cc:dd:ee:ff", &[]).await.unwrap();
        assert_eq!(store.load_ports("aa:bb:cc:dd:ee:ff").await.unwrap().len(), 0);
    }
}
