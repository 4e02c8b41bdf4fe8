//! Inventory persistence trait, organized by concern, in the same broad
//! single-trait shape as the teacher's process store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    FirmwareJob, HostUpsert, InventoryHost, LogLevel, PortRow, PriorHostSnapshot, ScanJob,
};

#[async_trait]
pub trait InventoryStore: Send + Sync {
    // -- Scan jobs --

    async fn save_scan_job(&self, job: &ScanJob) -> anyhow::Result<()>;
    async fn load_scan_job(&self, id: Uuid) -> anyhow::Result<Option<ScanJob>>;
    async fn append_scan_log(
        &self,
        job_id: Uuid,
        stage: u8,
        level: LogLevel,
        message: &str,
    ) -> anyhow::Result<()>;

    // -- Firmware jobs --

    async fn save_firmware_job(&self, job: &FirmwareJob) -> anyhow::Result<()>;
    async fn load_firmware_job(&self, id: Uuid) -> anyhow::Result<Option<FirmwareJob>>;
    async fn load_firmware_jobs_for_host(&self, link_layer_id: &str) -> anyhow::Result<Vec<FirmwareJob>>;

    // -- Hosts --

    /// One round trip snapshot of every host's cached open-port count,
    /// taken once per scan job at dispatch.
    async fn load_prior_port_counts(&self) -> anyhow::Result<BTreeMap<String, u32>>;

    /// Supplements `load_prior_port_counts` with enough of the prior row
    /// (OS fields, ports) to rehydrate a stage-4-skipped host without a
    /// second per-host round trip.
    async fn load_prior_hosts(&self) -> anyhow::Result<BTreeMap<String, PriorHostSnapshot>>;

    async fn load_host(&self, link_layer_id: &str) -> anyhow::Result<Option<InventoryHost>>;

    /// Insert or update by link-layer id. `None` fields in `fields` leave
    /// the existing column unchanged (import semantics); callers that want
    /// scan-path clobber semantics populate every observed field as `Some`.
    async fn upsert_host(&self, fields: &HostUpsert) -> anyhow::Result<()>;

    /// Delete then insert the port set for a host, atomically with respect
    /// to other transactions on the same host.
    async fn replace_ports(&self, link_layer_id: &str, ports: &[PortRow]) -> anyhow::Result<()>;

    async fn load_ports(&self, link_layer_id: &str) -> anyhow::Result<Vec<PortRow>>;

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
    ) -> anyhow::Result<()>;
}
