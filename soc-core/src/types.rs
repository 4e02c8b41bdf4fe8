//! Core data model: scan jobs, firmware jobs, in-flight and persistent hosts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a scan target was expressed by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    SingleHost,
    Subnet,
    Range,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Append-only per-job audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanLogEntry {
    pub stage: u8,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Progress triple carried on a job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current_stage: u8,
    pub total_stages: u8,
    pub stage_label: Option<String>,
}

/// The durable scan job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: uuid::Uuid,
    pub target: String,
    pub scan_kind: ScanKind,
    pub status: ScanStatus,
    pub progress: Progress,
    pub hosts_discovered: u32,
    pub live_hosts: u32,
    pub open_ports_found: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Opaque operator-supplied label, passed through unmodified by the core.
    pub name: Option<String>,
    pub description: Option<String>,
}

impl ScanJob {
    pub fn new(id: uuid::Uuid, target: String, scan_kind: ScanKind) -> Self {
        Self {
            id,
            target,
            scan_kind,
            status: ScanStatus::Pending,
            progress: Progress {
                current_stage: 0,
                total_stages: 4,
                stage_label: None,
            },
            hosts_discovered: 0,
            live_hosts: 0,
            open_ports_found: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            name: None,
            description: None,
        }
    }
}

/// Per-port service fingerprint, collected during stage 4.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
    pub cpe: Option<String>,
    pub scripts: Option<String>,
}

/// A value object carried between scan stages. Lives only for one pipeline run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub ip: String,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub hostname: Option<String>,
    pub is_up: bool,
    pub response_time_ms: Option<u32>,
    pub open_ports: Vec<u16>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_accuracy: Option<u8>,
    pub os_cpe: Option<String>,
    pub services: BTreeMap<u16, ServiceInfo>,
    pub nmap_xml: Option<String>,
}

impl DiscoveredHost {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            is_up: true,
            ..Default::default()
        }
    }

    /// The surrogate link-layer identifier used when no MAC was resolved.
    ///
    /// `"00:00:" + first 8 characters of the IPv4 with dots replaced by colons`.
    pub fn surrogate_link_layer_id(ip: &str) -> String {
        let colonized: String = ip.replace('.', ":");
        let prefix: String = colonized.chars().take(8).collect();
        format!("00:00:{prefix}")
    }

    /// The link-layer id this host will be persisted under.
    pub fn link_layer_id(&self) -> String {
        self.mac
            .clone()
            .unwrap_or_else(|| Self::surrogate_link_layer_id(&self.ip))
    }
}

/// Persistent, MAC-keyed inventory row. Mirrors `DiscoveredHost` plus
/// firmware-pipeline fields and bookkeeping for the skip-unchanged optimization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InventoryHost {
    pub link_layer_id: String,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_accuracy: Option<u8>,
    pub os_cpe: Option<String>,
    pub is_up: bool,
    pub response_time_ms: Option<u32>,
    pub nmap_raw_xml: Option<String>,
    pub open_port_count: u32,
    pub last_scan_id: Option<uuid::Uuid>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    // Firmware fields, cached on the host row for quick dashboard reads.
    pub firmware_url: Option<String>,
    pub firmware_path: Option<String>,
    pub firmware_hash: Option<String>,
    pub analyzer_log_dir: Option<String>,
    pub risk_report: Option<String>,
    pub risk_score: Option<f32>,
    pub firmware_status: Option<String>,
}

/// A single persisted port row, replaced wholesale on each scan that touches
/// the owning host.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortRow {
    pub port_number: u16,
    pub protocol: String,
    pub state: String,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub service_product: Option<String>,
    pub service_extra_info: Option<String>,
    pub service_cpe: Option<String>,
    pub scripts_output: Option<String>,
    pub banner: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

/// Fields the scan worker may upsert onto an `InventoryHost`. `None` means
/// "leave unchanged" for the import path; the scan path always supplies
/// `Some` for every field it actually observed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostUpsert {
    pub link_layer_id: String,
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_accuracy: Option<u8>,
    pub os_cpe: Option<String>,
    pub is_up: Option<bool>,
    pub response_time_ms: Option<u32>,
    pub nmap_raw_xml: Option<String>,
    pub open_port_count: Option<u32>,
    pub last_scan_id: Option<uuid::Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareStatus {
    Pending,
    Downloading,
    Downloaded,
    EmbaQueued,
    EmbaRunning,
    EmbaDone,
    Triaging,
    Completed,
    Failed,
    Cancelled,
}

impl FirmwareStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FirmwareStatus::Completed | FirmwareStatus::Failed | FirmwareStatus::Cancelled
        )
    }

    /// The status string mirrored onto the host record's `firmware_status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            FirmwareStatus::Pending => "pending",
            FirmwareStatus::Downloading => "downloading",
            FirmwareStatus::Downloaded => "downloaded",
            FirmwareStatus::EmbaQueued => "emba_queued",
            FirmwareStatus::EmbaRunning => "emba_running",
            FirmwareStatus::EmbaDone => "emba_done",
            FirmwareStatus::Triaging => "triaging",
            FirmwareStatus::Completed => "completed",
            FirmwareStatus::Failed => "failed",
            FirmwareStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirmwareJob {
    pub id: uuid::Uuid,
    pub host_link_layer_id: String,
    pub firmware_url: Option<String>,
    pub status: FirmwareStatus,
    pub progress: Progress,

    // Stage A outputs
    pub firmware_path: Option<String>,
    pub firmware_hash: Option<String>,
    pub firmware_size_bytes: Option<u64>,

    // Stage B outputs
    pub analyzer_log_dir: Option<String>,

    // Stage C outputs
    pub risk_report: Option<String>,
    pub risk_score: Option<f32>,
    pub findings_count: Option<u32>,
    pub critical_count: Option<u32>,
    pub high_count: Option<u32>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl FirmwareJob {
    pub fn new(id: uuid::Uuid, host_link_layer_id: String, firmware_url: Option<String>) -> Self {
        Self {
            id,
            host_link_layer_id,
            firmware_url,
            status: FirmwareStatus::Pending,
            progress: Progress {
                current_stage: 0,
                total_stages: 3,
                stage_label: None,
            },
            firmware_path: None,
            firmware_hash: None,
            firmware_size_bytes: None,
            analyzer_log_dir: None,
            risk_report: None,
            risk_score: None,
            findings_count: None,
            critical_count: None,
            high_count: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }
}

/// What stage 4 needs to rehydrate a skip-unchanged host without a second
/// per-host store round trip: the host row plus its last known ports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PriorHostSnapshot {
    pub host: InventoryHost,
    pub ports: Vec<PortRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surrogate_link_layer_id_is_deterministic() {
        let a = DiscoveredHost::surrogate_link_layer_id("192.168.1.10");
        let b = DiscoveredHost::surrogate_link_layer_id("192.168.1.10");
        assert_eq!(a, b);
        assert!(a.starts_with("00:00:"));
    }

    #[test]
    fn surrogate_link_layer_id_matches_documented_rule() {
        // "192.168.1.10".replace('.', ':')[:8] == "192:168:"
        let id = DiscoveredHost::surrogate_link_layer_id("192.168.1.10");
        assert_eq!(id, "00:00:192:168:");
    }

    #[test]
    fn host_without_mac_uses_surrogate() {
        let h = DiscoveredHost::new("10.0.0.5");
        assert_eq!(
            h.link_layer_id(),
            DiscoveredHost::surrogate_link_layer_id("10.0.0.5")
        );
    }

    #[test]
    fn host_with_mac_uses_mac() {
        let mut h = DiscoveredHost::new("10.0.0.5");
        h.mac = Some("AA:BB:CC:DD:EE:01".to_string());
        assert_eq!(h.link_layer_id(), "AA:BB:CC:DD:EE:01");
    }
}
