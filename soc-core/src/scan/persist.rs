//! Translates pipeline output (`DiscoveredHost`s) into `InventoryStore`
//! upserts. Split out from the worker loop so it can be exercised directly
//! by integration tests without a real scheduler or external tools.

use uuid::Uuid;

use crate::store::InventoryStore;
use crate::types::{DiscoveredHost, HostUpsert, PortRow};

#[derive(Debug, Clone, Copy, Default)]
pub struct PersistSummary {
    pub hosts_discovered: u32,
    pub live_hosts: u32,
    pub open_ports_found: u32,
}

/// Upsert every discovered host and replace its port set. Returns the
/// counters a completed scan job records.
pub async fn persist_scan_results(
    store: &dyn InventoryStore,
    scan_job_id: Uuid,
    hosts: &[DiscoveredHost],
) -> anyhow::Result<PersistSummary> {
    let mut summary = PersistSummary {
        hosts_discovered: hosts.len() as u32,
        ..Default::default()
    };

    for host in hosts {
        if host.is_up {
            summary.live_hosts += 1;
        }
        summary.open_ports_found += host.open_ports.len() as u32;

        let link_layer_id = host.link_layer_id();
        let upsert = HostUpsert {
            link_layer_id: link_layer_id.clone(),
            ip_address: Some(host.ip.clone()),
            hostname: host.hostname.clone(),
            vendor: host.vendor.clone(),
            os_name: host.os_name.clone(),
            os_family: host.os_family.clone(),
            os_accuracy: host.os_accuracy,
            os_cpe: host.os_cpe.clone(),
            is_up: Some(host.is_up),
            response_time_ms: host.response_time_ms,
            nmap_raw_xml: host.nmap_xml.clone(),
            open_port_count: Some(host.open_ports.len() as u32),
            last_scan_id: Some(scan_job_id),
        };
        store.upsert_host(&upsert).await?;

        let ports: Vec<PortRow> = host
            .open_ports
            .iter()
            .map(|p| {
                let svc = host.services.get(p);
                PortRow {
                    port_number: *p,
                    protocol: svc.map(|s| s.protocol.clone()).unwrap_or_else(|| "tcp".to_string()),
                    state: "open".to_string(),
                    service_name: svc.and_then(|s| s.name.clone()),
                    service_version: svc.and_then(|s| s.version.clone()),
                    service_product: svc.and_then(|s| s.product.clone()),
                    service_extra_info: svc.and_then(|s| s.extra_info.clone()),
                    service_cpe: svc.and_then(|s| s.cpe.clone()),
                    scripts_output: svc.and_then(|s| s.scripts.clone()),
                    banner: None,
                    discovered_at: chrono::Utc::now(),
                }
            })
            .collect();
        store.replace_ports(&link_layer_id, &ports).await?;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    #[tokio::test]
    async fn persists_host_and_ports_and_counts_correctly() {
        let store = MemoryStore::new();
        let mut host = DiscoveredHost::new("10.0.0.5");
        host.mac = Some("aa:bb:cc:dd:ee:ff".to_string());
        host.open_ports = vec![22, 80];

        let summary = persist_scan_results(&store, Uuid::new_v4(), &[host]).await.unwrap();
        assert_eq!(summary.hosts_discovered, 1);
        assert_eq!(summary.live_hosts, 1);
        assert_eq!(summary.open_ports_found, 2);

        let loaded = store.load_host("aa:bb:cc:dd:ee:ff").await.unwrap().unwrap();
        assert_eq!(loaded.open_port_count, 2);
        assert_eq!(store.load_ports("aa:bb:cc:dd:ee:ff").await.unwrap().len(), 2);
    }
}
