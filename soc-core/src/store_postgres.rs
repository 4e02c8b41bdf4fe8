//! PostgreSQL-backed `InventoryStore`, gated behind the `postgres` feature.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::store::InventoryStore;
use crate::types::{
    FirmwareJob, FirmwareStatus, HostUpsert, InventoryHost, LogLevel, PortRow, PriorHostSnapshot,
    Progress, ScanJob, ScanKind, ScanStatus,
};

pub struct PostgresInventoryStore {
    pool: sqlx::PgPool,
}

impl PostgresInventoryStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run soc-core migrations")?;
        Ok(())
    }
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn save_scan_job(&self, job: &ScanJob) -> Result<()> {
        let scan_kind = serde_json::to_value(job.scan_kind)?;
        let status = serde_json::to_value(job.status)?;
        let progress = serde_json::to_value(&job.progress)?;

        sqlx::query(
            r#"
            INSERT INTO scan_jobs (
                id, target, scan_kind, status, progress, hosts_discovered,
                live_hosts, open_ports_found, created_at, started_at,
                completed_at, error_message, name, description
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                hosts_discovered = EXCLUDED.hosts_discovered,
                live_hosts = EXCLUDED.live_hosts,
                open_ports_found = EXCLUDED.open_ports_found,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(job.id)
        .bind(&job.target)
        .bind(&scan_kind)
        .bind(&status)
        .bind(&progress)
        .bind(job.hosts_discovered as i64)
        .bind(job.live_hosts as i64)
        .bind(job.open_ports_found as i64)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(&job.name)
        .bind(&job.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_scan_job(&self, id: Uuid) -> Result<Option<ScanJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, target, scan_kind, status, progress, hosts_discovered,
                   live_hosts, open_ports_found, created_at, started_at,
                   completed_at, error_message, name, description
            FROM scan_jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let scan_kind: ScanKind = serde_json::from_value(row.try_get("scan_kind")?)?;
        let status: ScanStatus = serde_json::from_value(row.try_get("status")?)?;
        let progress: Progress = serde_json::from_value(row.try_get("progress")?)?;

        Ok(Some(ScanJob {
            id: row.try_get("id")?,
            target: row.try_get("target")?,
            scan_kind,
            status,
            progress,
            hosts_discovered: row.try_get::<i64, _>("hosts_discovered")? as u32,
            live_hosts: row.try_get::<i64, _>("live_hosts")? as u32,
            open_ports_found: row.try_get::<i64, _>("open_ports_found")? as u32,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
        }))
    }

    async fn append_scan_log(
        &self,
        job_id: Uuid,
        stage: u8,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_logs (scan_job_id, stage, level, message, created_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(job_id)
        .bind(stage as i16)
        .bind(log_level_str(level))
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_firmware_job(&self, job: &FirmwareJob) -> Result<()> {
        let status = serde_json::to_value(job.status)?;
        let progress = serde_json::to_value(&job.progress)?;

        sqlx::query(
            r#"
            INSERT INTO firmware_jobs (
                id, host_link_layer_id, firmware_url, status, progress,
                firmware_path, firmware_hash, firmware_size_bytes,
                analyzer_log_dir, risk_report, risk_score, findings_count,
                critical_count, high_count, created_at, started_at,
                completed_at, error_message
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                firmware_path = EXCLUDED.firmware_path,
                firmware_hash = EXCLUDED.firmware_hash,
                firmware_size_bytes = EXCLUDED.firmware_size_bytes,
                analyzer_log_dir = EXCLUDED.analyzer_log_dir,
                risk_report = EXCLUDED.risk_report,
                risk_score = EXCLUDED.risk_score,
                findings_count = EXCLUDED.findings_count,
                critical_count = EXCLUDED.critical_count,
                high_count = EXCLUDED.high_count,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message
            "#,
        )
        .bind(job.id)
        .bind(&job.host_link_layer_id)
        .bind(&job.firmware_url)
        .bind(&status)
        .bind(&progress)
        .bind(&job.firmware_path)
        .bind(&job.firmware_hash)
        .bind(job.firmware_size_bytes.map(|v| v as i64))
        .bind(&job.analyzer_log_dir)
        .bind(&job.risk_report)
        .bind(job.risk_score)
        .bind(job.findings_count.map(|v| v as i64))
        .bind(job.critical_count.map(|v| v as i64))
        .bind(job.high_count.map(|v| v as i64))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_firmware_job(&self, id: Uuid) -> Result<Option<FirmwareJob>> {
        let row = sqlx::query(
            r#"
            SELECT id, host_link_layer_id, firmware_url, status, progress,
                   firmware_path, firmware_hash, firmware_size_bytes,
                   analyzer_log_dir, risk_report, risk_score, findings_count,
                   critical_count, high_count, created_at, started_at,
                   completed_at, error_message
            FROM firmware_jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: FirmwareStatus = serde_json::from_value(row.try_get("status")?)?;
        let progress: Progress = serde_json::from_value(row.try_get("progress")?)?;

        Ok(Some(FirmwareJob {
            id: row.try_get("id")?,
            host_link_layer_id: row.try_get("host_link_layer_id")?,
            firmware_url: row.try_get("firmware_url")?,
            status,
            progress,
            firmware_path: row.try_get("firmware_path")?,
            firmware_hash: row.try_get("firmware_hash")?,
            firmware_size_bytes: row
                .try_get::<Option<i64>, _>("firmware_size_bytes")?
                .map(|v| v as u64),
            analyzer_log_dir: row.try_get("analyzer_log_dir")?,
            risk_report: row.try_get("risk_report")?,
            risk_score: row.try_get("risk_score")?,
            findings_count: row
                .try_get::<Option<i64>, _>("findings_count")?
                .map(|v| v as u32),
            critical_count: row
                .try_get::<Option<i64>, _>("critical_count")?
                .map(|v| v as u32),
            high_count: row.try_get::<Option<i64>, _>("high_count")?.map(|v| v as u32),
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        }))
    }

    async fn load_firmware_jobs_for_host(&self, link_layer_id: &str) -> Result<Vec<FirmwareJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM firmware_jobs WHERE host_link_layer_id = $1 ORDER BY created_at DESC
            "#,
        )
        .bind(link_layer_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            if let Some(job) = self.load_firmware_job(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn load_prior_port_counts(&self) -> Result<BTreeMap<String, u32>> {
        let rows = sqlx::query("SELECT link_layer_id, open_port_count FROM inventory_hosts")
            .fetch_all(&self.pool)
            .await?;
        let mut map = BTreeMap::new();
        for row in rows {
            let id: String = row.try_get("link_layer_id")?;
            let count: i64 = row.try_get("open_port_count")?;
            map.insert(id, count as u32);
        }
        Ok(map)
    }

    async fn load_prior_hosts(&self) -> Result<BTreeMap<String, PriorHostSnapshot>> {
        let rows = sqlx::query("SELECT link_layer_id FROM inventory_hosts")
            .fetch_all(&self.pool)
            .await?;
        let mut map = BTreeMap::new();
        for row in rows {
            let id: String = row.try_get("link_layer_id")?;
            if let Some(host) = self.load_host(&id).await? {
                let ports = self.load_ports(&id).await?;
                map.insert(id, PriorHostSnapshot { host, ports });
            }
        }
        Ok(map)
    }

    async fn load_host(&self, link_layer_id: &str) -> Result<Option<InventoryHost>> {
        let row = sqlx::query(
            r#"
            SELECT link_layer_id, ip_address, hostname, vendor, os_name, os_family,
                   os_accuracy, os_cpe, is_up, response_time_ms, nmap_raw_xml,
                   open_port_count, last_scan_id, discovered_at, last_seen,
                   firmware_url, firmware_path, firmware_hash, analyzer_log_dir,
                   risk_report, risk_score, firmware_status
            FROM inventory_hosts WHERE link_layer_id = $1
            "#,
        )
        .bind(link_layer_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(InventoryHost {
            link_layer_id: row.try_get("link_layer_id")?,
            ip_address: row.try_get("ip_address")?,
            hostname: row.try_get("hostname")?,
            vendor: row.try_get("vendor")?,
            os_name: row.try_get("os_name")?,
            os_family: row.try_get("os_family")?,
            os_accuracy: row
                .try_get::<Option<i16>, _>("os_accuracy")?
                .map(|v| v as u8),
            os_cpe: row.try_get("os_cpe")?,
            is_up: row.try_get("is_up")?,
            response_time_ms: row
                .try_get::<Option<i32>, _>("response_time_ms")?
                .map(|v| v as u32),
            nmap_raw_xml: row.try_get("nmap_raw_xml")?,
            open_port_count: row.try_get::<i64, _>("open_port_count")? as u32,
            last_scan_id: row.try_get("last_scan_id")?,
            discovered_at: row.try_get("discovered_at")?,
            last_seen: row.try_get("last_seen")?,
            firmware_url: row.try_get("firmware_url")?,
            firmware_path: row.try_get("firmware_path")?,
            firmware_hash: row.try_get("firmware_hash")?,
            analyzer_log_dir: row.try_get("analyzer_log_dir")?,
            risk_report: row.try_get("risk_report")?,
            risk_score: row.try_get("risk_score")?,
            firmware_status: row.try_get("firmware_status")?,
        }))
    }

    async fn upsert_host(&self, fields: &HostUpsert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_hosts (
                link_layer_id, ip_address, hostname, vendor, os_name, os_family,
                os_accuracy, os_cpe, is_up, response_time_ms, nmap_raw_xml,
                open_port_count, last_scan_id, discovered_at, last_seen
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13, now(), now())
            ON CONFLICT (link_layer_id) DO UPDATE SET
                ip_address = COALESCE(EXCLUDED.ip_address, inventory_hosts.ip_address),
                hostname = COALESCE(EXCLUDED.hostname, inventory_hosts.hostname),
                vendor = COALESCE(EXCLUDED.vendor, inventory_hosts.vendor),
                os_name = COALESCE(EXCLUDED.os_name, inventory_hosts.os_name),
                os_family = COALESCE(EXCLUDED.os_family, inventory_hosts.os_family),
                os_accuracy = COALESCE(EXCLUDED.os_accuracy, inventory_hosts.os_accuracy),
                os_cpe = COALESCE(EXCLUDED.os_cpe, inventory_hosts.os_cpe),
                is_up = COALESCE(EXCLUDED.is_up, inventory_hosts.is_up),
                response_time_ms = COALESCE(EXCLUDED.response_time_ms, inventory_hosts.response_time_ms),
                nmap_raw_xml = COALESCE(EXCLUDED.nmap_raw_xml, inventory_hosts.nmap_raw_xml),
                open_port_count = COALESCE(EXCLUDED.open_port_count, inventory_hosts.open_port_count),
                last_scan_id = COALESCE(EXCLUDED.last_scan_id, inventory_hosts.last_scan_id),
                last_seen = now()
            "#,
        )
        .bind(&fields.link_layer_id)
        .bind(&fields.ip_address)
        .bind(&fields.hostname)
        .bind(&fields.vendor)
        .bind(&fields.os_name)
        .bind(&fields.os_family)
        .bind(fields.os_accuracy.map(|v| v as i16))
        .bind(&fields.os_cpe)
        .bind(fields.is_up)
        .bind(fields.response_time_ms.map(|v| v as i32))
        .bind(&fields.nmap_raw_xml)
        .bind(fields.open_port_count.map(|v| v as i64))
        .bind(fields.last_scan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_ports(&self, link_layer_id: &str, ports: &[PortRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM inventory_ports WHERE link_layer_id = $1")
            .bind(link_layer_id)
            .execute(&mut *tx)
            .await?;
        for port in ports {
            sqlx::query(
                r#"
                INSERT INTO inventory_ports (
                    link_layer_id, port_number, protocol, state, service_name,
                    service_version, service_product, service_extra_info,
                    service_cpe, scripts_output, banner, discovered_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                "#,
            )
            .bind(link_layer_id)
            .bind(port.port_number as i32)
            .bind(&port.protocol)
            .bind(&port.state)
            .bind(&port.service_name)
            .bind(&port.service_version)
            .bind(&port.service_product)
            .bind(&port.service_extra_info)
            .bind(&port.service_cpe)
            .bind(&port.scripts_output)
            .bind(&port.banner)
            .bind(port.discovered_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_ports(&self, link_layer_id: &str) -> Result<Vec<PortRow>> {
        let rows = sqlx::query(
            r#"
            SELECT port_number, protocol, state, service_name, service_version,
                   service_product, service_extra_info, service_cpe,
                   scripts_output, banner, discovered_at
            FROM inventory_ports WHERE link_layer_id = $1
            "#,
        )
        .bind(link_layer_id)
        .fetch_all(&self.pool)
        .await?;

        let mut ports = Vec::with_capacity(rows.len());
        for row in rows {
            ports.push(PortRow {
                port_number: row.try_get::<i32, _>("port_number")? as u16,
                protocol: row.try_get("protocol")?,
                state: row.try_get("state")?,
                service_name: row.try_get("service_name")?,
                service_version: row.try_get("service_version")?,
                service_product: row.try_get("service_product")?,
                service_extra_info: row.try_get("service_extra_info")?,
                service_cpe: row.try_get("service_cpe")?,
                scripts_output: row.try_get("scripts_output")?,
                banner: row.try_get("banner")?,
                discovered_at: row.try_get("discovered_at")?,
            });
        }
        Ok(ports)
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
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inventory_hosts SET
                firmware_url = COALESCE($2, firmware_url),
                firmware_path = COALESCE($3, firmware_path),
                firmware_hash = COALESCE($4, firmware_hash),
                analyzer_log_dir = COALESCE($5, analyzer_log_dir),
                risk_report = COALESCE($6, risk_report),
                risk_score = COALESCE($7, risk_score),
                firmware_status = COALESCE($8, firmware_status)
            WHERE link_layer_id = $1
            "#,
        )
        .bind(link_layer_id)
        .bind(firmware_url)
        .bind(firmware_path)
        .bind(firmware_hash)
        .bind(analyzer_log_dir)
        .bind(risk_report)
        .bind(risk_score)
        .bind(firmware_status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
