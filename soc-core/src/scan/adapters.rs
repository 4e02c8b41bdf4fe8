//! Argument-vector construction and output parsing for the four scan tools.
//! Adapters are pure functions of (host record, config); they never mutate
//! shared state, and malformed tool output yields an empty result for that
//! host rather than a pipeline failure.

use std::collections::BTreeMap;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::config::Settings;
use crate::process_runner::find_binary;
use crate::types::{DiscoveredHost, ServiceInfo};

/// Estimate the number of addresses a target expression will touch, per
/// spec §4.3: CIDR → `max(num_addresses - 2, 1)`; a token containing `-`
/// (a range) → 256; anything else → 1.
pub fn estimate_host_count(target: &str) -> u32 {
    if let Some((_, prefix_str)) = target.split_once('/') {
        if let Ok(prefix) = prefix_str.trim().parse::<u32>() {
            if prefix <= 32 {
                let host_bits = 32 - prefix;
                // Saturate rather than overflow for prefix 0.
                let num_addresses: u64 = 1u64 << host_bits;
                let usable = num_addresses.saturating_sub(2).max(1);
                return usable.min(u32::MAX as u64) as u32;
            }
        }
    }
    if target.contains('-') {
        return 256;
    }
    1
}

/// The timeout/rate/hostgroup flags that scale with target size (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSweepParams {
    pub timeout_secs: u64,
    pub min_rate: u32,
    pub min_hostgroup: Option<u32>,
}

pub fn ping_sweep_params(host_count: u32) -> PingSweepParams {
    let timeout_secs = if host_count <= 1 {
        120
    } else if host_count <= 254 {
        180
    } else if host_count <= 510 {
        300
    } else if host_count <= 2046 {
        600
    } else {
        900
    };

    let min_rate = if host_count <= 64 { 100 } else { 300 };

    let min_hostgroup = if host_count > 512 {
        Some(128)
    } else if host_count > 128 {
        Some(64)
    } else {
        None
    };

    PingSweepParams {
        timeout_secs,
        min_rate,
        min_hostgroup,
    }
}

/// Build the stage-1 ping-sweep argument vector and its timeout, per the
/// newer, normative flag set documented in spec §4.3/§9.
pub fn build_ping_sweep_args(settings: &Settings, target: &str) -> (Vec<String>, Duration) {
    let nmap = find_binary("nmap", settings.nmap_path.as_deref());
    let params = ping_sweep_params(estimate_host_count(target));

    let mut argv = vec![
        "sudo".to_string(),
        nmap,
        "-sn".to_string(),
        "-PR".to_string(),
        "-PE".to_string(),
        "-T4".to_string(),
        "--min-rate".to_string(),
        params.min_rate.to_string(),
    ];
    if let Some(hg) = params.min_hostgroup {
        argv.push("--min-hostgroup".to_string());
        argv.push(hg.to_string());
    }
    argv.push("-oX".to_string());
    argv.push("-".to_string());
    argv.push(target.to_string());

    (argv, Duration::from_secs(params.timeout_secs))
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == name.as_bytes() {
            a.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}

/// Parse `nmap -sn -oX -` output: only `status=up` hosts are emitted.
/// Malformed XML yields an empty vec, not an error.
pub fn parse_ping_sweep_xml(xml: &str) -> Vec<DiscoveredHost> {
    let mut hosts = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut in_host = false;
    let mut is_up = false;
    let mut current: Option<DiscoveredHost> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name();
                let local = name.as_ref();
                match local {
                    b"host" => {
                        in_host = true;
                        is_up = false;
                        current = None;
                    }
                    b"status" if in_host => {
                        is_up = attr(e, "state").as_deref() == Some("up");
                        if is_up && current.is_none() {
                            current = Some(DiscoveredHost::new(""));
                        }
                    }
                    b"address" if in_host && is_up => {
                        let addrtype = attr(e, "addrtype");
                        let addr = attr(e, "addr");
                        if let Some(host) = current.as_mut() {
                            match addrtype.as_deref() {
                                Some("ipv4") => {
                                    if let Some(a) = addr {
                                        host.ip = a;
                                    }
                                }
                                Some("mac") => {
                                    host.mac = addr;
                                    host.vendor = attr(e, "vendor");
                                }
                                _ => {}
                            }
                        }
                    }
                    b"hostname" if in_host && is_up => {
                        if let Some(host) = current.as_mut() {
                            if host.hostname.is_none() {
                                host.hostname = attr(e, "name");
                            }
                        }
                    }
                    b"times" if in_host && is_up => {
                        if let Some(host) = current.as_mut() {
                            if let Some(srtt) = attr(e, "srtt").and_then(|s| s.parse::<u32>().ok()) {
                                host.response_time_ms = Some(srtt / 1000);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"host" => {
                in_host = false;
                if let Some(host) = current.take() {
                    if !host.ip.is_empty() {
                        hosts.push(host);
                    }
                }
            }
            Ok(_) => {}
            Err(_) => return Vec::new(),
        }
        buf.clear();
    }

    hosts
}

/// Stage 2, attempt 1: `arp-scan -I eth0 -q <ip>`, tab-separated
/// `ip\tmac\tvendor` lines.
pub fn parse_arp_scan_output(stdout: &str, ip: &str) -> Option<(String, Option<String>)> {
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 2 && parts[0].contains(ip) {
            let mac = parts[1].trim().to_string();
            let vendor = parts.get(2).map(|v| v.trim().to_string());
            return Some((mac, vendor));
        }
    }
    None
}

/// Stage 2, attempt 2 fallback: `nmap -sn -PR -oX -` against a single host,
/// reusing the ping-sweep parser and lifting the first MAC found.
pub fn parse_arp_nmap_fallback(xml: &str) -> Option<String> {
    let hosts = parse_ping_sweep_xml(xml);
    hosts.into_iter().find_map(|h| h.mac)
}

pub fn build_arp_scan_args(settings: &Settings, ip: &str) -> Vec<String> {
    let arp_scan = find_binary("arp-scan", settings.arp_scan_path.as_deref());
    vec![
        "sudo".to_string(),
        arp_scan,
        "-I".to_string(),
        "eth0".to_string(),
        "-q".to_string(),
        ip.to_string(),
    ]
}

pub fn build_arp_nmap_fallback_args(settings: &Settings, ip: &str) -> Vec<String> {
    let nmap = find_binary("nmap", settings.nmap_path.as_deref());
    vec![
        "sudo".to_string(),
        nmap,
        "-sn".to_string(),
        "-PR".to_string(),
        "-oX".to_string(),
        "-".to_string(),
        ip.to_string(),
    ]
}

/// Stage 3: `rustscan -a <ip> --top -b <batch> --ulimit 5000 --timeout <ms> -g`.
pub fn build_rustscan_args(settings: &Settings, ip: &str, timeout: Duration) -> Vec<String> {
    let rustscan = find_binary("rustscan", settings.rustscan_path.as_deref());
    let timeout_ms = (timeout.as_secs() * 1000).min(300_000);
    vec![
        "sudo".to_string(),
        rustscan,
        "-a".to_string(),
        ip.to_string(),
        "--top".to_string(),
        "-b".to_string(),
        settings.rustscan_batch_size.to_string(),
        "--ulimit".to_string(),
        "5000".to_string(),
        "--timeout".to_string(),
        timeout_ms.to_string(),
        "-g".to_string(),
    ]
}

static RUSTSCAN_PORTS_RE: &str = r"->\s*\[(.+?)\]";

/// Parse rustscan's greppable `ip -> [p1, p2, ...]` line. Duplicates collapse.
pub fn parse_rustscan_greppable(stdout: &str) -> Vec<u16> {
    let re = Regex::new(RUSTSCAN_PORTS_RE).expect("static regex is valid");
    let mut ports = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in stdout.lines() {
        if let Some(caps) = re.captures(line) {
            for tok in caps[1].split(',') {
                let tok = tok.trim();
                if !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(p) = tok.parse::<u16>() {
                        if seen.insert(p) {
                            ports.push(p);
                        }
                    }
                }
            }
        }
    }
    ports
}

/// Fallback: `nmap -sS --top-ports 1000 --min-rate 3000 -T4 -oX -`.
pub fn build_nmap_top_ports_args(settings: &Settings, ip: &str) -> Vec<String> {
    let nmap = find_binary("nmap", settings.nmap_path.as_deref());
    vec![
        "sudo".to_string(),
        nmap,
        "-sS".to_string(),
        "--top-ports".to_string(),
        "1000".to_string(),
        "--min-rate".to_string(),
        "3000".to_string(),
        "-T4".to_string(),
        "-oX".to_string(),
        "-".to_string(),
        ip.to_string(),
    ]
}

/// Parse only the open ports out of an nmap XML document (used both by the
/// stage-3 fallback and as a building block for stage 4's richer parse).
pub fn parse_nmap_open_ports(xml: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut cur_port: Option<u16> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"port" => {
                    cur_port = attr(e, "portid").and_then(|s| s.parse::<u16>().ok());
                }
                b"state" => {
                    if let Some(p) = cur_port {
                        if attr(e, "state").as_deref() == Some("open") {
                            ports.push(p);
                        }
                    }
                }
                _ => {}
            },
            Ok(_) => {}
            Err(_) => return Vec::new(),
        }
        buf.clear();
    }
    ports
}

/// Stage 4: `nmap -sS -sV -sC -O --osscan-guess -p <ports> -T4 --max-retries 2 -oX -`.
pub fn build_deep_scan_args(settings: &Settings, ip: &str, ports: &[u16]) -> Vec<String> {
    let nmap = find_binary("nmap", settings.nmap_path.as_deref());
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    let ports_str = sorted
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    vec![
        "sudo".to_string(),
        nmap,
        "-sS".to_string(),
        "-sV".to_string(),
        "-sC".to_string(),
        "-O".to_string(),
        "--osscan-guess".to_string(),
        "-p".to_string(),
        ports_str,
        "-T4".to_string(),
        "--max-retries".to_string(),
        "2".to_string(),
        "-oX".to_string(),
        "-".to_string(),
        ip.to_string(),
    ]
}

/// Result of parsing a deep-scan XML document: OS fields plus the per-port
/// service map. Applied onto the in-flight `DiscoveredHost` by the caller.
#[derive(Debug, Clone, Default)]
pub struct DeepScanResult {
    pub os_name: Option<String>,
    pub os_family: Option<String>,
    pub os_accuracy: Option<u8>,
    pub os_cpe: Option<String>,
    pub hostname: Option<String>,
    pub services: BTreeMap<u16, ServiceInfo>,
}

/// Parse a deep-scan XML document. The OS match is the *first* `osmatch`
/// element; its accuracy and `osclass` `osfamily`/`cpe` become the host's
/// OS fields. Malformed XML yields a default (empty) result.
pub fn parse_deep_scan_xml(xml: &str) -> DeepScanResult {
    let mut result = DeepScanResult::default();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut have_osmatch = false;
    let mut in_osclass = false;
    let mut in_cpe = false;
    let mut in_osmatch_section = false;

    let mut cur_port: Option<u16> = None;
    let mut cur_protocol = "tcp".to_string();
    let mut cur_state: Option<String> = None;
    let mut cur_service: Option<ServiceInfo> = None;
    let mut cur_scripts: Vec<String> = Vec::new();
    let mut in_cpe_service = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.name().as_ref() {
                    b"os" => {
                        in_osmatch_section = true;
                    }
                    b"osmatch" if in_osmatch_section && !have_osmatch => {
                        result.os_name = attr(e, "name");
                        result.os_accuracy = attr(e, "accuracy").and_then(|s| s.parse::<u8>().ok());
                        have_osmatch = true;
                    }
                    b"osclass" if have_osmatch => {
                        in_osclass = true;
                        if result.os_family.is_none() {
                            result.os_family = attr(e, "osfamily");
                        }
                    }
                    b"cpe" if in_osclass => {
                        in_cpe = true;
                    }
                    b"hostname" => {
                        if result.hostname.is_none() {
                            result.hostname = attr(e, "name");
                        }
                    }
                    b"port" => {
                        cur_port = attr(e, "portid").and_then(|s| s.parse::<u16>().ok());
                        cur_protocol = attr(e, "protocol").unwrap_or_else(|| "tcp".to_string());
                        cur_state = None;
                        cur_service = None;
                        cur_scripts.clear();
                    }
                    b"state" if cur_port.is_some() => {
                        cur_state = attr(e, "state");
                    }
                    b"service" if cur_port.is_some() => {
                        cur_service = Some(ServiceInfo {
                            port: cur_port.unwrap(),
                            protocol: cur_protocol.clone(),
                            state: cur_state.clone().unwrap_or_else(|| "unknown".to_string()),
                            name: attr(e, "name"),
                            product: attr(e, "product"),
                            version: attr(e, "version"),
                            extra_info: attr(e, "extrainfo"),
                            cpe: None,
                            scripts: None,
                        });
                        in_cpe_service = true;
                    }
                    b"cpe" if in_cpe_service => {
                        in_cpe = true;
                    }
                    b"script" if cur_port.is_some() => {
                        let id = attr(e, "id").unwrap_or_default();
                        let output = attr(e, "output").unwrap_or_default();
                        cur_scripts.push(format!("{id}: {output}"));
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if in_cpe => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if in_osclass {
                    if result.os_cpe.is_none() {
                        result.os_cpe = Some(text);
                    }
                } else if let Some(svc) = cur_service.as_mut() {
                    svc.cpe = Some(text);
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"cpe" => in_cpe = false,
                b"osclass" => in_osclass = false,
                b"os" => in_osmatch_section = false,
                b"service" => in_cpe_service = false,
                b"port" => {
                    if let Some(p) = cur_port.take() {
                        let mut svc = cur_service.take().unwrap_or(ServiceInfo {
                            port: p,
                            protocol: cur_protocol.clone(),
                            state: cur_state.clone().unwrap_or_else(|| "unknown".to_string()),
                            ..Default::default()
                        });
                        svc.port = p;
                        svc.state = cur_state.clone().unwrap_or(svc.state);
                        if !cur_scripts.is_empty() {
                            svc.scripts = Some(cur_scripts.join("\n"));
                        }
                        result.services.insert(p, svc);
                    }
                }
                _ => {}
            },
            Ok(_) => {}
            Err(_) => return DeepScanResult::default(),
        }
        buf.clear();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_host_count_cidr_subtracts_network_and_broadcast() {
        assert_eq!(estimate_host_count("192.168.1.0/24"), 254);
        assert_eq!(estimate_host_count("10.0.0.0/30"), 2);
        assert_eq!(estimate_host_count("10.0.0.0/32"), 1);
    }

    #[test]
    fn estimate_host_count_range_is_256() {
        assert_eq!(estimate_host_count("192.168.1.1-192.168.1.50"), 256);
    }

    #[test]
    fn estimate_host_count_single_host_is_one() {
        assert_eq!(estimate_host_count("192.168.1.50"), 1);
    }

    #[test]
    fn ping_sweep_params_scale_with_host_count() {
        let small = ping_sweep_params(1);
        assert_eq!(small.timeout_secs, 120);
        assert_eq!(small.min_hostgroup, None);

        let large = ping_sweep_params(600);
        assert_eq!(large.timeout_secs, 600);
        assert_eq!(large.min_hostgroup, Some(128));
    }

    const PING_SWEEP_XML: &str = r#"<?xml version="1.0"?>
<nmaprun>
<host><status state="up"/>
<address addr="192.168.1.10" addrtype="ipv4"/>
<address addr="AA:BB:CC:DD:EE:01" addrtype="mac" vendor="Acme Corp"/>
<hostname name="box1.lan"/>
<times srtt="5000"/>
</host>
<host><status state="down"/>
<address addr="192.168.1.11" addrtype="ipv4"/>
</host>
</nmaprun>"#;

    #[test]
    fn parse_ping_sweep_xml_emits_only_up_hosts() {
        let hosts = parse_ping_sweep_xml(PING_SWEEP_XML);
        assert_eq!(hosts.len(), 1);
        let h = &hosts[0];
        assert_eq!(h.ip, "192.168.1.10");
        assert_eq!(h.mac.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(h.vendor.as_deref(), Some("Acme Corp"));
        assert_eq!(h.hostname.as_deref(), Some("box1.lan"));
        assert_eq!(h.response_time_ms, Some(5));
    }

    #[test]
    fn parse_ping_sweep_xml_malformed_yields_empty() {
        assert!(parse_ping_sweep_xml("not xml at all").is_empty());
    }

    #[test]
    fn parse_arp_scan_output_finds_matching_line() {
        let out = "192.168.1.10\tAA:BB:CC:DD:EE:01\tAcme Corp\n192.168.1.11\t00:11:22:33:44:55\tOther\n";
        let (mac, vendor) = parse_arp_scan_output(out, "192.168.1.10").unwrap();
        assert_eq!(mac, "AA:BB:CC:DD:EE:01");
        assert_eq!(vendor.as_deref(), Some("Acme Corp"));
    }

    #[test]
    fn parse_arp_scan_output_no_match_is_none() {
        assert!(parse_arp_scan_output("192.168.1.99\tAA:BB\n", "192.168.1.10").is_none());
    }

    #[test]
    fn parse_rustscan_greppable_dedupes_and_parses() {
        let out = "192.168.1.10 -> [22,80,80,443]\n";
        assert_eq!(parse_rustscan_greppable(out), vec![22, 80, 443]);
    }

    #[test]
    fn parse_rustscan_greppable_no_match_is_empty() {
        assert!(parse_rustscan_greppable("garbage line").is_empty());
    }

    const NMAP_OPEN_PORTS_XML: &str = r#"<?xml version="1.0"?>
<nmaprun><host>
<port portid="22"><state state="open"/></port>
<port portid="23"><state state="closed"/></port>
<port portid="443"><state state="open"/></port>
</host></nmaprun>"#;

    #[test]
    fn parse_nmap_open_ports_skips_closed() {
        assert_eq!(parse_nmap_open_ports(NMAP_OPEN_PORTS_XML), vec![22, 443]);
    }

    const DEEP_SCAN_XML: &str = r#"<?xml version="1.0"?>
<nmaprun><host>
<hostname name="box1.lan"/>
<port protocol="tcp" portid="22">
<state state="open"/>
<service name="ssh" product="OpenSSH" version="8.9"><cpe>cpe:/a:openbsd:openssh:8.9</cpe></service>
<script id="ssh-hostkey" output="2048 aa:bb (RSA)"/>
</port>
<os>
<osmatch name="Linux 5.X" accuracy="97">
<osclass osfamily="Linux"><cpe>cpe:/o:linux:linux_kernel:5</cpe></osclass>
</osmatch>
</os>
</host></nmaprun>"#;

    #[test]
    fn parse_deep_scan_xml_extracts_os_and_services() {
        let result = parse_deep_scan_xml(DEEP_SCAN_XML);
        assert_eq!(result.os_name.as_deref(), Some("Linux 5.X"));
        assert_eq!(result.os_accuracy, Some(97));
        assert_eq!(result.os_family.as_deref(), Some("Linux"));
        assert_eq!(result.os_cpe.as_deref(), Some("cpe:/o:linux:linux_kernel:5"));
        assert_eq!(result.hostname.as_deref(), Some("box1.lan"));

        let svc = result.services.get(&22).unwrap();
        assert_eq!(svc.name.as_deref(), Some("ssh"));
        assert_eq!(svc.product.as_deref(), Some("OpenSSH"));
        assert_eq!(svc.cpe.as_deref(), Some("cpe:/a:openbsd:openssh:8.9"));
        assert!(svc.scripts.as_deref().unwrap().contains("ssh-hostkey"));
    }

    #[test]
    fn parse_deep_scan_xml_malformed_yields_default() {
        let result = parse_deep_scan_xml("<not><valid");
        assert!(result.os_name.is_none());
        assert!(result.services.is_empty());
    }

    #[test]
    fn build_deep_scan_args_sorts_ports() {
        let settings = Settings::default();
        let argv = build_deep_scan_args(&settings, "10.0.0.1", &[443, 22, 80]);
        let p_idx = argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(argv[p_idx + 1], "22,80,443");
    }
}
