//! Adapter from the recon agents' structured scan output to observation
//! batches.
//!
//! ```json
//! { "command": "nmap -sV api.example.com",
//!   "result": {
//!     "host": "api.example.com", "ip": "10.0.0.5",
//!     "ports": [ { "port": 443, "protocol": "tcp",
//!                  "service": { "name": "nginx", "version": "1.25" },
//!                  "vulnerabilities": [ { "cve_id": "CVE-2024-1234", "description": "...",
//!                                         "cvss": 7.5, "is_vulnerable": true } ] } ] } }
//! ```
//!
//! The result maps onto the bundled schema as
//! Host -[RESOLVES_TO]-> IPAddress -[HOSTS]-> Port -[RUNS]-> Service
//! -[HAS_VULNERABILITY]-> Vulnerability, every edge stamped with `last_seen`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use threatmap_core::types::PropertyMap;

use crate::observation::{EntityRef, ObservationBatch};

/// Version recorded for services whose version the scanner could not tell.
const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
pub struct ScanReport {
    /// The tool invocation that produced the result.
    #[serde(default)]
    pub command: String,
    pub result: ScanResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ports: Vec<ScanPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanPort {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub service: ScanService,
    #[serde(default)]
    pub vulnerabilities: Vec<ScanVulnerability>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanService {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanVulnerability {
    #[serde(default)]
    pub cve_id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub cvss: Option<f64>,
    #[serde(default)]
    pub is_vulnerable: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl ScanReport {
    /// Build the batch for this report. `source` names the producing agent;
    /// when empty the tool command is used instead.
    pub fn to_batch(&self, source: &str, observed_at: DateTime<Utc>) -> ObservationBatch {
        let source = if source.is_empty() && !self.command.is_empty() {
            self.command.as_str()
        } else {
            source
        };
        self.result.to_batch(source, observed_at)
    }
}

impl ScanResult {
    pub fn to_batch(&self, source: &str, observed_at: DateTime<Utc>) -> ObservationBatch {
        let seen = props(json!({ "last_seen": observed_at.to_rfc3339_opts(SecondsFormat::Secs, true) }));
        let host = self.host.trim();
        let ip = self.ip.trim();

        let mut batch = ObservationBatch::new(source);
        if !host.is_empty() {
            batch = batch.entity("host", "Host", props(json!({ "name": host })));
        }
        if ip.is_empty() {
            if !self.ports.is_empty() {
                tracing::warn!(host, ports = self.ports.len(), "Scan result has no IP, ports dropped");
            }
            return batch;
        }

        batch = batch.entity("ip", "IPAddress", props(json!({ "address": ip })));
        if !host.is_empty() {
            batch = batch.relationship("RESOLVES_TO", EntityRef::alias("host"), EntityRef::alias("ip"), seen.clone());
        }

        for port in &self.merged_ports() {
            let port_alias = format!("port:{}/{}", port.port, port.protocol);
            batch = batch
                .entity(
                    &port_alias,
                    "Port",
                    props(json!({
                        "number": port.port,
                        "protocol": port.protocol,
                        "ip_address": ip,
                    })),
                )
                .relationship("HOSTS", EntityRef::alias("ip"), EntityRef::alias(&port_alias), seen.clone());

            let service_name = port.service.name.trim();
            if service_name.is_empty() {
                continue;
            }
            let version = match port.service.version.trim() {
                "" => UNKNOWN_VERSION,
                v => v,
            };
            let service_alias = format!("service:{}/{}", port.port, port.protocol);
            batch = batch
                .entity(&service_alias, "Service", props(json!({ "name": service_name, "version": version })))
                .relationship("RUNS", EntityRef::alias(&port_alias), EntityRef::alias(&service_alias), seen.clone());

            for (i, vuln) in port.vulnerabilities.iter().enumerate() {
                let vuln_alias = format!("vuln:{}/{}:{i}", port.port, port.protocol);
                let mut vuln_props = props(json!({
                    "description": vuln.description,
                    "is_vulnerable": vuln.is_vulnerable,
                }));
                if let Some(cvss) = vuln.cvss {
                    vuln_props.insert("cvss".to_string(), json!(cvss));
                }
                if let Some(cve) = vuln.cve_id.as_deref().filter(|c| !c.trim().is_empty()) {
                    vuln_props.insert("cve_id".to_string(), json!(cve));
                }
                batch = batch.entity(&vuln_alias, "Vulnerability", vuln_props).relationship(
                    "HAS_VULNERABILITY",
                    EntityRef::alias(&service_alias),
                    EntityRef::alias(&vuln_alias),
                    seen.clone(),
                );
            }
        }
        batch
    }

    /// Ports with repeated (port, protocol) entries folded into the first:
    /// the first named service wins and vulnerabilities accumulate.
    fn merged_ports(&self) -> Vec<ScanPort> {
        let mut merged: Vec<ScanPort> = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            let existing = merged
                .iter_mut()
                .find(|p| p.port == port.port && p.protocol == port.protocol);
            match existing {
                Some(first) => {
                    tracing::debug!(port = port.port, protocol = %port.protocol, "Merging repeated port entry");
                    if first.service.name.trim().is_empty() {
                        first.service = port.service.clone();
                    } else if first.service.version.trim().is_empty() && first.service.name == port.service.name {
                        first.service.version = port.service.version.clone();
                    }
                    for vuln in &port.vulnerabilities {
                        if !first.vulnerabilities.iter().any(|v| v.description == vuln.description) {
                            first.vulnerabilities.push(vuln.clone());
                        }
                    }
                }
                None => merged.push(port.clone()),
            }
        }
        merged
    }
}

fn props(value: Value) -> PropertyMap {
    match value {
        Value::Object(map) => map,
        _ => PropertyMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn report() -> ScanReport {
        serde_json::from_value(json!({
            "command": "nmap -sV api.example.com",
            "result": {
                "host": "api.example.com",
                "ip": "10.0.0.5",
                "ports": [
                    {
                        "port": 443,
                        "protocol": "tcp",
                        "service": { "name": "nginx", "version": "" },
                        "vulnerabilities": [
                            { "cve_id": "CVE-2024-1234", "description": "heap overflow", "cvss": 7.5, "is_vulnerable": true },
                            { "description": "weak ciphers", "is_vulnerable": false }
                        ]
                    },
                    { "port": 22 }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn maps_scan_result_onto_schema_types() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let batch = report().to_batch("", at);

        assert_eq!(batch.source, "nmap -sV api.example.com");
        let types: Vec<&str> = batch.entities.iter().map(|e| e.node_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["Host", "IPAddress", "Port", "Service", "Vulnerability", "Vulnerability", "Port"]
        );
        let labels: Vec<&str> = batch.relationships.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["RESOLVES_TO", "HOSTS", "RUNS", "HAS_VULNERABILITY", "HAS_VULNERABILITY", "HOSTS"]
        );
        assert!(batch
            .relationships
            .iter()
            .all(|r| r.properties.get("last_seen") == Some(&json!("2024-05-01T10:00:00Z"))));
    }

    #[test]
    fn port_carries_ip_and_service_defaults_version() {
        let batch = report().to_batch("nmap-agent", Utc::now());
        assert_eq!(batch.source, "nmap-agent");

        let port = &batch.entities[2].properties;
        assert_eq!(port.get("ip_address"), Some(&json!("10.0.0.5")));
        assert_eq!(port.get("number"), Some(&json!(443)));

        let service = &batch.entities[3].properties;
        assert_eq!(service.get("version"), Some(&json!("unknown")));

        let weak = &batch.entities[5].properties;
        assert!(weak.get("cve_id").is_none());
        assert!(weak.get("cvss").is_none());
    }

    #[test]
    fn repeated_ports_are_merged() {
        let report: ScanReport = serde_json::from_value(json!({
            "result": {
                "host": "api.example.com",
                "ip": "10.0.0.5",
                "ports": [
                    { "port": 443, "protocol": "tcp" },
                    {
                        "port": 443,
                        "protocol": "tcp",
                        "service": { "name": "nginx", "version": "1.25" },
                        "vulnerabilities": [ { "description": "heap overflow", "is_vulnerable": true } ]
                    },
                    {
                        "port": 443,
                        "protocol": "tcp",
                        "service": { "name": "nginx" },
                        "vulnerabilities": [
                            { "description": "heap overflow", "is_vulnerable": true },
                            { "description": "weak ciphers", "is_vulnerable": false }
                        ]
                    },
                    { "port": 443, "protocol": "udp" }
                ]
            }
        }))
        .unwrap();
        let batch = report.to_batch("agent", Utc::now());

        let ports: Vec<_> = batch.entities.iter().filter(|e| e.node_type == "Port").collect();
        assert_eq!(ports.len(), 2);
        let services: Vec<_> = batch.entities.iter().filter(|e| e.node_type == "Service").collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].properties.get("version"), Some(&json!("1.25")));
        assert_eq!(batch.entities.iter().filter(|e| e.node_type == "Vulnerability").count(), 2);

        let mut aliases: Vec<_> = batch.entities.iter().filter_map(|e| e.alias.as_deref()).collect();
        let total = aliases.len();
        aliases.sort_unstable();
        aliases.dedup();
        assert_eq!(aliases.len(), total);
    }

    #[test]
    fn no_host_means_no_resolves_to() {
        let result = ScanResult {
            ip: "10.0.0.9".to_string(),
            ..Default::default()
        };
        let batch = result.to_batch("agent", Utc::now());
        assert_eq!(batch.entities.len(), 1);
        assert!(batch.relationships.is_empty());
    }

    #[test]
    fn no_ip_drops_ports() {
        let mut result = report().result;
        result.ip = String::new();
        let batch = result.to_batch("agent", Utc::now());
        assert_eq!(batch.entities.len(), 1);
        assert_eq!(batch.entities[0].node_type, "Host");
        assert!(batch.relationships.is_empty());
    }
}
