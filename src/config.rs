//! The static port-mapping table the ingress side routes by.
//!
//! Loaded once at startup from a JSON document with a single required key
//! `portMappings`. The table is immutable after load; lookups are by the
//! local listen port.

use crate::codec::Endpoint;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// One routing rule: clients accepted on `local_port` are tunnelled to
/// `remote_host:remote_port` on the egress side.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_host: Ipv4Addr,
    pub remote_port: u16,
    pub description: String,
}

impl PortMapping {
    pub fn target(&self) -> Endpoint {
        Endpoint::new(self.remote_host, self.remote_port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingFile {
    port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mapping file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate localPort {0} in mapping file")]
    DuplicatePort(u16),
}

/// The ordered, immutable list of port mappings.
#[derive(Debug)]
pub struct MappingTable {
    entries: Vec<PortMapping>,
}

impl MappingTable {
    /// Loads the table from `path`.
    ///
    /// An unreadable file falls back to the built-in single entry (with a
    /// warning); malformed JSON and duplicate local ports are fatal.
    pub fn load(path: &Path) -> Result<MappingTable, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "could not read mapping file {}: {e}; using built-in default mapping",
                    path.display()
                );
                return Ok(MappingTable::fallback());
            }
        };

        let file: MappingFile = serde_json::from_str(&raw)?;
        MappingTable::from_entries(file.port_mappings)
    }

    /// Builds a table from in-memory entries, rejecting duplicate ports.
    pub fn from_entries(entries: Vec<PortMapping>) -> Result<MappingTable, ConfigError> {
        let mut seen = HashSet::new();
        for mapping in &entries {
            if !seen.insert(mapping.local_port) {
                return Err(ConfigError::DuplicatePort(mapping.local_port));
            }
        }
        Ok(MappingTable { entries })
    }

    /// The built-in mapping used when no file is available: local 8080 to
    /// the local SSH port.
    pub fn fallback() -> MappingTable {
        MappingTable {
            entries: vec![PortMapping {
                local_port: 8080,
                remote_host: Ipv4Addr::LOCALHOST,
                remote_port: 22,
                description: "default".to_string(),
            }],
        }
    }

    pub fn lookup(&self, local_port: u16) -> Option<&PortMapping> {
        self.entries
            .iter()
            .find(|mapping| mapping.local_port == local_port)
    }

    pub fn entries(&self) -> &[PortMapping] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mapping_document() {
        let raw = r#"{
            "portMappings": [
                { "localPort": 8080, "remoteHost": "192.168.0.5", "remotePort": 80, "description": "web" },
                { "localPort": 2222, "remoteHost": "10.0.0.1", "remotePort": 22, "description": "ssh" }
            ]
        }"#;

        let file: MappingFile = serde_json::from_str(raw).unwrap();
        let table = MappingTable::from_entries(file.port_mappings).unwrap();

        assert_eq!(table.entries().len(), 2);
        let web = table.lookup(8080).unwrap();
        assert_eq!(web.remote_host, Ipv4Addr::new(192, 168, 0, 5));
        assert_eq!(web.remote_port, 80);
        assert_eq!(web.description, "web");
        assert!(table.lookup(9999).is_none());
    }

    #[test]
    fn duplicate_local_port_is_fatal() {
        let raw = r#"{
            "portMappings": [
                { "localPort": 8080, "remoteHost": "127.0.0.1", "remotePort": 80, "description": "a" },
                { "localPort": 8080, "remoteHost": "127.0.0.1", "remotePort": 81, "description": "b" }
            ]
        }"#;

        let file: MappingFile = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            MappingTable::from_entries(file.port_mappings),
            Err(ConfigError::DuplicatePort(8080))
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let dir = std::env::temp_dir().join("uart-tunnel-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            MappingTable::load(&path),
            Err(ConfigError::Parse(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let path = Path::new("/nonexistent/uart-tunnel/port-mapping.json");
        let table = MappingTable::load(path).unwrap();

        let only = table.lookup(8080).unwrap();
        assert_eq!(only.remote_host, Ipv4Addr::LOCALHOST);
        assert_eq!(only.remote_port, 22);
        assert_eq!(only.description, "default");
    }

    #[test]
    fn ipv6_host_is_rejected() {
        let raw = r#"{
            "portMappings": [
                { "localPort": 8080, "remoteHost": "::1", "remotePort": 80, "description": "six" }
            ]
        }"#;

        assert!(serde_json::from_str::<MappingFile>(raw).is_err());
    }
}
