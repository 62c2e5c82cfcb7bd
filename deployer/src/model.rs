// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory model of a cluster deployment and of what was read back from
//! it.

use crate::bundle::CertificateHolder;
use crate::settings::SettingValue;
use remote_exec::SshCredential;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Bundle key holding the license and the admin client credential shared by
/// every node.
pub const SHARED_BUNDLE_KEY: &str = "store";

pub const DEFAULT_SECURED_HTTP_PORT: u16 = 443;
pub const DEFAULT_SECURED_TCP_PORT: u16 = 38888;
pub const DEFAULT_UNSECURED_HTTP_PORT: u16 = 8080;
pub const DEFAULT_UNSECURED_TCP_PORT: u16 = 38881;

/// Port implied by a plain `http` URL.
pub const PLAIN_HTTP_PORT: u16 = 80;

/// Node tags are single letters, so a cluster holds at most this many nodes.
pub const MAX_NODES: usize = 26;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error(
        "host index {index} has no node tag (at most {MAX_NODES} hosts are \
         supported)"
    )]
    TooManyHosts { index: usize },
}

/// Returns the node tag of the host at `index`: `A` for 0, `B` for 1, ...
pub fn tag_for_index(index: usize) -> Result<String, ModelError> {
    if index >= MAX_NODES {
        return Err(ModelError::TooManyHosts { index });
    }
    // `index` < 26, so this stays within `A..=Z`.
    Ok(char::from(b'A' + index as u8).to_string())
}

/// Derives a node tag from the first DNS label of `url`'s host, when that
/// label is one to four ASCII letters (`https://b.db.example.com` yields
/// `B`).
pub fn tag_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let label = host.split('.').next()?;
    let is_tag = (1..=4).contains(&label.len())
        && label.chars().all(|c| c.is_ascii_alphabetic());
    is_tag.then(|| label.to_ascii_uppercase())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    Amd64,
    Arm64,
    Arm32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Package {
    pub version: String,
    pub arch: Architecture,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    Secured,
    Unsecured,
}

impl SecurityMode {
    pub fn is_secured(self) -> bool {
        self == SecurityMode::Secured
    }

    pub fn scheme(self) -> &'static str {
        match self {
            SecurityMode::Secured => "https",
            SecurityMode::Unsecured => "http",
        }
    }

    pub fn default_http_port(self) -> u16 {
        match self {
            SecurityMode::Secured => DEFAULT_SECURED_HTTP_PORT,
            SecurityMode::Unsecured => DEFAULT_UNSECURED_HTTP_PORT,
        }
    }

    pub fn default_tcp_port(self) -> u16 {
        match self {
            SecurityMode::Secured => DEFAULT_SECURED_TCP_PORT,
            SecurityMode::Unsecured => DEFAULT_UNSECURED_TCP_PORT,
        }
    }

    /// The port a URL of this mode's scheme implies when it names none.
    pub fn implied_port(self) -> u16 {
        match self {
            SecurityMode::Secured => DEFAULT_SECURED_HTTP_PORT,
            SecurityMode::Unsecured => PLAIN_HTTP_PORT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UrlConfig {
    /// Public URL of each node, aligned with `ClusterSpec::hosts`.
    pub list: Vec<String>,
    pub http_port: u16,
    pub tcp_port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub maps: Vec<String>,
    /// Empty for map-only indexes.
    #[serde(default)]
    pub reduce: String,
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Database {
    pub name: String,
    pub settings: BTreeMap<String, String>,
    pub replication_nodes: Vec<String>,
    pub encryption_key: Option<String>,
    pub indexes: Vec<Index>,
}

impl Database {
    /// The encryption key, if one is set to something other than blanks.
    pub fn key(&self) -> Option<&str> {
        self.encryption_key.as_deref().filter(|key| !key.trim().is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseToDelete {
    pub name: String,
    #[serde(default)]
    pub hard_delete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexesToDelete {
    pub database: String,
    pub index_names: Vec<String>,
}

/// Everything needed to deploy and reconcile one cluster.
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    /// Public address of each host. Host `i` becomes node
    /// `tag_for_index(i)`.
    pub hosts: Vec<IpAddr>,
    pub package: Package,
    pub url: UrlConfig,
    pub ssh: SshCredential,
    pub security: SecurityMode,
    /// Certificate bundles by node tag, plus [`SHARED_BUNDLE_KEY`].
    pub bundles: BTreeMap<String, CertificateHolder>,
    pub settings_overrides: BTreeMap<String, SettingValue>,
    /// Extra files to install, by absolute path.
    pub assets: BTreeMap<String, Vec<u8>>,
    pub healthcheck_database: String,
    pub databases: Vec<Database>,
    pub databases_to_delete: Vec<DatabaseToDelete>,
    pub indexes_to_delete: Vec<IndexesToDelete>,
}

impl ClusterSpec {
    pub fn node_tags(&self) -> Result<Vec<String>, ModelError> {
        (0..self.hosts.len()).map(tag_for_index).collect()
    }

    pub fn shared_bundle(&self) -> Option<&CertificateHolder> {
        self.bundles.get(SHARED_BUNDLE_KEY)
    }

    pub fn node_bundle(&self, index: usize) -> Option<&CertificateHolder> {
        let tag = tag_for_index(index).ok()?;
        self.bundles.get(&tag)
    }

    pub fn http_port(&self) -> u16 {
        match self.url.http_port {
            0 => self.security.default_http_port(),
            port => port,
        }
    }

    pub fn tcp_port(&self) -> u16 {
        match self.url.tcp_port {
            0 => self.security.default_tcp_port(),
            port => port,
        }
    }
}

/// Per-node state re-derived from an installed host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeState {
    pub host: IpAddr,
    pub settings: BTreeMap<String, String>,
    #[serde(serialize_with = "base64_serde::serialize_map")]
    pub assets: BTreeMap<String, Vec<u8>>,
    pub bundles: BTreeMap<String, CertificateHolder>,
    #[serde(serialize_with = "base64_serde::serialize")]
    pub license: Vec<u8>,
    pub version: String,
    /// Set when the host could not be reached; nothing else is filled in.
    pub failed: bool,
    pub unsecured: bool,
    pub databases: Vec<Database>,
    pub databases_to_delete: Vec<DatabaseToDelete>,
    pub indexes_to_delete: Vec<IndexesToDelete>,
}

impl NodeState {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            settings: BTreeMap::new(),
            assets: BTreeMap::new(),
            bundles: BTreeMap::new(),
            license: Vec::new(),
            version: String::new(),
            failed: false,
            unsecured: false,
            databases: Vec::new(),
            databases_to_delete: Vec::new(),
            indexes_to_delete: Vec::new(),
        }
    }

    pub fn unreachable(host: IpAddr) -> Self {
        Self { failed: true, ..Self::new(host) }
    }
}

/// Serializes byte buffers as standard base64 strings.
pub(crate) mod base64_serde {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeMap;
    use serde::Serializer;
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn serialize_map<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, bytes) in map {
            out.serialize_entry(key, &STANDARD.encode(bytes))?;
        }
        out.end()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::settings;

    /// A cluster of `hosts` nodes at 10.0.0.1, 10.0.0.2, ... named
    /// `a.db.example.com`, `b.db.example.com`, ..., with a full setup
    /// archive's worth of bundles.
    pub(crate) fn cluster_spec(hosts: usize, security: SecurityMode) -> ClusterSpec {
        let mut bundles = BTreeMap::new();
        let mut shared = CertificateHolder {
            license: b"{\"Id\":\"license\"}".to_vec(),
            ..Default::default()
        };
        if security.is_secured() {
            shared.cert = b"CLIENT CERT".to_vec();
            shared.key = b"CLIENT KEY".to_vec();
        }
        bundles.insert(SHARED_BUNDLE_KEY.to_string(), shared);

        let url_key = if security.is_secured() {
            settings::PUBLIC_SERVER_URL
        } else {
            settings::SERVER_URL
        };
        let mut list = Vec::new();
        for index in 0..hosts {
            let tag = tag_for_index(index).unwrap();
            let name = format!(
                "{}://{}.db.example.com",
                security.scheme(),
                tag.to_ascii_lowercase()
            );
            let template = serde_json::json!({
                url_key: name,
                "Logs.Mode": "Information",
            });
            let public = settings::public_urls(
                &tag,
                &name,
                security,
                security.default_http_port(),
                security.default_tcp_port(),
            )
            .unwrap();
            list.push(public.http);
            bundles.insert(
                tag,
                CertificateHolder {
                    pfx: format!("pfx-{index}").into_bytes(),
                    settings_json: template.to_string().into_bytes(),
                    ..Default::default()
                },
            );
        }

        ClusterSpec {
            hosts: (1..=hosts)
                .map(|i| IpAddr::from([10, 0, 0, i as u8]))
                .collect(),
            package: Package {
                version: "6.0.105".to_string(),
                arch: Architecture::Amd64,
            },
            url: UrlConfig { list, http_port: 0, tcp_port: 0 },
            ssh: SshCredential {
                user: "ubuntu".to_string(),
                private_key: String::new(),
                port: 22,
            },
            security,
            bundles,
            settings_overrides: BTreeMap::new(),
            assets: BTreeMap::new(),
            healthcheck_database: "healthcheck".to_string(),
            databases: Vec::new(),
            databases_to_delete: Vec::new(),
            indexes_to_delete: Vec::new(),
        }
    }

    #[test]
    fn tags_follow_host_index() {
        assert_eq!(tag_for_index(0).unwrap(), "A");
        assert_eq!(tag_for_index(2).unwrap(), "C");
        assert_eq!(tag_for_index(25).unwrap(), "Z");
        assert_eq!(
            tag_for_index(26),
            Err(ModelError::TooManyHosts { index: 26 })
        );
    }

    #[test]
    fn tags_from_urls() {
        assert_eq!(
            tag_from_url("https://a.cluster.example.com").as_deref(),
            Some("A")
        );
        assert_eq!(
            tag_from_url("https://node.cluster.example.com:8080").as_deref(),
            Some("NODE")
        );
        // Too long, or not letters: the cluster has to pick a tag.
        assert_eq!(tag_from_url("https://nodes.cluster.example.com"), None);
        assert_eq!(tag_from_url("http://10.0.0.5:8080"), None);
        assert_eq!(tag_from_url("https://b2.example.com"), None);
        assert_eq!(tag_from_url("not a url"), None);
    }

    #[test]
    fn ports_default_by_security_mode() {
        assert_eq!(SecurityMode::Secured.default_http_port(), 443);
        assert_eq!(SecurityMode::Secured.default_tcp_port(), 38888);
        assert_eq!(SecurityMode::Unsecured.default_http_port(), 8080);
        assert_eq!(SecurityMode::Unsecured.default_tcp_port(), 38881);
        assert_eq!(SecurityMode::Unsecured.implied_port(), 80);
    }

    #[test]
    fn node_state_serializes_bytes_as_base64() {
        let mut state = NodeState::new("10.0.0.5".parse().unwrap());
        state.license = b"{}".to_vec();
        state.assets.insert("extra.conf".to_string(), b"abc".to_vec());

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["license"], "e30=");
        assert_eq!(value["assets"]["extra.conf"], "YWJj");
        assert_eq!(value["host"], "10.0.0.5");
        assert_eq!(value["failed"], false);
    }
}
