// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response bodies of the admin API.
//!
//! The server speaks PascalCase JSON; unknown fields are ignored and most
//! fields default so that older and newer server versions both parse.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BuildNumber {
    pub product_version: String,
    pub build_version: i64,
    pub commit_hash: String,
    pub full_version: String,
}

/// Raft role of the node that answered a topology query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RachisState {
    /// Not part of any cluster yet.
    #[default]
    Passive,
    Candidate,
    Follower,
    LeaderElect,
    Leader,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterTopology {
    pub topology_id: String,
    /// Node tag to node URL, for every node regardless of role.
    pub all_nodes: BTreeMap<String, String>,
    pub members: BTreeMap<String, String>,
    pub promotables: BTreeMap<String, String>,
    pub watchers: BTreeMap<String, String>,
    pub last_node_id: String,
    pub etag: i64,
}

impl ClusterTopology {
    /// Returns the tag of the node listening on `url`, if any.
    pub fn tag_for_url(&self, url: &str) -> Option<&str> {
        self.all_nodes
            .iter()
            .find(|(_, node_url)| node_url.as_str() == url)
            .map(|(tag, _)| tag.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClusterTopologyResponse {
    pub topology: ClusterTopology,
    pub leader: Option<String>,
    pub node_tag: String,
    pub current_state: RachisState,
}

/// A node hosting a particular database.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerNode {
    pub url: String,
    pub cluster_tag: String,
    pub database: String,
    pub server_role: String,
}

/// Response of the per-database topology query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Topology {
    pub nodes: Vec<ServerNode>,
    pub etag: i64,
}

impl Topology {
    pub fn cluster_tags(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.cluster_tag.clone()).collect()
    }
}

/// Placement section of a [`DatabaseRecord`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseTopology {
    pub members: Vec<String>,
    pub replication_factor: usize,
    pub dynamic_nodes_distribution: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseRecord {
    pub database_name: String,
    pub disabled: bool,
    pub encrypted: bool,
    pub settings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<DatabaseTopology>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabasePutResult {
    pub name: String,
    pub raft_command_index: i64,
    pub nodes_added_to: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteDatabaseParameters {
    pub database_names: Vec<String>,
    pub hard_delete: bool,
    /// Restricts the deletion to these node tags. Empty means everywhere.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from_nodes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IndexDefinition {
    pub name: String,
    pub maps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
    pub configuration: BTreeMap<String, String>,
}

/// Error body returned by the server for failed requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerErrorBody {
    pub url: String,
    /// Fully-qualified exception type, e.g.
    /// `Raven.Client.Exceptions.Cluster.NoLeaderException`.
    #[serde(rename = "Type")]
    pub kind: String,
    pub message: String,
    pub error: String,
}
