// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated cluster implementing [`AdminClient`].
//!
//! Keeps just enough state (nodes, databases and their placement, indexes,
//! distributed keys) for reconciliation to converge against it, and records
//! every operation it receives. Failures can be scripted per operation name.

use crate::types::BuildNumber;
use crate::types::ClusterTopology;
use crate::types::ClusterTopologyResponse;
use crate::types::DatabasePutResult;
use crate::types::IndexDefinition;
use crate::types::RachisState;
use crate::types::ServerNode;
use crate::types::Topology;
use crate::AdminClient;
use crate::AdminError;
use crate::MaintenanceOperation;
use crate::OperationResponse;
use crate::ServerOperation;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

/// One operation as received by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentOperation {
    Server(ServerOperation),
    Maintenance { database: String, op: MaintenanceOperation },
}

impl SentOperation {
    pub fn name(&self) -> &'static str {
        match self {
            SentOperation::Server(op) => op.name(),
            SentOperation::Maintenance { op, .. } => op.name(),
        }
    }
}

type ErrorFactory = Arc<dyn Fn() -> AdminError + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakeDatabase {
    pub nodes: Vec<String>,
    pub encrypted: bool,
    pub indexes: BTreeMap<String, IndexDefinition>,
}

#[derive(Default)]
struct ClusterState {
    version: String,
    topology_id: String,
    nodes: BTreeMap<String, String>,
    passive: bool,
    databases: BTreeMap<String, FakeDatabase>,
    secrets: Vec<(String, Vec<String>, String)>,
    sent: Vec<SentOperation>,
    scripted: BTreeMap<&'static str, VecDeque<ErrorFactory>>,
}

/// Clones share one simulated cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub const TOPOLOGY_ID: &'static str = "f3c0a1de-5b7e-4c1c-9d7e-6a0f0c2d9b11";

    /// A formed cluster whose members are `nodes` (tag, url).
    pub fn new(nodes: &[(&str, &str)]) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.lock();
            state.version = "6.0.105".to_string();
            state.topology_id = Self::TOPOLOGY_ID.to_string();
            state.nodes = nodes
                .iter()
                .map(|(tag, url)| (tag.to_string(), url.to_string()))
                .collect();
        }
        cluster
    }

    /// A single node that has not joined or formed a cluster yet.
    pub fn passive(tag: &str, url: &str) -> Self {
        let cluster = Self::new(&[(tag, url)]);
        cluster.lock().passive = true;
        cluster
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    pub fn add_database(&self, name: &str, nodes: &[&str]) {
        self.lock().databases.insert(
            name.to_string(),
            FakeDatabase {
                nodes: nodes.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            },
        );
    }

    pub fn add_index(&self, database: &str, index: IndexDefinition) {
        if let Some(db) = self.lock().databases.get_mut(database) {
            db.indexes.insert(index.name.clone(), index);
        }
    }

    /// The next `times` calls of the operation called `name` fail with
    /// whatever `error` builds.
    pub fn fail_next<F>(&self, name: &'static str, times: usize, error: F)
    where
        F: Fn() -> AdminError + Send + Sync + 'static,
    {
        let error: ErrorFactory = Arc::new(error);
        let mut state = self.lock();
        let queue = state.scripted.entry(name).or_default();
        for _ in 0..times {
            queue.push_back(Arc::clone(&error));
        }
    }

    pub fn nodes(&self) -> BTreeMap<String, String> {
        self.lock().nodes.clone()
    }

    pub fn database(&self, name: &str) -> Option<FakeDatabase> {
        self.lock().databases.get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.lock().databases.keys().cloned().collect()
    }

    /// Keys handed out so far, as (database, nodes, key).
    pub fn secrets(&self) -> Vec<(String, Vec<String>, String)> {
        self.lock().secrets.clone()
    }

    pub fn sent(&self) -> Vec<SentOperation> {
        self.lock().sent.clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.lock().sent.iter().map(SentOperation::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.lock().sent.iter().filter(|op| op.name() == name).count()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    fn scripted_failure(
        state: &mut ClusterState,
        name: &'static str,
    ) -> Option<AdminError> {
        let queue = state.scripted.get_mut(name)?;
        queue.pop_front().map(|make| make())
    }

    fn missing(database: &str) -> AdminError {
        AdminError::DatabaseDoesNotExist {
            message: format!("Database '{database}' does not exist."),
        }
    }

    fn next_free_tag(state: &ClusterState) -> String {
        (b'A'..=b'Z')
            .map(|c| (c as char).to_string())
            .find(|tag| !state.nodes.contains_key(tag))
            .unwrap_or_else(|| format!("N{}", state.nodes.len()))
    }

    fn apply_server(
        state: &mut ClusterState,
        op: &ServerOperation,
    ) -> Result<OperationResponse, AdminError> {
        match op {
            ServerOperation::GetBuildNumber => {
                Ok(OperationResponse::BuildNumber(BuildNumber {
                    product_version: "6.0".to_string(),
                    full_version: state.version.clone(),
                    ..Default::default()
                }))
            }
            ServerOperation::GetClusterTopology => {
                let (current_state, leader) = if state.passive {
                    (RachisState::Passive, None)
                } else {
                    (RachisState::Leader, state.nodes.keys().next().cloned())
                };
                Ok(OperationResponse::ClusterTopology(ClusterTopologyResponse {
                    topology: ClusterTopology {
                        topology_id: state.topology_id.clone(),
                        all_nodes: state.nodes.clone(),
                        members: state.nodes.clone(),
                        ..Default::default()
                    },
                    leader: leader.clone(),
                    node_tag: leader.unwrap_or_default(),
                    current_state,
                }))
            }
            ServerOperation::GetDatabaseTopology { database } => {
                let db = state
                    .databases
                    .get(database)
                    .ok_or_else(|| Self::missing(database))?;
                let nodes = db
                    .nodes
                    .iter()
                    .map(|tag| ServerNode {
                        url: state.nodes.get(tag).cloned().unwrap_or_default(),
                        cluster_tag: tag.clone(),
                        database: database.clone(),
                        server_role: "Member".to_string(),
                    })
                    .collect();
                Ok(OperationResponse::DatabaseTopology(Topology {
                    nodes,
                    etag: 1,
                }))
            }
            ServerOperation::CreateDatabase { record, replication_factor } => {
                let name = &record.database_name;
                if state.databases.contains_key(name) {
                    return Err(AdminError::AlreadyExists {
                        message: format!("Database '{name}' already exists!"),
                    });
                }
                let members = record
                    .topology
                    .as_ref()
                    .map(|t| t.members.clone())
                    .unwrap_or_default();
                let nodes = if members.is_empty() {
                    state.nodes.keys().take(*replication_factor).cloned().collect()
                } else {
                    members
                };
                state.databases.insert(
                    name.clone(),
                    FakeDatabase {
                        nodes: nodes.clone(),
                        encrypted: record.encrypted,
                        indexes: BTreeMap::new(),
                    },
                );
                Ok(OperationResponse::DatabasePut(DatabasePutResult {
                    name: name.clone(),
                    raft_command_index: 1,
                    nodes_added_to: nodes,
                }))
            }
            ServerOperation::DeleteDatabases(params) => {
                for name in &params.database_names {
                    if params.from_nodes.is_empty() {
                        state.databases.remove(name);
                    } else if let Some(db) = state.databases.get_mut(name) {
                        db.nodes.retain(|n| !params.from_nodes.contains(n));
                    }
                }
                Ok(OperationResponse::Empty)
            }
            ServerOperation::AddDatabaseNode { database, node } => {
                let db = state
                    .databases
                    .get_mut(database)
                    .ok_or_else(|| Self::missing(database))?;
                if !db.nodes.contains(node) {
                    db.nodes.push(node.clone());
                }
                Ok(OperationResponse::DatabasePut(DatabasePutResult {
                    name: database.clone(),
                    raft_command_index: 1,
                    nodes_added_to: vec![node.clone()],
                }))
            }
            ServerOperation::AddClusterNode { url, tag } => {
                let tag = if tag.is_empty() {
                    Self::next_free_tag(state)
                } else {
                    tag.clone()
                };
                state.nodes.insert(tag, url.clone());
                state.passive = false;
                Ok(OperationResponse::Empty)
            }
            ServerOperation::RemoveClusterNode { tag, .. } => {
                state.nodes.remove(tag);
                Ok(OperationResponse::Empty)
            }
            ServerOperation::DistributeSecretKey { database, nodes, key } => {
                state.secrets.push((database.clone(), nodes.clone(), key.clone()));
                Ok(OperationResponse::Empty)
            }
        }
    }

    fn apply_maintenance(
        state: &mut ClusterState,
        op: &MaintenanceOperation,
        database: &str,
    ) -> Result<OperationResponse, AdminError> {
        let db = state
            .databases
            .get_mut(database)
            .ok_or_else(|| Self::missing(database))?;
        match op {
            MaintenanceOperation::PutIndexes(indexes) => {
                for index in indexes {
                    db.indexes.insert(index.name.clone(), index.clone());
                }
            }
            MaintenanceOperation::DeleteIndex { name } => {
                db.indexes.remove(name);
            }
            MaintenanceOperation::DatabaseHealthCheck => {}
        }
        Ok(OperationResponse::Empty)
    }
}

#[async_trait]
impl AdminClient for FakeCluster {
    async fn send_server_operation(
        &self,
        op: &ServerOperation,
    ) -> Result<OperationResponse, AdminError> {
        let mut state = self.lock();
        state.sent.push(SentOperation::Server(op.clone()));
        if let Some(err) = Self::scripted_failure(&mut state, op.name()) {
            return Err(err);
        }
        Self::apply_server(&mut state, op)
    }

    async fn send_maintenance_operation(
        &self,
        op: &MaintenanceOperation,
        database: &str,
    ) -> Result<OperationResponse, AdminError> {
        let mut state = self.lock();
        state.sent.push(SentOperation::Maintenance {
            database: database.to_string(),
            op: op.clone(),
        });
        if let Some(err) = Self::scripted_failure(&mut state, op.name()) {
            return Err(err);
        }
        Self::apply_maintenance(&mut state, op, database)
    }
}
