// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing a running cluster in line with a [`ClusterSpec`].
//!
//! Everything goes through the admin API of the first node. Every call is
//! retried through transient cluster conditions (see [`crate::retry`]);
//! anything else stops reconciliation, except where noted below.

use crate::bundle::convert_installed_certificate;
use crate::bundle::BundleError;
use crate::model::tag_from_url;
use crate::model::ClusterSpec;
use crate::model::Database;
use crate::model::Index;
use crate::retry::send_maintenance;
use crate::retry::send_server;
use crate::retry::RetryPolicy;
use crate::InlineErrorChain;
use ravendb_admin_client::types::ClusterTopologyResponse;
use ravendb_admin_client::types::DatabaseRecord;
use ravendb_admin_client::types::DatabaseTopology;
use ravendb_admin_client::types::DeleteDatabaseParameters;
use ravendb_admin_client::types::IndexDefinition;
use ravendb_admin_client::types::RachisState;
use ravendb_admin_client::AdminClient;
use ravendb_admin_client::AdminError;
use ravendb_admin_client::ClientIdentity;
use ravendb_admin_client::HttpAdminClient;
use ravendb_admin_client::MaintenanceOperation;
use ravendb_admin_client::OperationResponse;
use ravendb_admin_client::ServerOperation;
use remote_exec::connect_with_retry;
use remote_exec::ConnectError;
use remote_exec::ConnectPolicy;
use remote_exec::Connector;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;

/// Replication nodes of a database that names none.
pub const DEFAULT_REPLICATION_NODE: &str = "A";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{operation} failed")]
    Admin {
        operation: &'static str,
        #[source]
        err: AdminError,
    },
    #[error(
        "database {database:?} already exists but its topology could not be \
         read"
    )]
    Modify {
        database: String,
        #[source]
        err: AdminError,
    },
    #[error(
        "database {database:?} has an encryption key but the cluster is \
         unsecured"
    )]
    KeyWithoutTls { database: String },
    #[error("cluster has no public URLs to talk to")]
    NoPublicUrl,
    #[error(
        "failed to convert the first node's server certificate into an admin \
         credential"
    )]
    Credential(#[source] BundleError),
    #[error(
        "failed to connect to the first node to fetch its server certificate \
         for an admin credential"
    )]
    CredentialHost(#[source] ConnectError),
    #[error("failed to create admin client")]
    Client(#[source] AdminError),
}

impl ReconcileError {
    fn admin(operation: &'static str) -> impl FnOnce(AdminError) -> Self {
        move |err| ReconcileError::Admin { operation, err }
    }
}

/// Builds an admin client for the first node of `spec`.
///
/// The client authenticates with the shared bundle's certificate. When the
/// cluster is secured and the bundle has none, the first node's installed
/// server certificate is converted and used instead.
pub async fn admin_client(
    spec: &ClusterSpec,
    connector: &dyn Connector,
    connect: ConnectPolicy,
    log: &Logger,
) -> Result<HttpAdminClient, ReconcileError> {
    let url = spec.url.list.first().ok_or(ReconcileError::NoPublicUrl)?;
    let identity = if !spec.security.is_secured() {
        None
    } else {
        let holder = match spec.shared_bundle() {
            Some(bundle) if bundle.has_client_credential() => bundle.clone(),
            _ => {
                let host = spec.hosts.first().ok_or(ReconcileError::NoPublicUrl)?;
                info!(
                    log,
                    "no client certificate in setup archive; converting the \
                     server certificate of the first node";
                    "host" => %host,
                );
                let remote =
                    connect_with_retry(connector, &host.to_string(), connect, log)
                        .await
                        .map_err(ReconcileError::CredentialHost)?;
                let converted = convert_installed_certificate(&remote).await;
                remote.close().await;
                converted.map_err(ReconcileError::Credential)?
            }
        };
        Some(ClientIdentity {
            cert_pem: holder.cert.clone(),
            key_pem: holder.key.clone(),
        })
    };
    HttpAdminClient::new(url, identity.as_ref(), log.clone())
        .map_err(ReconcileError::Client)
}

fn desired_nodes(database: &Database) -> Vec<String> {
    if database.replication_nodes.is_empty() {
        vec![DEFAULT_REPLICATION_NODE.to_string()]
    } else {
        database.replication_nodes.clone()
    }
}

fn index_definition(index: &Index) -> IndexDefinition {
    IndexDefinition {
        name: index.name.clone(),
        maps: index.maps.clone(),
        reduce: (!index.reduce.trim().is_empty()).then(|| index.reduce.clone()),
        configuration: index.configuration.clone(),
    }
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

pub struct Reconciler<'a> {
    spec: &'a ClusterSpec,
    client: &'a dyn AdminClient,
    policy: RetryPolicy,
    log: Logger,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        spec: &'a ClusterSpec,
        client: &'a dyn AdminClient,
        policy: RetryPolicy,
        log: Logger,
    ) -> Self {
        Self { spec, client, policy, log }
    }

    async fn server(
        &self,
        op: ServerOperation,
    ) -> Result<OperationResponse, AdminError> {
        debug!(self.log, "sending"; "operation" => op.name());
        send_server(self.client, &op, self.policy, &self.log).await
    }

    async fn maintenance(
        &self,
        op: MaintenanceOperation,
        database: &str,
    ) -> Result<OperationResponse, AdminError> {
        debug!(
            self.log,
            "sending";
            "operation" => op.name(),
            "database" => database,
        );
        send_maintenance(self.client, &op, database, self.policy, &self.log)
            .await
    }

    async fn topology(&self) -> Result<ClusterTopologyResponse, AdminError> {
        let op = ServerOperation::GetClusterTopology;
        self.server(op).await?.into_cluster_topology("get-cluster-topology")
    }

    /// Reconciles the cluster, then returns its topology id.
    ///
    /// Membership is left alone; see [`Reconciler::ensure_membership`].
    pub async fn deploy(&self) -> Result<String, ReconcileError> {
        self.reconcile().await?;
        let topology = self
            .topology()
            .await
            .map_err(ReconcileError::admin("get-cluster-topology"))?;
        info!(
            self.log,
            "cluster deployed";
            "topology_id" => &topology.topology.topology_id,
        );
        Ok(topology.topology.topology_id)
    }

    /// Makes the cluster's members exactly the nodes named by the URL list.
    ///
    /// A node that is not part of any cluster yet (or a cluster that cannot
    /// answer at all) gets every other node added to it first.
    pub async fn ensure_membership(&self) -> Result<(), ReconcileError> {
        let urls = &self.spec.url.list;

        // A single attempt: failure here means the cluster needs bootstrap.
        let first = self
            .client
            .send_server_operation(&ServerOperation::GetClusterTopology)
            .await
            .and_then(|r| r.into_cluster_topology("get-cluster-topology"));
        let bootstrap = match first {
            Ok(topology) => topology.current_state == RachisState::Passive,
            Err(err) if err.is_all_nodes_down() => true,
            Err(err) => {
                return Err(ReconcileError::Admin {
                    operation: "get-cluster-topology",
                    err,
                });
            }
        };

        if bootstrap {
            info!(self.log, "forming cluster"; "nodes" => urls.len());
            for url in urls.iter().skip(1) {
                self.add_node(url).await?;
            }
        }

        let topology = self
            .topology()
            .await
            .map_err(ReconcileError::admin("get-cluster-topology"))?
            .topology;

        for (tag, live_url) in &topology.all_nodes {
            if urls.iter().any(|url| same_url(url, live_url)) {
                continue;
            }
            let tag = tag_from_url(live_url).unwrap_or_else(|| tag.clone());
            info!(
                self.log,
                "removing undeclared node";
                "tag" => &tag,
                "url" => live_url,
            );
            self.server(ServerOperation::RemoveClusterNode {
                url: live_url.clone(),
                tag,
            })
            .await
            .map_err(ReconcileError::admin("remove-cluster-node"))?;
        }

        for url in urls {
            let present =
                topology.all_nodes.values().any(|live| same_url(url, live));
            if !present {
                self.add_node(url).await?;
            }
        }
        Ok(())
    }

    async fn add_node(&self, url: &str) -> Result<(), ReconcileError> {
        let tag = tag_from_url(url).unwrap_or_default();
        info!(self.log, "adding node"; "url" => url, "tag" => &tag);
        self.server(ServerOperation::AddClusterNode { url: url.to_string(), tag })
            .await
            .map_err(ReconcileError::admin("add-cluster-node"))?;
        Ok(())
    }

    /// Reconciles databases and indexes: healthcheck, deletions, keys,
    /// creation or placement changes, then indexes.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        if !self.spec.security.is_secured() {
            if let Some(db) =
                self.spec.databases.iter().find(|db| db.key().is_some())
            {
                return Err(ReconcileError::KeyWithoutTls {
                    database: db.name.clone(),
                });
            }
        }

        self.healthcheck().await?;
        self.delete_databases().await?;
        self.delete_indexes().await?;
        self.distribute_keys().await?;
        for database in &self.spec.databases {
            self.wait_for_members().await;
            self.create_or_modify(database).await?;
        }
        self.put_indexes().await?;
        Ok(())
    }

    async fn healthcheck(&self) -> Result<(), ReconcileError> {
        let name = &self.spec.healthcheck_database;
        if name.is_empty() {
            return Ok(());
        }
        let op = MaintenanceOperation::DatabaseHealthCheck;
        match self.maintenance(op.clone(), name).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_database_missing() => {}
            Err(err) => return Err(ReconcileError::admin(op.name())(err)),
        }

        info!(self.log, "creating healthcheck database"; "database" => name);
        let create = ServerOperation::CreateDatabase {
            record: DatabaseRecord {
                database_name: name.clone(),
                ..Default::default()
            },
            replication_factor: self.spec.hosts.len(),
        };
        match self.server(create).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(ReconcileError::admin("create-database")(err)),
        }
        self.maintenance(op, name)
            .await
            .map_err(ReconcileError::admin("database-healthcheck"))?;
        Ok(())
    }

    async fn delete_databases(&self) -> Result<(), ReconcileError> {
        for database in &self.spec.databases_to_delete {
            info!(
                self.log,
                "deleting database";
                "database" => &database.name,
                "hard_delete" => database.hard_delete,
            );
            let op = ServerOperation::DeleteDatabases(DeleteDatabaseParameters {
                database_names: vec![database.name.clone()],
                hard_delete: database.hard_delete,
                from_nodes: Vec::new(),
            });
            match self.server(op).await {
                Ok(_) => {}
                Err(err) if err.is_database_missing() => {
                    debug!(self.log, "already gone"; "database" => &database.name);
                }
                Err(err) => {
                    return Err(ReconcileError::admin("delete-databases")(err));
                }
            }
        }
        Ok(())
    }

    async fn delete_indexes(&self) -> Result<(), ReconcileError> {
        for target in &self.spec.indexes_to_delete {
            for name in &target.index_names {
                info!(
                    self.log,
                    "deleting index";
                    "database" => &target.database,
                    "index" => name,
                );
                let op = MaintenanceOperation::DeleteIndex { name: name.clone() };
                match self.maintenance(op, &target.database).await {
                    Ok(_) => {}
                    Err(err) if err.is_database_missing() => {
                        warn!(
                            self.log,
                            "database of index to delete does not exist";
                            "database" => &target.database,
                        );
                        break;
                    }
                    Err(err) => {
                        return Err(ReconcileError::admin("delete-index")(err));
                    }
                }
            }
        }
        Ok(())
    }

    async fn distribute_keys(&self) -> Result<(), ReconcileError> {
        for database in &self.spec.databases {
            let Some(key) = database.key() else { continue };
            let nodes = desired_nodes(database);
            info!(
                self.log,
                "distributing encryption key";
                "database" => &database.name,
                "nodes" => nodes.join(","),
            );
            self.server(ServerOperation::DistributeSecretKey {
                database: database.name.clone(),
                nodes,
                key: key.to_string(),
            })
            .await
            .map_err(ReconcileError::admin("distribute-secret-key"))?;
        }
        Ok(())
    }

    /// Gives the cluster a bounded amount of time to have every host as a
    /// member. Proceeds either way.
    async fn wait_for_members(&self) {
        let expected = self.spec.hosts.len();
        for attempt in 1..=self.policy.attempts.max(1) {
            match self.topology().await {
                Ok(t) if t.topology.members.len() >= expected => return,
                Ok(t) => debug!(
                    self.log,
                    "waiting for members";
                    "members" => t.topology.members.len(),
                    "expected" => expected,
                ),
                Err(err) => debug!(
                    self.log,
                    "waiting for members";
                    InlineErrorChain::new(&err),
                ),
            }
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }
        warn!(
            self.log,
            "cluster still has fewer members than hosts; continuing";
            "expected" => expected,
        );
    }

    async fn create_or_modify(
        &self,
        database: &Database,
    ) -> Result<(), ReconcileError> {
        let nodes = desired_nodes(database);
        let op = ServerOperation::CreateDatabase {
            record: DatabaseRecord {
                database_name: database.name.clone(),
                encrypted: database.key().is_some(),
                settings: database.settings.clone(),
                topology: Some(DatabaseTopology {
                    members: nodes.clone(),
                    replication_factor: nodes.len(),
                    dynamic_nodes_distribution: false,
                }),
                ..Default::default()
            },
            replication_factor: nodes.len(),
        };
        match self.server(op).await {
            Ok(_) => {
                info!(
                    self.log,
                    "created database";
                    "database" => &database.name,
                    "nodes" => nodes.join(","),
                );
                Ok(())
            }
            Err(err) if err.is_already_exists() => {
                self.modify(database, &nodes).await
            }
            Err(err) if err.is_concurrency() => {
                warn!(
                    self.log,
                    "concurrent change while creating database; continuing";
                    "database" => &database.name,
                    InlineErrorChain::new(&err),
                );
                Ok(())
            }
            Err(err) => Err(ReconcileError::admin("create-database")(err)),
        }
    }

    async fn modify(
        &self,
        database: &Database,
        desired: &[String],
    ) -> Result<(), ReconcileError> {
        let live = self
            .server(ServerOperation::GetDatabaseTopology {
                database: database.name.clone(),
            })
            .await
            .and_then(|r| r.into_database_topology("get-database-topology"))
            .map_err(|err| ReconcileError::Modify {
                database: database.name.clone(),
                err,
            })?
            .cluster_tags();
        let live: BTreeSet<&String> = live.iter().collect();
        let desired_set: BTreeSet<&String> = desired.iter().collect();

        let excess: Vec<String> =
            live.difference(&desired_set).map(|tag| (*tag).clone()).collect();
        if !excess.is_empty() {
            info!(
                self.log,
                "removing database from nodes";
                "database" => &database.name,
                "nodes" => excess.join(","),
            );
            let op = ServerOperation::DeleteDatabases(DeleteDatabaseParameters {
                database_names: vec![database.name.clone()],
                hard_delete: true,
                from_nodes: excess,
            });
            self.server(op)
                .await
                .map_err(ReconcileError::admin("delete-databases"))?;
        }

        for node in desired.iter().filter(|node| !live.contains(node)) {
            info!(
                self.log,
                "adding database to node";
                "database" => &database.name,
                "node" => node,
            );
            self.server(ServerOperation::AddDatabaseNode {
                database: database.name.clone(),
                node: node.clone(),
            })
            .await
            .map_err(ReconcileError::admin("add-database-node"))?;
        }
        Ok(())
    }

    async fn put_indexes(&self) -> Result<(), ReconcileError> {
        for database in &self.spec.databases {
            if database.indexes.is_empty() {
                continue;
            }
            let definitions: Vec<IndexDefinition> =
                database.indexes.iter().map(index_definition).collect();
            info!(
                self.log,
                "putting indexes";
                "database" => &database.name,
                "count" => definitions.len(),
            );
            self.maintenance(
                MaintenanceOperation::PutIndexes(definitions),
                &database.name,
            )
            .await
            .map_err(ReconcileError::admin("put-indexes"))?;
        }
        Ok(())
    }
}
