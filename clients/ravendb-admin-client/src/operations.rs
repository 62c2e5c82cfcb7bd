// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations the deployer sends, and how each maps onto an HTTP request.

use crate::types::BuildNumber;
use crate::types::ClusterTopologyResponse;
use crate::types::DatabasePutResult;
use crate::types::DatabaseRecord;
use crate::types::DeleteDatabaseParameters;
use crate::types::IndexDefinition;
use crate::types::Topology;
use crate::AdminError;
use serde::Serialize;

/// Cluster-wide operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerOperation {
    GetBuildNumber,
    GetClusterTopology,
    GetDatabaseTopology { database: String },
    CreateDatabase { record: DatabaseRecord, replication_factor: usize },
    DeleteDatabases(DeleteDatabaseParameters),
    AddDatabaseNode { database: String, node: String },
    /// An empty `tag` lets the cluster pick one.
    AddClusterNode { url: String, tag: String },
    RemoveClusterNode { url: String, tag: String },
    /// Hands an encryption key for `database` to each of `nodes` ahead of
    /// creating it.
    DistributeSecretKey { database: String, nodes: Vec<String>, key: String },
}

/// Operations scoped to one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaintenanceOperation {
    PutIndexes(Vec<IndexDefinition>),
    DeleteIndex { name: String },
    DatabaseHealthCheck,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

/// What a response body should be decoded as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Empty,
    BuildNumber,
    ClusterTopology,
    DatabaseTopology,
    DatabasePut,
}

/// Transport-independent description of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSpec {
    pub method: Method,
    /// Unescaped path segments, appended to the server URL.
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Body>,
    pub response: ResponseKind,
}

impl RequestSpec {
    fn new(method: Method, path: &str, response: ResponseKind) -> Self {
        Self {
            method,
            segments: path.split('/').map(str::to_string).collect(),
            query: Vec::new(),
            body: None,
            response,
        }
    }

    fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn json<T: Serialize>(mut self, body: &T) -> Self {
        // Every body here is a plain struct of strings, numbers and maps,
        // which always serializes.
        self.body = Some(Body::Json(
            serde_json::to_value(body).unwrap_or(serde_json::Value::Null),
        ));
        self
    }

    fn within_database(mut self, database: &str) -> Self {
        let mut segments =
            vec!["databases".to_string(), database.to_string()];
        segments.append(&mut self.segments);
        self.segments = segments;
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutIndexesBody<'a> {
    indexes: &'a [IndexDefinition],
}

impl ServerOperation {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            ServerOperation::GetBuildNumber => "get-build-number",
            ServerOperation::GetClusterTopology => "get-cluster-topology",
            ServerOperation::GetDatabaseTopology { .. } => {
                "get-database-topology"
            }
            ServerOperation::CreateDatabase { .. } => "create-database",
            ServerOperation::DeleteDatabases(_) => "delete-databases",
            ServerOperation::AddDatabaseNode { .. } => "add-database-node",
            ServerOperation::AddClusterNode { .. } => "add-cluster-node",
            ServerOperation::RemoveClusterNode { .. } => "remove-cluster-node",
            ServerOperation::DistributeSecretKey { .. } => {
                "distribute-secret-key"
            }
        }
    }

    pub fn request(&self) -> RequestSpec {
        use ResponseKind as R;
        match self {
            ServerOperation::GetBuildNumber => {
                RequestSpec::new(Method::Get, "build/version", R::BuildNumber)
            }
            ServerOperation::GetClusterTopology => RequestSpec::new(
                Method::Get,
                "cluster/topology",
                R::ClusterTopology,
            ),
            ServerOperation::GetDatabaseTopology { database } => {
                RequestSpec::new(Method::Get, "topology", R::DatabaseTopology)
                    .query("name", database)
            }
            ServerOperation::CreateDatabase { record, replication_factor } => {
                RequestSpec::new(Method::Put, "admin/databases", R::DatabasePut)
                    .query("name", &record.database_name)
                    .query("replicationFactor", replication_factor)
                    .json(record)
            }
            ServerOperation::DeleteDatabases(params) => {
                RequestSpec::new(Method::Delete, "admin/databases", R::Empty)
                    .json(params)
            }
            ServerOperation::AddDatabaseNode { database, node } => {
                RequestSpec::new(
                    Method::Put,
                    "admin/databases/node",
                    R::DatabasePut,
                )
                .query("name", database)
                .query("node", node)
            }
            ServerOperation::AddClusterNode { url, tag } => {
                let spec = RequestSpec::new(
                    Method::Put,
                    "admin/cluster/node",
                    R::Empty,
                )
                .query("url", url);
                if tag.is_empty() {
                    spec
                } else {
                    spec.query("tag", tag)
                }
            }
            ServerOperation::RemoveClusterNode { tag, .. } => {
                RequestSpec::new(Method::Delete, "admin/cluster/node", R::Empty)
                    .query("nodeTag", tag)
            }
            ServerOperation::DistributeSecretKey { database, nodes, key } => {
                let mut spec = RequestSpec::new(
                    Method::Post,
                    "admin/secrets/distribute",
                    R::Empty,
                )
                .query("name", database);
                for node in nodes {
                    spec = spec.query("node", node);
                }
                spec.body = Some(Body::Raw(key.as_bytes().to_vec()));
                spec
            }
        }
    }
}

impl MaintenanceOperation {
    pub fn name(&self) -> &'static str {
        match self {
            MaintenanceOperation::PutIndexes(_) => "put-indexes",
            MaintenanceOperation::DeleteIndex { .. } => "delete-index",
            MaintenanceOperation::DatabaseHealthCheck => "database-healthcheck",
        }
    }

    pub fn request(&self, database: &str) -> RequestSpec {
        let spec = match self {
            MaintenanceOperation::PutIndexes(indexes) => RequestSpec::new(
                Method::Put,
                "admin/indexes",
                ResponseKind::Empty,
            )
            .json(&PutIndexesBody { indexes }),
            MaintenanceOperation::DeleteIndex { name } => {
                RequestSpec::new(Method::Delete, "indexes", ResponseKind::Empty)
                    .query("name", name)
            }
            MaintenanceOperation::DatabaseHealthCheck => RequestSpec::new(
                Method::Get,
                "healthcheck",
                ResponseKind::Empty,
            ),
        };
        spec.within_database(database)
    }
}

/// Decoded result of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationResponse {
    Empty,
    BuildNumber(BuildNumber),
    ClusterTopology(ClusterTopologyResponse),
    DatabaseTopology(Topology),
    DatabasePut(DatabasePutResult),
}

impl OperationResponse {
    fn variant(&self) -> &'static str {
        match self {
            OperationResponse::Empty => "empty response",
            OperationResponse::BuildNumber(_) => "build number",
            OperationResponse::ClusterTopology(_) => "cluster topology",
            OperationResponse::DatabaseTopology(_) => "database topology",
            OperationResponse::DatabasePut(_) => "database put result",
        }
    }

    /// Decodes `body` according to `kind`. Empty bodies decode to defaults.
    pub fn decode(
        operation: &'static str,
        kind: ResponseKind,
        body: &[u8],
    ) -> Result<Self, AdminError> {
        fn parse<T: serde::de::DeserializeOwned + Default>(
            operation: &'static str,
            body: &[u8],
        ) -> Result<T, AdminError> {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(T::default());
            }
            serde_json::from_slice(body)
                .map_err(|err| AdminError::Decode { operation, err })
        }
        Ok(match kind {
            ResponseKind::Empty => OperationResponse::Empty,
            ResponseKind::BuildNumber => {
                OperationResponse::BuildNumber(parse(operation, body)?)
            }
            ResponseKind::ClusterTopology => {
                OperationResponse::ClusterTopology(parse(operation, body)?)
            }
            ResponseKind::DatabaseTopology => {
                OperationResponse::DatabaseTopology(parse(operation, body)?)
            }
            ResponseKind::DatabasePut => {
                OperationResponse::DatabasePut(parse(operation, body)?)
            }
        })
    }

    pub fn into_build_number(
        self,
        operation: &'static str,
    ) -> Result<BuildNumber, AdminError> {
        match self {
            OperationResponse::BuildNumber(build) => Ok(build),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_cluster_topology(
        self,
        operation: &'static str,
    ) -> Result<ClusterTopologyResponse, AdminError> {
        match self {
            OperationResponse::ClusterTopology(topology) => Ok(topology),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_database_topology(
        self,
        operation: &'static str,
    ) -> Result<Topology, AdminError> {
        match self {
            OperationResponse::DatabaseTopology(topology) => Ok(topology),
            other => Err(other.unexpected(operation)),
        }
    }

    fn unexpected(&self, operation: &'static str) -> AdminError {
        AdminError::UnexpectedResponse { operation, found: self.variant() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_distribution_repeats_node_parameter() {
        let spec = ServerOperation::DistributeSecretKey {
            database: "orders".to_string(),
            nodes: vec!["A".to_string(), "C".to_string()],
            key: "c2VjcmV0".to_string(),
        }
        .request();

        assert_eq!(spec.method, Method::Post);
        assert_eq!(spec.segments, ["admin", "secrets", "distribute"]);
        assert_eq!(
            spec.query,
            [
                ("name".to_string(), "orders".to_string()),
                ("node".to_string(), "A".to_string()),
                ("node".to_string(), "C".to_string()),
            ]
        );
        assert_eq!(spec.body, Some(Body::Raw(b"c2VjcmV0".to_vec())));
    }

    #[test]
    fn maintenance_operations_are_scoped_to_the_database() {
        let spec = MaintenanceOperation::DeleteIndex {
            name: "Orders/ByCompany".to_string(),
        }
        .request("sales/eu");
        assert_eq!(spec.segments, ["databases", "sales/eu", "indexes"]);
        assert_eq!(
            spec.query,
            [("name".to_string(), "Orders/ByCompany".to_string())]
        );

        let spec = MaintenanceOperation::PutIndexes(vec![IndexDefinition {
            name: "Orders/Totals".to_string(),
            maps: vec!["from o in docs.Orders select new { o.Total }".into()],
            ..Default::default()
        }])
        .request("sales");
        assert_eq!(spec.segments, ["databases", "sales", "admin", "indexes"]);
        match spec.body {
            Some(Body::Json(value)) => {
                assert_eq!(value["Indexes"][0]["Name"], "Orders/Totals");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn add_cluster_node_leaves_tag_to_the_cluster_when_empty() {
        let spec = ServerOperation::AddClusterNode {
            url: "https://10.0.0.7:8080".to_string(),
            tag: String::new(),
        }
        .request();
        assert_eq!(
            spec.query,
            [("url".to_string(), "https://10.0.0.7:8080".to_string())]
        );
    }

    #[test]
    fn responses_decode_by_kind() {
        let response = OperationResponse::decode(
            "get-build-number",
            ResponseKind::BuildNumber,
            br#"{"ProductVersion":"6.0","FullVersion":"6.0.105"}"#,
        )
        .unwrap();
        let build = response.into_build_number("get-build-number").unwrap();
        assert_eq!(build.full_version, "6.0.105");

        let empty = OperationResponse::decode(
            "delete-databases",
            ResponseKind::Empty,
            b"{\"RaftCommandIndex\":7}",
        )
        .unwrap();
        assert!(matches!(
            empty.into_cluster_topology("delete-databases"),
            Err(AdminError::UnexpectedResponse { .. })
        ));
    }
}
