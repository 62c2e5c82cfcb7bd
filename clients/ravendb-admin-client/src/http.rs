// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::operations::Body;
use crate::operations::Method;
use crate::operations::RequestSpec;
use crate::AdminClient;
use crate::AdminError;
use crate::MaintenanceOperation;
use crate::OperationResponse;
use crate::ServerOperation;
use async_trait::async_trait;
use slog::debug;
use slog::Logger;
use std::time::Duration;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client certificate presented to a secured cluster.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// [`AdminClient`] talking to one cluster node over HTTP(S).
#[derive(Debug)]
pub struct HttpAdminClient {
    base: Url,
    client: reqwest::Client,
    log: Logger,
}

impl HttpAdminClient {
    /// Builds a client for the node at `server_url`.
    ///
    /// With an identity, the certificate is also trusted as a root so that
    /// clusters running on self-signed certificates can be reached.
    pub fn new(
        server_url: &str,
        identity: Option<&ClientIdentity>,
        log: Logger,
    ) -> Result<Self, AdminError> {
        let base = Url::parse(server_url).map_err(|err| {
            AdminError::InvalidUrl { url: server_url.to_string(), err }
        })?;
        if base.cannot_be_a_base() {
            return Err(AdminError::CannotBeABase {
                url: server_url.to_string(),
            });
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        if let Some(identity) = identity {
            let mut pem = identity.key_pem.clone();
            if !pem.ends_with(b"\n") {
                pem.push(b'\n');
            }
            pem.extend_from_slice(&identity.cert_pem);
            let client_identity = reqwest::Identity::from_pem(&pem)
                .map_err(AdminError::Identity)?;
            let root = reqwest::Certificate::from_pem(&identity.cert_pem)
                .map_err(AdminError::Identity)?;
            builder =
                builder.identity(client_identity).add_root_certificate(root);
        }
        let client = builder.build().map_err(AdminError::Builder)?;

        Ok(Self { base, client, log })
    }

    pub fn baseurl(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, spec: &RequestSpec) -> Url {
        let mut url = self.base.clone();
        // `new` rejected URLs that cannot be a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(&spec.segments);
        }
        if !spec.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&spec.query);
        }
        url
    }

    async fn send(
        &self,
        operation: &'static str,
        spec: RequestSpec,
    ) -> Result<OperationResponse, AdminError> {
        let url = self.url_for(&spec);
        let method = match spec.method {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        debug!(self.log, "client request";
            "operation" => operation,
            "method" => %method,
            "uri" => %url,
        );

        let mut request = self.client.request(method, url);
        request = match spec.body {
            Some(Body::Json(value)) => request.json(&value),
            Some(Body::Raw(bytes)) => request
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/json; charset=UTF-8",
                )
                .body(bytes),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|err| AdminError::from_transport(operation, err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| AdminError::from_transport(operation, err))?;
        debug!(self.log, "client response";
            "operation" => operation,
            "status" => status.as_u16(),
            "bytes" => body.len(),
        );

        if !status.is_success() {
            return Err(AdminError::from_response(
                operation,
                status.as_u16(),
                &body,
            ));
        }
        OperationResponse::decode(operation, spec.response, &body)
    }
}

#[async_trait]
impl AdminClient for HttpAdminClient {
    async fn send_server_operation(
        &self,
        op: &ServerOperation,
    ) -> Result<OperationResponse, AdminError> {
        self.send(op.name(), op.request()).await
    }

    async fn send_maintenance_operation(
        &self,
        op: &MaintenanceOperation,
        database: &str,
    ) -> Result<OperationResponse, AdminError> {
        self.send(op.name(), op.request(database)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client(base: &str) -> HttpAdminClient {
        HttpAdminClient::new(base, None, Logger::root(slog::Discard, slog::o!()))
            .unwrap()
    }

    #[test]
    fn urls_escape_database_names_and_queries() {
        let client = client("https://a.cluster.example.com");
        let url = client.url_for(
            &MaintenanceOperation::DatabaseHealthCheck.request("sales/eu"),
        );
        assert_eq!(
            url.as_str(),
            "https://a.cluster.example.com/databases/sales%2Feu/healthcheck"
        );

        let url = client.url_for(
            &ServerOperation::AddClusterNode {
                url: "https://b.cluster.example.com".to_string(),
                tag: "B".to_string(),
            }
            .request(),
        );
        assert_eq!(
            url.as_str(),
            "https://a.cluster.example.com/admin/cluster/node\
             ?url=https%3A%2F%2Fb.cluster.example.com&tag=B"
        );
    }

    #[test]
    fn trailing_slash_on_base_is_tolerated() {
        let client = client("http://10.0.0.5:8080/");
        let url = client.url_for(&ServerOperation::GetBuildNumber.request());
        assert_eq!(url.as_str(), "http://10.0.0.5:8080/build/version");
    }

    #[test]
    fn rejects_unusable_base_urls() {
        let log = Logger::root(slog::Discard, slog::o!());
        assert!(matches!(
            HttpAdminClient::new("not a url", None, log.clone()),
            Err(AdminError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpAdminClient::new("mailto:ops@example.com", None, log),
            Err(AdminError::CannotBeABase { .. })
        ));
    }

    #[test]
    fn identity_must_parse_as_certificate_and_key() {
        // The certificate is also loaded as a trusted root, so anything
        // that is not PEM fails when the client is built.
        let identity = ClientIdentity {
            cert_pem: b"not a certificate\n".to_vec(),
            key_pem: b"not a key\n".to_vec(),
        };
        let result = HttpAdminClient::new(
            "https://10.0.0.1:443",
            Some(&identity),
            Logger::root(slog::Discard, slog::o!()),
        );
        assert!(matches!(
            result,
            Err(AdminError::Identity(_)) | Err(AdminError::Builder(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_reported_as_all_nodes_down() {
        // Nothing listens on port 9 of the loopback address.
        let client = client("http://127.0.0.1:9");
        let err = client
            .send_server_operation(&ServerOperation::GetClusterTopology)
            .await
            .unwrap_err();
        assert!(err.is_all_nodes_down(), "unexpected error {err:?}");
        assert!(err.is_transient());
    }
}
