// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::ServerErrorBody;

const NO_LEADER: &str = "NoLeaderException";
const ALL_NODES_DOWN: &str = "AllTopologyNodesDownException";
const DATABASE_DOES_NOT_EXIST: &str = "DatabaseDoesNotExistException";
const CONCURRENCY: &str = "ConcurrencyException";

// The server reports a duplicate database as a concurrency conflict whose
// message says so.
const ALREADY_EXISTS_MESSAGE: &str = "already exists";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("no leader has been elected in the cluster: {message}")]
    NoLeader { message: String },

    #[error("all topology nodes are down: {message}")]
    AllNodesDown { message: String },

    #[error("database does not exist: {message}")]
    DatabaseDoesNotExist { message: String },

    #[error("database already exists: {message}")]
    AlreadyExists { message: String },

    #[error("concurrency conflict: {message}")]
    Concurrency { message: String },

    #[error("{operation} failed with status {status} ({kind}): {message}")]
    Server {
        operation: &'static str,
        status: u16,
        kind: String,
        message: String,
    },

    #[error("{operation} request failed")]
    Request {
        operation: &'static str,
        #[source]
        err: reqwest::Error,
    },

    #[error("failed to parse response to {operation}")]
    Decode {
        operation: &'static str,
        #[source]
        err: serde_json::Error,
    },

    #[error("{operation} returned an unexpected response: {found}")]
    UnexpectedResponse { operation: &'static str, found: &'static str },

    #[error("invalid server URL {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        err: url::ParseError,
    },

    #[error("{url} cannot be used as a base URL")]
    CannotBeABase { url: String },

    #[error("failed to load client certificate")]
    Identity(#[source] reqwest::Error),

    #[error("failed to build HTTP client")]
    Builder(#[source] reqwest::Error),
}

impl AdminError {
    /// Maps a failed response onto the error classes callers act on.
    ///
    /// Classification uses the last segment of the exception type the
    /// server reports, so it is independent of the namespace the server
    /// version puts its exceptions in.
    pub fn from_response(operation: &'static str, status: u16, body: &[u8]) -> Self {
        let parsed: ServerErrorBody = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return AdminError::Server {
                    operation,
                    status,
                    kind: String::new(),
                    message: String::from_utf8_lossy(body).trim().to_string(),
                };
            }
        };
        let message = if parsed.message.is_empty() {
            parsed.error.clone()
        } else {
            parsed.message.clone()
        };
        let short_kind = parsed.kind.rsplit('.').next().unwrap_or_default();
        match short_kind {
            NO_LEADER => AdminError::NoLeader { message },
            ALL_NODES_DOWN => AdminError::AllNodesDown { message },
            DATABASE_DOES_NOT_EXIST => {
                AdminError::DatabaseDoesNotExist { message }
            }
            CONCURRENCY if message.contains(ALREADY_EXISTS_MESSAGE) => {
                AdminError::AlreadyExists { message }
            }
            CONCURRENCY => AdminError::Concurrency { message },
            _ => AdminError::Server {
                operation,
                status,
                kind: parsed.kind.clone(),
                message,
            },
        }
    }

    /// Maps a failure to reach the server at all.
    pub fn from_transport(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            let mut message = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                message.push_str(": ");
                message.push_str(&cause.to_string());
                source = cause.source();
            }
            AdminError::AllNodesDown { message }
        } else {
            AdminError::Request { operation, err }
        }
    }

    /// True for the conditions that clear up on their own while a cluster
    /// forms: no leader elected yet, or no node answering yet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdminError::NoLeader { .. } | AdminError::AllNodesDown { .. }
        )
    }

    pub fn is_all_nodes_down(&self) -> bool {
        matches!(self, AdminError::AllNodesDown { .. })
    }

    pub fn is_database_missing(&self) -> bool {
        matches!(self, AdminError::DatabaseDoesNotExist { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AdminError::AlreadyExists { .. })
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, AdminError::Concurrency { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn classify(kind: &str, message: &str) -> AdminError {
        let body = serde_json::json!({
            "Url": "/admin/databases",
            "Type": kind,
            "Message": message,
            "Error": "stack trace"
        });
        AdminError::from_response(
            "create-database",
            500,
            body.to_string().as_bytes(),
        )
    }

    #[test]
    fn classifies_by_exception_type() {
        assert!(classify(
            "Raven.Client.Exceptions.Cluster.NoLeaderException",
            "no leader"
        )
        .is_transient());
        assert!(classify(
            "Raven.Client.Exceptions.Database.DatabaseDoesNotExistException",
            "Database 'hc' does not exist"
        )
        .is_database_missing());
        assert!(classify(
            "Raven.Client.Exceptions.ConcurrencyException",
            "Database 'orders' already exists!"
        )
        .is_already_exists());

        let err = classify(
            "Raven.Client.Exceptions.ConcurrencyException",
            "etag mismatch",
        );
        assert!(err.is_concurrency());
        assert!(!err.is_transient());
    }

    #[test]
    fn unknown_errors_are_not_retried() {
        let err = classify(
            "Raven.Server.Documents.Indexes.IndexCompilationException",
            "bad map",
        );
        assert!(!err.is_transient());
        assert!(
            matches!(err, AdminError::Server { status: 500, ref kind, .. }
                if kind.ends_with("IndexCompilationException"))
        );
    }

    #[test]
    fn non_json_bodies_are_kept_verbatim() {
        let err = AdminError::from_response(
            "get-build-number",
            502,
            b"Bad Gateway\n",
        );
        match err {
            AdminError::Server { status, message, .. } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Bad Gateway");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
