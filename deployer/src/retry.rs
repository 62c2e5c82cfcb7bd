// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retrying admin operations through transient cluster conditions.
//!
//! Only [`AdminError::is_transient`] errors (no leader elected yet, no node
//! answering yet) are retried, at a fixed interval and for a bounded number
//! of attempts. Everything else is returned on the first failure.

use crate::error_chain::InlineErrorChain;
use backoff::backoff::Backoff;
use ravendb_admin_client::AdminClient;
use ravendb_admin_client::AdminError;
use ravendb_admin_client::MaintenanceOperation;
use ravendb_admin_client::OperationResponse;
use ravendb_admin_client::ServerOperation;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_ATTEMPTS: usize = 5;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

    fn backoff(&self) -> FixedRetries {
        let retries = self.attempts.max(1) - 1;
        FixedRetries { delay: self.delay, retries, remaining: retries }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: Self::DEFAULT_ATTEMPTS, delay: Self::DEFAULT_DELAY }
    }
}

/// Same delay every time, until the retry budget runs out.
#[derive(Debug)]
struct FixedRetries {
    delay: Duration,
    retries: usize,
    remaining: usize,
}

impl Backoff for FixedRetries {
    fn reset(&mut self) {
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-transient error, or
/// the policy's attempts are used up.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    log: &Logger,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, AdminError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdminError>>,
{
    backoff::future::retry_notify(
        policy.backoff(),
        || {
            let fut = attempt();
            async move {
                fut.await.map_err(|err| {
                    if err.is_transient() {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        },
        |err: AdminError, delay: Duration| {
            warn!(
                log,
                "cluster not ready; retrying";
                "operation" => operation,
                "retry_after" => ?delay,
                InlineErrorChain::new(&err),
            );
        },
    )
    .await
}

pub async fn send_server(
    client: &dyn AdminClient,
    op: &ServerOperation,
    policy: RetryPolicy,
    log: &Logger,
) -> Result<OperationResponse, AdminError> {
    retry_transient(policy, log, op.name(), || client.send_server_operation(op))
        .await
}

pub async fn send_maintenance(
    client: &dyn AdminClient,
    op: &MaintenanceOperation,
    database: &str,
    policy: RetryPolicy,
    log: &Logger,
) -> Result<OperationResponse, AdminError> {
    retry_transient(policy, log, op.name(), || {
        client.send_maintenance_operation(op, database)
    })
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use ravendb_admin_client::fake::FakeCluster;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn no_leader() -> AdminError {
        AdminError::NoLeader { message: "election in progress".to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn no_leader_is_retried_at_a_fixed_interval() {
        let cluster = FakeCluster::new(&[("A", "https://a.example.com")]);
        cluster.fail_next("get-build-number", 3, no_leader);

        let start = tokio::time::Instant::now();
        let response = send_server(
            &cluster,
            &ServerOperation::GetBuildNumber,
            RetryPolicy::default(),
            &test_log(),
        )
        .await
        .expect("fourth attempt succeeds");

        assert!(matches!(response, OperationResponse::BuildNumber(_)));
        assert_eq!(cluster.count("get-build-number"), 4);
        assert_eq!(start.elapsed(), RetryPolicy::DEFAULT_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let cluster = FakeCluster::new(&[("A", "https://a.example.com")]);
        cluster.fail_next("get-cluster-topology", 10, || {
            AdminError::AllNodesDown { message: "connection refused".into() }
        });

        let start = tokio::time::Instant::now();
        let err = send_server(
            &cluster,
            &ServerOperation::GetClusterTopology,
            RetryPolicy::default(),
            &test_log(),
        )
        .await
        .expect_err("never recovers");

        assert!(err.is_all_nodes_down());
        assert_eq!(
            cluster.count("get-cluster-topology"),
            RetryPolicy::DEFAULT_ATTEMPTS
        );
        assert_eq!(start.elapsed(), RetryPolicy::DEFAULT_DELAY * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_return_immediately() {
        let cluster = FakeCluster::new(&[("A", "https://a.example.com")]);
        cluster.add_database("orders", &["A"]);
        cluster.fail_next("put-indexes", 1, || AdminError::Server {
            operation: "put-indexes",
            status: 500,
            kind: "IndexCompilationException".to_string(),
            message: "bad map".to_string(),
        });

        let start = tokio::time::Instant::now();
        let err = send_maintenance(
            &cluster,
            &MaintenanceOperation::PutIndexes(Vec::new()),
            "orders",
            RetryPolicy::default(),
            &test_log(),
        )
        .await
        .expect_err("compilation errors are final");

        assert!(matches!(err, AdminError::Server { status: 500, .. }));
        assert_eq!(cluster.count("put-indexes"), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
