// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::RemoteHost;
use crate::RemoteShell;
use async_trait::async_trait;
use slog::info;
use slog::warn;
use slog::Logger;
use std::time::Duration;

/// Prefix of every [`ConnectError::Unreachable`] message.
///
/// Fleet-wide operations look for this to mark a single host as failed
/// instead of aborting.
pub const UNREACHABLE_MARKER: &str = "Unable to SSH to";

/// How hard to try before declaring a host unreachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl ConnectPolicy {
    pub const DEFAULT_ATTEMPTS: usize = 5;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::DEFAULT_ATTEMPTS,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

/// Failure of a single dial attempt.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The host could not be reached or the handshake failed; worth retrying.
    #[error("connection failed")]
    Transport(#[source] anyhow::Error),
    /// The host answered but refused our key; retrying will not help.
    #[error("public key authentication rejected for user {user}")]
    AuthenticationRejected { user: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Unable to SSH to {address} after {attempts} attempts")]
    Unreachable {
        address: String,
        attempts: usize,
        #[source]
        err: anyhow::Error,
    },
    #[error("authentication to {address} failed")]
    Authentication {
        address: String,
        #[source]
        err: DialError,
    },
}

impl ConnectError {
    /// True if the host never accepted a connection, as opposed to rejecting
    /// our credentials.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ConnectError::Unreachable { .. })
    }
}

/// Something that can open a [`RemoteShell`] to a host.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The `host:port` form of `host`, used in logs and errors.
    fn address(&self, host: &str) -> String;

    async fn dial(&self, host: &str) -> Result<Box<dyn RemoteShell>, DialError>;
}

/// Dials `host`, retrying transport failures according to `policy`.
///
/// Authentication failures are returned immediately.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    host: &str,
    policy: ConnectPolicy,
    log: &Logger,
) -> Result<RemoteHost, ConnectError> {
    let address = connector.address(host);
    let attempts = policy.attempts.max(1);
    info!(log, "connecting"; "address" => &address);

    let mut attempt = 1;
    loop {
        match connector.dial(host).await {
            Ok(shell) => {
                info!(log, "connected"; "address" => &address, "attempt" => attempt);
                return Ok(RemoteHost::new(address, shell, log.clone()));
            }
            Err(err @ DialError::AuthenticationRejected { .. }) => {
                return Err(ConnectError::Authentication { address, err });
            }
            Err(DialError::Transport(err)) => {
                if attempt >= attempts {
                    warn!(
                        log,
                        "giving up on host";
                        "address" => &address,
                        "attempts" => attempts,
                        "error" => format!("{err:#}"),
                    );
                    return Err(ConnectError::Unreachable {
                        address,
                        attempts,
                        err,
                    });
                }
                warn!(
                    log,
                    "connection attempt failed";
                    "address" => &address,
                    "attempt" => attempt,
                    "retry_after" => ?policy.backoff,
                    "error" => format!("{err:#}"),
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeConnector;
    use crate::fake::FakeShell;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures_with_fixed_backoff() {
        let connector = FakeConnector::new();
        connector.add_host("10.0.0.1", FakeShell::new());
        connector.fail_first_dials("10.0.0.1", 3);

        let start = tokio::time::Instant::now();
        let host = connect_with_retry(
            &connector,
            "10.0.0.1",
            ConnectPolicy::default(),
            &test_log(),
        )
        .await
        .expect("fourth attempt succeeds");

        assert_eq!(host.address(), "10.0.0.1:22");
        assert_eq!(connector.dial_count("10.0.0.1"), 4);
        assert_eq!(start.elapsed(), ConnectPolicy::DEFAULT_BACKOFF * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_unreachable() {
        let connector = FakeConnector::new();
        connector.mark_unreachable("10.0.0.9");

        let err = connect_with_retry(
            &connector,
            "10.0.0.9",
            ConnectPolicy::default(),
            &test_log(),
        )
        .await
        .expect_err("host never answers");

        assert!(err.is_unreachable());
        assert!(err.to_string().starts_with(UNREACHABLE_MARKER));
        assert_eq!(
            connector.dial_count("10.0.0.9"),
            ConnectPolicy::DEFAULT_ATTEMPTS
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key_is_not_retried() {
        let connector = FakeConnector::new();
        connector.reject_key("10.0.0.2");

        let err = connect_with_retry(
            &connector,
            "10.0.0.2",
            ConnectPolicy::default(),
            &test_log(),
        )
        .await
        .expect_err("key is rejected");

        assert!(!err.is_unreachable());
        assert_eq!(connector.dial_count("10.0.0.2"), 1);
    }
}
