// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow remote-execution primitive used to provision database hosts.
//!
//! A [`Connector`] dials a host and hands back a [`RemoteShell`], which can
//! run one command per channel. [`RemoteHost`] layers the operations the
//! provisioner actually needs on top of that: ordered command sequences,
//! file uploads over the `scp` sink protocol, and shallow directory reads.
//! Everything a host does is appended to a shared [`Transcript`] so failures
//! can be reported with the full session output.

mod connect;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
mod host;
pub mod scp;
mod shell;
mod ssh;
mod transcript;

pub use connect::connect_with_retry;
pub use connect::ConnectError;
pub use connect::ConnectPolicy;
pub use connect::Connector;
pub use connect::DialError;
pub use connect::UNREACHABLE_MARKER;
pub use host::DeployError;
pub use host::ExitStatus;
pub use host::RemoteHost;
pub use host::quote;
pub use host::SERVICE_OWNER;
pub use shell::CommandOutput;
pub use shell::RemoteShell;
pub use shell::ShellError;
pub use shell::StdinStream;
pub use ssh::CredentialError;
pub use ssh::SshConnector;
pub use ssh::SshCredential;
pub use ssh::DEFAULT_SSH_PORT;
pub use transcript::Transcript;
