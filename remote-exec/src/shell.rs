// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Input streamed to a running command, one chunk per message. The command's
/// input is closed once the sending side is dropped.
pub type StdinStream = mpsc::Receiver<Vec<u8>>;

/// Output of a single remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` if the channel closed without reporting an exit status.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("remote session failed while running `{command}`")]
pub struct ShellError {
    pub command: String,
    #[source]
    pub source: anyhow::Error,
}

/// An authenticated connection able to run commands on one host.
///
/// Each call to [`RemoteShell::exec`] runs in its own channel; implementors
/// must not carry state from one command to the next.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command`, forwarding every chunk of `stdin` (if any) to it
    /// before closing its input, and collects everything it prints until the
    /// channel closes.
    ///
    /// `stdin` must be dropped by the time this returns so that whoever
    /// feeds it can finish.
    async fn exec(
        &self,
        command: &str,
        stdin: Option<StdinStream>,
    ) -> Result<CommandOutput, ShellError>;

    /// Tears down the connection. Errors are not interesting at this point.
    async fn close(&self) {}
}
