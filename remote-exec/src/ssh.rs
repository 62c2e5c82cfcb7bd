// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Connector`] backed by a real SSH client.

use crate::CommandOutput;
use crate::Connector;
use crate::DialError;
use crate::RemoteShell;
use crate::ShellError;
use crate::StdinStream;
use anyhow::anyhow;
use anyhow::Context;
use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh::Disconnect;
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_SSH_PORT: u16 = 22;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity used to log into every host.
#[derive(Clone)]
pub struct SshCredential {
    pub user: String,
    /// PEM-encoded private key.
    pub private_key: String,
    pub port: u16,
}

impl std::fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredential")
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("ssh user must not be empty")]
    EmptyUser,
    #[error("failed to parse ssh private key")]
    InvalidKey(#[source] russh_keys::Error),
}

pub struct SshConnector {
    user: String,
    port: u16,
    key: Arc<key::KeyPair>,
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(credential: &SshCredential) -> Result<Self, CredentialError> {
        if credential.user.trim().is_empty() {
            return Err(CredentialError::EmptyUser);
        }
        let key = russh_keys::decode_secret_key(&credential.private_key, None)
            .map_err(CredentialError::InvalidKey)?;
        Ok(Self {
            user: credential.user.clone(),
            port: credential.port,
            key: Arc::new(key),
            config: Arc::new(client::Config::default()),
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn address(&self, host: &str) -> String {
        format!("{host}:{}", self.port)
    }

    async fn dial(&self, host: &str) -> Result<Box<dyn RemoteShell>, DialError> {
        let connect = client::connect(
            Arc::clone(&self.config),
            (host, self.port),
            AcceptAnyHostKey,
        );
        let mut handle = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| {
                DialError::Transport(anyhow!(
                    "timed out after {DIAL_TIMEOUT:?} connecting to {host}"
                ))
            })?
            .map_err(|err| DialError::Transport(err.into()))?;

        let accepted = handle
            .authenticate_publickey(&self.user, Arc::clone(&self.key))
            .await
            .map_err(|err| DialError::Transport(err.into()))?;
        if !accepted {
            return Err(DialError::AuthenticationRejected {
                user: self.user.clone(),
            });
        }

        Ok(Box::new(SshShell { handle: Mutex::new(handle) }))
    }
}

// Hosts are freshly created machines whose keys we have no way of knowing in
// advance.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct SshShell {
    handle: Mutex<client::Handle<AcceptAnyHostKey>>,
}

impl SshShell {
    async fn run(
        &self,
        command: &str,
        stdin: Option<StdinStream>,
    ) -> anyhow::Result<CommandOutput> {
        let mut channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .context("opening session channel")?
        };
        channel.exec(true, command).await.context("starting command")?;

        if let Some(mut input) = stdin {
            while let Some(chunk) = input.recv().await {
                channel.data(&chunk[..]).await.context("writing stdin")?;
            }
            channel.eof().await.context("closing stdin")?;
        }

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    output.stdout.extend_from_slice(data);
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    output.exit_status = Some(exit_status);
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(
        &self,
        command: &str,
        stdin: Option<StdinStream>,
    ) -> Result<CommandOutput, ShellError> {
        self.run(command, stdin).await.map_err(|source| ShellError {
            command: command.to_string(),
            source,
        })
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}
