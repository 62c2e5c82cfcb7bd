// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading back what is actually installed on each host.

use crate::bundle::encryption_key_hash;
use crate::bundle::CertificateHolder;
use crate::bundle::LICENSE_FILE_NAME;
use crate::fleet::for_each_host;
use crate::fleet::Concurrency;
use crate::fleet::FleetError;
use crate::model::tag_for_index;
use crate::model::ClusterSpec;
use crate::model::Database;
use crate::model::ModelError;
use crate::model::NodeState;
use crate::retry::send_server;
use crate::retry::RetryPolicy;
use crate::settings;
use crate::settings::SettingsError;
use ravendb_admin_client::AdminClient;
use ravendb_admin_client::AdminError;
use ravendb_admin_client::ServerOperation;
use remote_exec::connect_with_retry;
use remote_exec::ConnectError;
use remote_exec::ConnectPolicy;
use remote_exec::Connector;
use remote_exec::DeployError;
use remote_exec::RemoteHost;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;

const CONFIG_DIRS: [&str; 2] = ["/etc/ravendb", "/etc/ravendb/security"];

/// Never read back.
const MASTER_KEY_FILE_NAME: &str = "master.key";
const SERVER_PFX_FILE_NAME: &str = "server.pfx";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Remote(#[from] DeployError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to query server version")]
    Version(#[source] AdminError),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    pub connect: ConnectPolicy,
    pub retry: RetryPolicy,
}

/// Reads every host of `spec`. Hosts that cannot be reached at all come
/// back with `failed` set instead of failing the read.
pub async fn read_fleet(
    spec: Arc<ClusterSpec>,
    connector: Arc<dyn Connector>,
    client: Arc<dyn AdminClient>,
    options: ReadOptions,
    log: &Logger,
) -> Result<Vec<NodeState>, FleetError<StateError>> {
    for_each_host(&spec.hosts, Concurrency::Parallel, |index, host| {
        let spec = Arc::clone(&spec);
        let connector = Arc::clone(&connector);
        let client = Arc::clone(&client);
        let log = log.new(o!("host" => host.to_string()));
        async move {
            read_node(&spec, index, host, &*connector, &*client, options, &log)
                .await
        }
    })
    .await
}

pub async fn read_node(
    spec: &ClusterSpec,
    index: usize,
    host: IpAddr,
    connector: &dyn Connector,
    client: &dyn AdminClient,
    options: ReadOptions,
    log: &Logger,
) -> Result<NodeState, StateError> {
    let tag = tag_for_index(index)?;
    let remote =
        match connect_with_retry(connector, &host.to_string(), options.connect, log)
            .await
        {
            Ok(remote) => remote,
            Err(err) if err.is_unreachable() => {
                warn!(log, "marking node as failed"; crate::InlineErrorChain::new(&err));
                return Ok(NodeState::unreachable(host));
            }
            Err(err) => return Err(err.into()),
        };

    let mut state = NodeState::new(host);
    let files = read_config_files(&remote, &tag, &mut state).await;
    remote.close().await;
    files?;

    let version = send_server(
        client,
        &ServerOperation::GetBuildNumber,
        options.retry,
        log,
    )
    .await
    .and_then(|r| r.into_build_number("get-build-number"))
    .map_err(StateError::Version)?;
    state.version = version.full_version;

    state.unsecured = !spec.security.is_secured();
    state.databases = spec.databases.iter().map(redact_key).collect();
    state.databases_to_delete = spec.databases_to_delete.clone();
    state.indexes_to_delete = spec.indexes_to_delete.clone();

    info!(log, "read node"; "version" => &state.version, "assets" => state.assets.len());
    Ok(state)
}

async fn read_config_files(
    remote: &RemoteHost,
    tag: &str,
    state: &mut NodeState,
) -> Result<(), StateError> {
    for dir in CONFIG_DIRS {
        for path in remote.list_files(dir).await? {
            let file_name =
                path.rsplit('/').next().unwrap_or_default().to_string();
            if file_name == MASTER_KEY_FILE_NAME {
                continue;
            }
            let content = remote.read_file(&path).await?;
            match file_name.as_str() {
                settings::SETTINGS_FILE_NAME => {
                    state.settings = settings::normalize(tag, &content)?;
                }
                LICENSE_FILE_NAME => state.license = content,
                SERVER_PFX_FILE_NAME => {
                    state.bundles.insert(
                        tag.to_string(),
                        CertificateHolder { pfx: content, ..Default::default() },
                    );
                }
                _ => {
                    state.assets.insert(path, content);
                }
            }
        }
    }
    Ok(())
}

fn redact_key(database: &Database) -> Database {
    Database {
        encryption_key: database.key().map(encryption_key_hash),
        ..database.clone()
    }
}
