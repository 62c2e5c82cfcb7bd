// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::fleet::for_each_host;
use crate::fleet::Concurrency;
use crate::fleet::FleetError;
use crate::model::ClusterSpec;
use crate::InlineErrorChain;
use remote_exec::connect_with_retry;
use remote_exec::ConnectError;
use remote_exec::ConnectPolicy;
use remote_exec::Connector;
use remote_exec::DeployError;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;

pub const PURGE_COMMAND: &str = "sudo apt-get -y purge ravendb";

#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Remote(#[from] DeployError),
}

/// Purges the server package from every host at once.
pub async fn destroy_fleet(
    spec: Arc<ClusterSpec>,
    connector: Arc<dyn Connector>,
    connect: ConnectPolicy,
    log: &Logger,
) -> Result<(), FleetError<TeardownError>> {
    for_each_host(&spec.hosts, Concurrency::Parallel, |_, host| {
        let connector = Arc::clone(&connector);
        let log = log.new(o!("host" => host.to_string()));
        async move {
            let result = purge(&*connector, host, connect, &log).await;
            match &result {
                Ok(()) => info!(log, "Deleted successfully ravendb instance"),
                Err(err) => warn!(
                    log,
                    "Failed to delete ravendb instance";
                    InlineErrorChain::new(err),
                ),
            }
            result
        }
    })
    .await?;
    Ok(())
}

async fn purge(
    connector: &dyn Connector,
    host: IpAddr,
    connect: ConnectPolicy,
    log: &Logger,
) -> Result<(), TeardownError> {
    let remote =
        connect_with_retry(connector, &host.to_string(), connect, log).await?;
    let result = remote.run_sequence(&[PURGE_COMMAND], None).await;
    remote.close().await;
    result?;
    Ok(())
}
