// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Context;
use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;
use ravendb_admin_client::AdminClient;
use ravendb_deployer::config::ClusterConfig;
use ravendb_deployer::dns::SystemResolver;
use ravendb_deployer::fleet::Concurrency;
use ravendb_deployer::model::ClusterSpec;
use ravendb_deployer::package::check_available;
use ravendb_deployer::provision::deploy_fleet;
use ravendb_deployer::provision::DeployOptions;
use ravendb_deployer::reconcile::admin_client;
use ravendb_deployer::reconcile::Reconciler;
use ravendb_deployer::retry::RetryPolicy;
use ravendb_deployer::state::read_fleet;
use ravendb_deployer::state::ReadOptions;
use ravendb_deployer::teardown::destroy_fleet;
use remote_exec::ConnectPolicy;
use remote_exec::Connector;
use remote_exec::SshConnector;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ravendb-deployer", about = "Deploy and manage RavenDB clusters")]
struct Args {
    /// Deployment file
    #[clap(long, short)]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install and configure every host, then form and reconcile the cluster
    Deploy {
        /// Deploy hosts one at a time
        #[clap(long)]
        serial: bool,
        /// Assume the server package is already installed
        #[clap(long)]
        skip_install: bool,
    },
    /// Converge databases and indexes of a running cluster
    Reconcile,
    /// Bring cluster membership in line with the configured hosts
    Membership,
    /// Print what is installed on each host as JSON
    Read,
    /// Purge the server package from every host
    Destroy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ClusterConfig::from_file(&args.config)?;
    let log = config
        .log
        .to_logger("ravendb-deployer")
        .context("failed to set up logging")?;
    let spec = Arc::new(
        config
            .into_spec()
            .with_context(|| format!("invalid deployment file {}", args.config))?,
    );
    let connector: Arc<dyn Connector> = Arc::new(
        SshConnector::new(&spec.ssh).context("invalid SSH credential")?,
    );

    match args.command {
        Command::Deploy { serial, skip_install } => {
            let options = DeployOptions {
                concurrency: if serial {
                    Concurrency::Serial
                } else {
                    Concurrency::Parallel
                },
                skip_install,
                ..Default::default()
            };
            let topology_id =
                deploy(&spec, connector, options, &log).await?;
            println!("{topology_id}");
        }
        Command::Reconcile => {
            let client = client(&spec, &*connector, &log).await?;
            Reconciler::new(&spec, &client, RetryPolicy::default(), log.clone())
                .reconcile()
                .await?;
        }
        Command::Membership => {
            let client = client(&spec, &*connector, &log).await?;
            Reconciler::new(&spec, &client, RetryPolicy::default(), log.clone())
                .ensure_membership()
                .await?;
        }
        Command::Read => {
            let client: Arc<dyn AdminClient> =
                Arc::new(client(&spec, &*connector, &log).await?);
            let states = read_fleet(
                Arc::clone(&spec),
                connector,
                client,
                ReadOptions::default(),
                &log,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&states)?);
        }
        Command::Destroy => {
            destroy_fleet(
                Arc::clone(&spec),
                connector,
                ConnectPolicy::default(),
                &log,
            )
            .await?;
        }
    }
    Ok(())
}

async fn deploy(
    spec: &Arc<ClusterSpec>,
    connector: Arc<dyn Connector>,
    options: DeployOptions,
    log: &Logger,
) -> Result<String> {
    if !options.skip_install {
        check_available(&spec.package, log).await?;
    }
    let resolver = Arc::new(
        SystemResolver::new(log.new(o!("component" => "dns")))
            .context("failed to set up DNS resolver")?,
    );
    deploy_fleet(Arc::clone(spec), Arc::clone(&connector), resolver, options, log)
        .await?;

    let client = client(spec, &*connector, log).await?;
    let topology_id =
        Reconciler::new(spec, &client, RetryPolicy::default(), log.clone())
            .deploy()
            .await?;
    info!(log, "cluster deployed"; "topology_id" => &topology_id);
    Ok(topology_id)
}

async fn client(
    spec: &ClusterSpec,
    connector: &dyn Connector,
    log: &Logger,
) -> Result<ravendb_admin_client::HttpAdminClient> {
    admin_client(spec, connector, ConnectPolicy::default(), log)
        .await
        .context("failed to connect to the cluster admin API")
}
