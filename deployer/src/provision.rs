// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installing and starting the server on each host.
//!
//! Each host goes through the same sequence, one step after another: wait
//! for the machine to finish booting, install the package, upload the
//! license, settings, certificate and any extra assets, check that the
//! node's public name resolves to it, then (re)start the service and wait
//! until it answers. Hosts are independent of each other: a failing host
//! is reported and the others carry on.

use crate::dns::verify_resolution;
use crate::dns::DnsError;
use crate::dns::HostResolver;
use crate::fleet::for_each_host;
use crate::fleet::Concurrency;
use crate::fleet::FleetError;
use crate::model::tag_for_index;
use crate::model::ClusterSpec;
use crate::model::ModelError;
use crate::package::package_url;
use crate::package::LOCAL_PACKAGE_FILE;
use crate::settings;
use crate::settings::SettingsError;
use remote_exec::connect_with_retry;
use remote_exec::ConnectError;
use remote_exec::ConnectPolicy;
use remote_exec::Connector;
use remote_exec::DeployError;
use remote_exec::RemoteHost;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub const BOOT_FINISHED_MARKER: &str = "/var/lib/cloud/instance/boot-finished";
const SERVICE_STATUS_COMMAND: &str = "sudo systemctl status ravendb";

/// Seconds the package index refresh and the liveness poll may each take.
const REMOTE_LOOP_TIMEOUT_SECS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootWait {
    pub checks: usize,
    pub interval: Duration,
}

impl Default for BootWait {
    fn default() -> Self {
        Self { checks: 20, interval: Duration::from_secs(1) }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeployOptions {
    pub concurrency: Concurrency,
    /// Assume the package is already installed.
    pub skip_install: bool,
    pub connect: ConnectPolicy,
    pub boot_wait: BootWait,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("bundle for node {tag} has no server certificate (.pfx)")]
    MissingCertificate { tag: String },
    #[error("no public URL for host {index}")]
    NoPublicUrl { index: usize },
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Remote(#[from] DeployError),
    #[error("DNS check failed")]
    Dns(#[from] DnsError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Upload {
    path: String,
    content: Vec<u8>,
    /// Create the parent directory first.
    make_parent: bool,
}

/// Everything one host needs, worked out before connecting to it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct HostPlan {
    tag: String,
    public_url: String,
    /// The shared bundle carries a license.
    has_license: bool,
    uploads: Vec<Upload>,
}

impl HostPlan {
    fn new(spec: &ClusterSpec, index: usize) -> Result<Self, ProvisionError> {
        let tag = tag_for_index(index)?;
        let license = spec
            .shared_bundle()
            .map(|bundle| bundle.license.clone())
            .filter(|license| !license.is_empty());
        let source = spec
            .url
            .list
            .get(index)
            .ok_or(ProvisionError::NoPublicUrl { index })?;
        let public = settings::public_urls(
            &tag,
            source,
            spec.security,
            spec.http_port(),
            spec.tcp_port(),
        )?;

        let has_license = license.is_some();
        let mut uploads: Vec<Upload> = license
            .into_iter()
            .map(|content| Upload {
                path: settings::LICENSE_PATH.to_string(),
                content,
                make_parent: false,
            })
            .collect();

        if let Some(bundle) = spec.node_bundle(index) {
            let template = settings::parse_template(&tag, &bundle.settings_json)?;
            let computed = settings::computed_settings(
                spec.security,
                spec.http_port(),
                spec.tcp_port(),
                &public,
            );
            let effective = settings::effective_settings(
                template,
                computed,
                &spec.settings_overrides,
            );
            uploads.push(Upload {
                path: format!("/etc/ravendb/{}", settings::SETTINGS_FILE_NAME),
                content: settings::render(&effective)?,
                make_parent: false,
            });

            if spec.security.is_secured() {
                if bundle.pfx.is_empty() {
                    return Err(ProvisionError::MissingCertificate { tag });
                }
                uploads.push(Upload {
                    path: settings::CERTIFICATE_PATH.to_string(),
                    content: bundle.pfx.clone(),
                    make_parent: false,
                });
            }
        }

        uploads.extend(spec.assets.iter().map(|(path, content)| Upload {
            path: path.clone(),
            content: content.clone(),
            make_parent: true,
        }));

        Ok(Self { tag, public_url: public.http, has_license, uploads })
    }
}

fn install_commands(spec: &ClusterSpec) -> Vec<String> {
    vec![
        format!("wget -nv -O {LOCAL_PACKAGE_FILE} {}", package_url(&spec.package)),
        format!(
            "timeout {REMOTE_LOOP_TIMEOUT_SECS} bash -c -- 'while ! sudo \
             apt-get update -y; do sleep 1; done'"
        ),
        format!("sudo apt-get install -y -f ./{LOCAL_PACKAGE_FILE}"),
    ]
}

fn start_commands(plan: &HostPlan) -> Vec<String> {
    let public_url = &plan.public_url;
    let mut commands = Vec::new();
    if plan.has_license {
        commands.push(format!(
            "sudo chown {} {}",
            remote_exec::SERVICE_OWNER,
            remote_exec::quote(settings::LICENSE_PATH)
        ));
    }
    commands.extend([
        "sudo systemctl restart ravendb".to_string(),
        format!(
            "timeout {REMOTE_LOOP_TIMEOUT_SECS} bash -c -- 'while ! curl \
             -vvv -k {public_url}/setup/alive; do echo \"Curl failed with \
             exit code $?\"; sleep 1; done'"
        ),
    ]);
    commands
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Polls for the cloud-init marker. Returns whether the host reported
/// itself booted before the checks ran out.
pub async fn wait_for_boot(
    host: &RemoteHost,
    wait: BootWait,
    log: &Logger,
) -> Result<bool, DeployError> {
    let command = format!("test -f {BOOT_FINISHED_MARKER}");
    for check in 1..=wait.checks {
        if host.probe(&command).await? {
            debug!(log, "host finished booting"; "check" => check);
            return Ok(true);
        }
        if check < wait.checks {
            tokio::time::sleep(wait.interval).await;
        }
    }
    Ok(false)
}

/// Deploys every host of `spec`.
pub async fn deploy_fleet(
    spec: Arc<ClusterSpec>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn HostResolver>,
    options: DeployOptions,
    log: &Logger,
) -> Result<(), FleetError<ProvisionError>> {
    info!(
        log,
        "deploying cluster";
        "hosts" => spec.hosts.len(),
        "version" => &spec.package.version,
        "concurrency" => ?options.concurrency,
    );
    for_each_host(&spec.hosts, options.concurrency, |index, host| {
        let spec = Arc::clone(&spec);
        let connector = Arc::clone(&connector);
        let resolver = Arc::clone(&resolver);
        let log = log.clone();
        async move {
            deploy_host(&spec, index, host, &*connector, &*resolver, options, &log)
                .await
        }
    })
    .await?;
    Ok(())
}

/// Runs the whole sequence against one host.
pub async fn deploy_host(
    spec: &ClusterSpec,
    index: usize,
    host: IpAddr,
    connector: &dyn Connector,
    resolver: &dyn HostResolver,
    options: DeployOptions,
    log: &Logger,
) -> Result<(), ProvisionError> {
    let plan = HostPlan::new(spec, index)?;
    let log = log.new(o!(
        "host" => host.to_string(),
        "node" => plan.tag.clone(),
    ));

    let remote =
        connect_with_retry(connector, &host.to_string(), options.connect, &log)
            .await?;
    let result = run_plan(spec, &plan, &remote, host, resolver, options, &log).await;
    debug!(
        log,
        "session finished";
        "ok" => result.is_ok(),
        "transcript" => remote.transcript().contents(),
    );
    remote.close().await;

    match &result {
        Ok(()) => info!(log, "node deployed"; "url" => &plan.public_url),
        Err(err) => warn!(log, "node deployment failed"; crate::InlineErrorChain::new(err)),
    }
    result
}

async fn run_plan(
    spec: &ClusterSpec,
    plan: &HostPlan,
    remote: &RemoteHost,
    host: IpAddr,
    resolver: &dyn HostResolver,
    options: DeployOptions,
    log: &Logger,
) -> Result<(), ProvisionError> {
    if !wait_for_boot(remote, options.boot_wait, log).await? {
        warn!(log, "host never reported boot-finished; continuing");
    }

    if options.skip_install {
        info!(log, "skipping package installation");
    } else {
        info!(log, "installing package"; "url" => package_url(&spec.package));
        remote.run_sequence(&install_commands(spec), None).await?;
    }

    for upload in &plan.uploads {
        if upload.make_parent {
            remote
                .run_sequence(
                    &[format!(
                        "sudo mkdir -p {}",
                        remote_exec::quote(parent_dir(&upload.path))
                    )],
                    None,
                )
                .await?;
        }
        remote.upload(&upload.path, &upload.content).await?;
    }

    verify_resolution(resolver, &plan.public_url, host).await?;

    info!(log, "starting service");
    remote
        .run_sequence(
            &start_commands(plan),
            Some(SERVICE_STATUS_COMMAND),
        )
        .await?;
    Ok(())
}
