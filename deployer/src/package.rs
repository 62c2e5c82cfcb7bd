// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where server packages come from.

use crate::model::Architecture;
use crate::model::Package;
use slog::info;
use slog::Logger;
use std::time::Duration;

pub const DOWNLOAD_BASE_URL: &str =
    "https://daily-builds.s3.us-east-1.amazonaws.com";

/// Name the package is downloaded to on each host.
pub const LOCAL_PACKAGE_FILE: &str = "ravendb.deb";

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("package version must not be empty")]
    NoVersion,
    #[error("failed to check package {url}")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("package {url} is not available (HTTP {status})")]
    Unavailable { url: String, status: u16 },
}

impl Architecture {
    /// Suffix that follows the version in the package file name.
    pub fn package_suffix(self) -> &'static str {
        match self {
            Architecture::Amd64 => "-0_amd64.deb",
            Architecture::Arm64 => "_linux-arm64",
            Architecture::Arm32 => "-0_armhf.deb",
        }
    }
}

impl std::str::FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "amd64" => Ok(Architecture::Amd64),
            "arm64" => Ok(Architecture::Arm64),
            "arm32" => Ok(Architecture::Arm32),
            other => Err(format!(
                "unknown architecture {other:?} (expected amd64, arm64 or \
                 arm32)"
            )),
        }
    }
}

pub fn package_url(package: &Package) -> String {
    format!(
        "{DOWNLOAD_BASE_URL}/ravendb_{}{}",
        package.version,
        package.arch.package_suffix()
    )
}

/// Confirms the package for `package` can be downloaded.
pub async fn check_available(
    package: &Package,
    log: &Logger,
) -> Result<String, PackageError> {
    if package.version.trim().is_empty() {
        return Err(PackageError::NoVersion);
    }
    let url = package_url(package);
    let client = reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .build()
        .map_err(|err| PackageError::Request { url: url.clone(), err })?;
    let response = client
        .head(&url)
        .send()
        .await
        .map_err(|err| PackageError::Request { url: url.clone(), err })?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(PackageError::Unavailable { url, status: status.as_u16() });
    }
    info!(log, "package is available"; "url" => &url);
    Ok(url)
}
