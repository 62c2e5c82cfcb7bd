// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Certificate and secret material: the per-node bundles of a cluster setup
//! archive, the admin credential derived from an installed node, and the
//! display-safe hash of database encryption keys.

use crate::model::SHARED_BUNDLE_KEY;
use remote_exec::DeployError;
use remote_exec::RemoteHost;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::io::Read;

pub const LICENSE_FILE_NAME: &str = "license.json";

pub const INSTALLED_PFX_PATH: &str = "/etc/ravendb/security/server.pfx";
const CONVERTED_KEY_PATH: &str = "/etc/ravendb/security/server.key";
const CONVERTED_CERT_PATH: &str = "/etc/ravendb/security/server.crt";

/// Certificate material for one node tag, or for [`SHARED_BUNDLE_KEY`].
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct CertificateHolder {
    #[serde(serialize_with = "crate::model::base64_serde::serialize")]
    pub pfx: Vec<u8>,
    #[serde(serialize_with = "crate::model::base64_serde::serialize")]
    pub cert: Vec<u8>,
    #[serde(skip)]
    pub key: Vec<u8>,
    #[serde(serialize_with = "crate::model::base64_serde::serialize")]
    pub settings_json: Vec<u8>,
    #[serde(serialize_with = "crate::model::base64_serde::serialize")]
    pub license: Vec<u8>,
}

impl std::fmt::Debug for CertificateHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateHolder")
            .field("pfx", &self.pfx.len())
            .field("cert", &self.cert.len())
            .field("key", &"<redacted>")
            .field("settings_json", &self.settings_json.len())
            .field("license", &self.license.len())
            .finish()
    }
}

impl CertificateHolder {
    /// True if this bundle can authenticate an admin client.
    pub fn has_client_credential(&self) -> bool {
        !self.cert.is_empty() && !self.key.is_empty()
    }

    fn absorb(&mut self, file_name: &str, content: &[u8]) {
        let target = match extension(file_name) {
            Some("pfx") => &mut self.pfx,
            Some("crt") => &mut self.cert,
            Some("key") => &mut self.key,
            Some("json") if file_name == LICENSE_FILE_NAME => &mut self.license,
            Some("json") => &mut self.settings_json,
            _ => return,
        };
        target.extend_from_slice(content);
    }
}

fn extension(file_name: &str) -> Option<&str> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to open setup archive")]
    Open(#[source] zip::result::ZipError),
    #[error("failed to read {name:?} from setup archive")]
    Entry {
        name: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to read entry {index} of setup archive")]
    Index {
        index: usize,
        #[source]
        err: zip::result::ZipError,
    },
    #[error("failed to convert {INSTALLED_PFX_PATH} into a client credential")]
    Convert(#[source] DeployError),
}

/// Splits a cluster setup archive into certificate bundles.
///
/// Files at the top level belong to [`SHARED_BUNDLE_KEY`]; files inside a
/// top-level folder belong to the node whose tag is the folder name. Deeper
/// files are attributed to their top-level folder. Files are classified by
/// extension (`.pfx`, `.crt`, `.key`, `.json`); `license.json` is the
/// license and any other JSON file is the node's settings. Several files of
/// the same kind for one bundle are concatenated in archive order.
pub fn extract_bundles(
    archive: &[u8],
) -> Result<BTreeMap<String, CertificateHolder>, BundleError> {
    let mut zip =
        zip::ZipArchive::new(Cursor::new(archive)).map_err(BundleError::Open)?;
    let mut bundles: BTreeMap<String, CertificateHolder> = BTreeMap::new();

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| BundleError::Index { index, err })?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let (owner, file_name) = match name.split_once('/') {
            Some((folder, rest)) => {
                let file_name = rest.rsplit('/').next().unwrap_or(rest);
                (folder.to_string(), file_name.to_string())
            }
            None => (SHARED_BUNDLE_KEY.to_string(), name.clone()),
        };

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut content)
            .map_err(|err| BundleError::Entry { name: name.clone(), err })?;
        bundles.entry(owner).or_default().absorb(&file_name, &content);
    }
    Ok(bundles)
}

/// One-way, deterministic fingerprint of an encryption key, safe to print.
pub fn encryption_key_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Builds an admin credential from the certificate installed on `host`.
///
/// The pfx is split into PEM key and certificate on the host itself, both
/// are read back, and the temporary files are removed.
pub async fn convert_installed_certificate(
    host: &RemoteHost,
) -> Result<CertificateHolder, BundleError> {
    host.run_sequence(
        &[
            format!(
                "sudo openssl pkcs12 -in {INSTALLED_PFX_PATH} -nocerts -nodes \
                 -out {CONVERTED_KEY_PATH} -password pass:"
            ),
            format!(
                "sudo openssl pkcs12 -in {INSTALLED_PFX_PATH} -clcerts -nokeys \
                 -out {CONVERTED_CERT_PATH} -password pass:"
            ),
        ],
        None,
    )
    .await
    .map_err(BundleError::Convert)?;

    let key = host
        .read_file(CONVERTED_KEY_PATH)
        .await
        .map_err(BundleError::Convert)?;
    let cert = host
        .read_file(CONVERTED_CERT_PATH)
        .await
        .map_err(BundleError::Convert)?;

    host.run_sequence(
        &[
            format!("sudo rm {CONVERTED_KEY_PATH}"),
            format!("sudo rm {CONVERTED_CERT_PATH}"),
        ],
        None,
    )
    .await
    .map_err(BundleError::Convert)?;

    Ok(CertificateHolder { key, cert, ..Default::default() })
}
