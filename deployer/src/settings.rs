// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server settings (`settings.json`): the per-node template, the keys the
//! deployer always controls, and the caller's overrides.

use crate::model::SecurityMode;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const LICENSE_PATH: &str = "/etc/ravendb/license.json";
pub const CERTIFICATE_PATH: &str = "/etc/ravendb/security/server.pfx";

pub const SERVER_URL: &str = "ServerUrl";
pub const SERVER_URL_TCP: &str = "ServerUrl.Tcp";
pub const PUBLIC_SERVER_URL: &str = "PublicServerUrl";
pub const PUBLIC_SERVER_URL_TCP: &str = "PublicServerUrl.Tcp";

/// A scalar setting value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl SettingValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::String(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::String(value)
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Number(n) => write!(f, "{n}"),
            SettingValue::String(s) => f.write_str(s),
        }
    }
}

pub type Settings = BTreeMap<String, SettingValue>;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{file} of node {tag} is not a JSON object")]
    Parse {
        file: &'static str,
        tag: String,
        #[source]
        err: serde_json::Error,
    },
    #[error("{file} of node {tag} has a non-scalar value for {key:?}")]
    NonScalar { file: &'static str, tag: String, key: String },
    #[error(
        "{key:?} setting was not found in {file} of node {tag}; verify the \
         setup archive"
    )]
    MissingUrl { file: &'static str, tag: String, key: &'static str },
    #[error("{key:?} in {file} of node {tag} is not a valid URL: {url:?}")]
    InvalidUrl {
        file: &'static str,
        tag: String,
        key: &'static str,
        url: String,
        #[source]
        err: url::ParseError,
    },
    #[error("{url:?} has no host")]
    NoHost { url: String },
    #[error("failed to render settings")]
    Render(#[source] serde_json::Error),
}

/// Parses a node's settings template. Nulls are dropped.
pub fn parse_template(tag: &str, json: &[u8]) -> Result<Settings, SettingsError> {
    if json.iter().all(u8::is_ascii_whitespace) {
        return Ok(Settings::new());
    }
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(json).map_err(|err| SettingsError::Parse {
            file: SETTINGS_FILE_NAME,
            tag: tag.to_string(),
            err,
        })?;
    let mut settings = Settings::new();
    for (key, value) in object {
        let value = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(b) => SettingValue::Bool(b),
            serde_json::Value::Number(n) => SettingValue::Number(n),
            serde_json::Value::String(s) => SettingValue::String(s),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(SettingsError::NonScalar {
                    file: SETTINGS_FILE_NAME,
                    tag: tag.to_string(),
                    key,
                });
            }
        };
        settings.insert(key, value);
    }
    Ok(settings)
}

/// Reads back an installed `settings.json` for display.
///
/// This is lossy: every value becomes a string (booleans and numbers in
/// their JSON spelling, nulls empty, arrays and objects as compact JSON).
pub fn normalize(tag: &str, json: &[u8]) -> Result<BTreeMap<String, String>, SettingsError> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(json).map_err(|err| SettingsError::Parse {
            file: SETTINGS_FILE_NAME,
            tag: tag.to_string(),
            err,
        })?;
    Ok(object
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Public endpoints of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicUrls {
    pub http: String,
    pub tcp: String,
}

/// Returns the URL in `template` that names the node publicly:
/// `PublicServerUrl` when secured, `ServerUrl` otherwise.
pub fn template_url(
    tag: &str,
    template: &Settings,
    security: SecurityMode,
) -> Result<String, SettingsError> {
    let key = if security.is_secured() { PUBLIC_SERVER_URL } else { SERVER_URL };
    template
        .get(key)
        .and_then(SettingValue::as_str)
        .filter(|url| !url.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| SettingsError::MissingUrl {
            file: SETTINGS_FILE_NAME,
            tag: tag.to_string(),
            key,
        })
}

/// Rebuilds the public URLs of a node from the host named by `source`.
///
/// The http port is left out when it is the one the scheme implies.
pub fn public_urls(
    tag: &str,
    source: &str,
    security: SecurityMode,
    http_port: u16,
    tcp_port: u16,
) -> Result<PublicUrls, SettingsError> {
    let key = if security.is_secured() { PUBLIC_SERVER_URL } else { SERVER_URL };
    let parsed = url::Url::parse(source).map_err(|err| SettingsError::InvalidUrl {
        file: SETTINGS_FILE_NAME,
        tag: tag.to_string(),
        key,
        url: source.to_string(),
        err,
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SettingsError::NoHost { url: source.to_string() })?;

    let mut http = format!("{}://{host}", security.scheme());
    if http_port != security.implied_port() {
        http.push_str(&format!(":{http_port}"));
    }
    Ok(PublicUrls { http, tcp: format!("tcp://{host}:{tcp_port}") })
}

/// Keys the deployer always sets, whatever the template says.
pub fn computed_settings(
    security: SecurityMode,
    http_port: u16,
    tcp_port: u16,
    public: &PublicUrls,
) -> Settings {
    let mut settings = Settings::new();
    settings.insert(
        SERVER_URL.to_string(),
        format!("{}://0.0.0.0:{http_port}", security.scheme()).into(),
    );
    settings.insert(
        SERVER_URL_TCP.to_string(),
        format!("tcp://0.0.0.0:{tcp_port}").into(),
    );
    settings.insert("License.Path".to_string(), LICENSE_PATH.into());
    settings.insert("Setup.Mode".to_string(), "None".into());
    match security {
        SecurityMode::Secured => {
            settings.insert(
                PUBLIC_SERVER_URL.to_string(),
                public.http.clone().into(),
            );
            settings.insert(
                PUBLIC_SERVER_URL_TCP.to_string(),
                public.tcp.clone().into(),
            );
            settings.insert(
                "Security.Certificate.Path".to_string(),
                CERTIFICATE_PATH.into(),
            );
            settings.insert("License.Eula.Accepted".to_string(), true.into());
        }
        SecurityMode::Unsecured => {
            settings.insert(
                "Security.UnsecuredAccessAllowed".to_string(),
                "PublicNetwork".into(),
            );
        }
    }
    settings
}

/// Layers `template`, then `computed`, then `overrides`; later layers win.
pub fn effective_settings(
    template: Settings,
    computed: Settings,
    overrides: &Settings,
) -> Settings {
    let mut settings = template;
    settings.extend(computed);
    settings.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    settings
}

pub fn render(settings: &Settings) -> Result<Vec<u8>, SettingsError> {
    serde_json::to_vec_pretty(settings).map_err(SettingsError::Render)
}

#[cfg(test)]
mod test {
    use super::*;

    fn urls(security: SecurityMode, http: u16, tcp: u16) -> PublicUrls {
        public_urls("A", "https://a.db.example.com:4433", security, http, tcp)
            .unwrap()
    }

    #[test]
    fn secured_public_urls_omit_the_https_port() {
        let public = urls(SecurityMode::Secured, 443, 38888);
        assert_eq!(public.http, "https://a.db.example.com");
        assert_eq!(public.tcp, "tcp://a.db.example.com:38888");

        let public = urls(SecurityMode::Secured, 8443, 38888);
        assert_eq!(public.http, "https://a.db.example.com:8443");
    }

    #[test]
    fn unsecured_public_urls_omit_only_port_80() {
        assert_eq!(
            urls(SecurityMode::Unsecured, 8080, 38881).http,
            "http://a.db.example.com:8080"
        );
        assert_eq!(
            urls(SecurityMode::Unsecured, 80, 38881).http,
            "http://a.db.example.com"
        );
    }

    #[test]
    fn overrides_win_over_computed_keys_over_template() {
        let template = parse_template(
            "A",
            br#"{
                "PublicServerUrl": "https://a.db.example.com",
                "ServerUrl": "https://0.0.0.0:9999",
                "Logs.Mode": "Information",
                "Indexing.MaxThreads": 4,
                "Unused": null
            }"#,
        )
        .unwrap();
        assert!(!template.contains_key("Unused"));

        let public = urls(SecurityMode::Secured, 443, 38888);
        let computed =
            computed_settings(SecurityMode::Secured, 443, 38888, &public);
        let mut overrides = Settings::new();
        overrides.insert("Logs.Mode".to_string(), "Operations".into());
        overrides.insert("Setup.Mode".to_string(), "Initial".into());

        let effective = effective_settings(template, computed, &overrides);
        assert_eq!(effective["ServerUrl"], "https://0.0.0.0:443".into());
        assert_eq!(effective["Logs.Mode"], "Operations".into());
        assert_eq!(effective["Setup.Mode"], "Initial".into());
        assert_eq!(effective["License.Eula.Accepted"], true.into());
        assert_eq!(effective["Indexing.MaxThreads"].to_string(), "4");
        assert_eq!(
            effective["PublicServerUrl.Tcp"],
            "tcp://a.db.example.com:38888".into()
        );
    }

    #[test]
    fn unsecured_mode_allows_public_access_without_certificates() {
        let public = urls(SecurityMode::Unsecured, 8080, 38881);
        let computed =
            computed_settings(SecurityMode::Unsecured, 8080, 38881, &public);
        assert_eq!(computed["ServerUrl"], "http://0.0.0.0:8080".into());
        assert_eq!(
            computed["Security.UnsecuredAccessAllowed"],
            "PublicNetwork".into()
        );
        assert!(!computed.contains_key("Security.Certificate.Path"));
        assert!(!computed.contains_key(PUBLIC_SERVER_URL));
    }

    #[test]
    fn missing_url_names_the_file_and_key() {
        let template = parse_template("B", br#"{"ServerUrl":"x"}"#).unwrap();
        let err =
            template_url("B", &template, SecurityMode::Secured).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("PublicServerUrl"), "{message}");
        assert!(message.contains("settings.json"), "{message}");

        assert_eq!(
            template_url("B", &template, SecurityMode::Unsecured).unwrap(),
            "x"
        );
    }

    #[test]
    fn non_scalar_template_values_are_rejected() {
        let err = parse_template("A", br#"{"Nested":{"a":1}}"#).unwrap_err();
        assert!(matches!(err, SettingsError::NonScalar { ref key, .. } if key == "Nested"));
    }

    #[test]
    fn read_back_coerces_everything_to_strings() {
        let settings = normalize(
            "A",
            br#"{"A":"x","B":true,"C":12,"D":null,"E":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(settings["A"], "x");
        assert_eq!(settings["B"], "true");
        assert_eq!(settings["C"], "12");
        assert_eq!(settings["D"], "");
        assert_eq!(settings["E"], "[1,2]");
    }
}
