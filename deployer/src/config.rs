// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment file and logging configuration.

use crate::bundle::extract_bundles;
use crate::bundle::BundleError;
use crate::model::tag_for_index;
use crate::model::Architecture;
use crate::model::ClusterSpec;
use crate::model::Database;
use crate::model::DatabaseToDelete;
use crate::model::Index;
use crate::model::IndexesToDelete;
use crate::model::ModelError;
use crate::model::Package;
use crate::model::SecurityMode;
use crate::model::UrlConfig;
use crate::model::MAX_NODES;
use crate::reconcile::DEFAULT_REPLICATION_NODE;
use crate::settings;
use crate::settings::SettingValue;
use crate::settings::SettingsError;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use remote_exec::SshCredential;
use remote_exec::DEFAULT_SSH_PORT;
use serde::Deserialize;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::net::IpAddr;

pub const DEFAULT_HEALTHCHECK_DATABASE: &str = "healthcheck";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("setup archive {path}")]
    Bundle {
        path: Utf8PathBuf,
        #[source]
        err: BundleError,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no hosts configured")]
    NoHosts,
    #[error("{hosts} hosts configured, at most {MAX_NODES} are supported")]
    TooManyHosts { hosts: usize },
    #[error("url.list has {found} entries but {expected} hosts are configured")]
    UrlCount { expected: usize, found: usize },
    #[error("package.arch: {0}")]
    Architecture(String),
    #[error("ssh.user must not be empty")]
    EmptySshUser,
    #[error(
        "database {database:?} has an encryption key but the cluster is \
         unsecured"
    )]
    KeyWithoutTls { database: String },
    #[error("failed to open log file {path}")]
    LogFile {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// The deployment file.
///
/// Relative paths inside it are resolved against the directory holding the
/// file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub hosts: Vec<IpAddr>,
    /// Cluster setup zip holding the license, certificates and per-node
    /// settings.
    pub setup_archive: Utf8PathBuf,
    #[serde(default)]
    pub unsecured: bool,
    pub package: PackageConfig,
    #[serde(default)]
    pub url: UrlSection,
    pub ssh: SshConfig,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
    /// Extra files to install: absolute remote path to local file.
    #[serde(default)]
    pub assets: BTreeMap<String, Utf8PathBuf>,
    #[serde(default = "default_healthcheck_database")]
    pub healthcheck_database: String,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub databases_to_delete: Vec<DatabaseToDelete>,
    #[serde(default)]
    pub indexes_to_delete: Vec<IndexesToDelete>,
    #[serde(default)]
    pub log: LogConfig,

    #[serde(skip)]
    base_dir: Utf8PathBuf,
}

fn default_healthcheck_database() -> String {
    DEFAULT_HEALTHCHECK_DATABASE.to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageConfig {
    pub version: String,
    /// `amd64` (the default), `arm64` or `arm32`.
    #[serde(default)]
    pub arch: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlSection {
    /// Public URL per host, used for hosts whose settings.json names none.
    #[serde(default)]
    pub list: Vec<String>,
    /// Zero picks the security mode's default.
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub tcp_port: u16,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub user: String,
    pub private_key: Utf8PathBuf,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Defaults to `["A"]`.
    #[serde(default)]
    pub replication_nodes: Vec<String>,
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub indexes: Vec<Index>,
}

impl ClusterConfig {
    pub fn from_file(path: &Utf8Path) -> Result<ClusterConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Read { path: path.to_owned(), err })?;
        let mut config: ClusterConfig = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.to_owned(), err })?;
        config.base_dir =
            path.parent().map(Utf8Path::to_owned).unwrap_or_default();
        Ok(config)
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }

    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, ConfigError> {
        let path = self.resolve(path);
        std::fs::read(&path).map_err(|err| ConfigError::Read { path, err })
    }

    pub fn security(&self) -> SecurityMode {
        if self.unsecured {
            SecurityMode::Unsecured
        } else {
            SecurityMode::Secured
        }
    }

    /// Reads every file the deployment refers to and checks that the result
    /// describes a cluster that can be deployed.
    pub fn into_spec(self) -> Result<ClusterSpec, ConfigError> {
        let security = self.security();
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if self.hosts.len() > MAX_NODES {
            return Err(ConfigError::TooManyHosts { hosts: self.hosts.len() });
        }
        if self.ssh.user.trim().is_empty() {
            return Err(ConfigError::EmptySshUser);
        }
        if !self.url.list.is_empty() && self.url.list.len() != self.hosts.len()
        {
            return Err(ConfigError::UrlCount {
                expected: self.hosts.len(),
                found: self.url.list.len(),
            });
        }
        let arch: Architecture =
            self.package.arch.parse().map_err(ConfigError::Architecture)?;

        let archive = self.read(&self.setup_archive)?;
        let bundles = extract_bundles(&archive).map_err(|err| {
            ConfigError::Bundle { path: self.resolve(&self.setup_archive), err }
        })?;
        let private_key = self.read(&self.ssh.private_key)?;
        let mut assets = BTreeMap::new();
        for (remote, local) in &self.assets {
            assets.insert(remote.clone(), self.read(local)?);
        }

        let databases = self
            .databases
            .into_iter()
            .map(|db| {
                if !security.is_secured()
                    && db.encryption_key.iter().any(|k| !k.trim().is_empty())
                {
                    return Err(ConfigError::KeyWithoutTls { database: db.name });
                }
                let replication_nodes = if db.replication_nodes.is_empty() {
                    vec![DEFAULT_REPLICATION_NODE.to_string()]
                } else {
                    db.replication_nodes
                };
                Ok(Database {
                    name: db.name,
                    settings: db.settings,
                    replication_nodes,
                    encryption_key: db.encryption_key,
                    indexes: db.indexes,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut spec = ClusterSpec {
            hosts: self.hosts,
            package: Package { version: self.package.version, arch },
            url: UrlConfig {
                list: Vec::new(),
                http_port: self.url.http_port,
                tcp_port: self.url.tcp_port,
            },
            ssh: SshCredential {
                user: self.ssh.user,
                private_key: String::from_utf8_lossy(&private_key).into_owned(),
                port: self.ssh.port.unwrap_or(DEFAULT_SSH_PORT),
            },
            security,
            bundles,
            settings_overrides: self.settings,
            assets,
            healthcheck_database: self.healthcheck_database,
            databases,
            databases_to_delete: self.databases_to_delete,
            indexes_to_delete: self.indexes_to_delete,
        };
        spec.url.list = public_url_list(&spec, &self.url.list)?;
        Ok(spec)
    }
}

/// Public http URL of every host: taken from the node's settings.json when
/// its bundle has one, else from `configured`.
fn public_url_list(
    spec: &ClusterSpec,
    configured: &[String],
) -> Result<Vec<String>, ConfigError> {
    let (http_port, tcp_port) = (spec.http_port(), spec.tcp_port());
    let mut list = Vec::with_capacity(spec.hosts.len());
    for index in 0..spec.hosts.len() {
        let tag = tag_for_index(index)?;
        let source = match spec.node_bundle(index) {
            Some(bundle) if !bundle.settings_json.is_empty() => {
                let template =
                    settings::parse_template(&tag, &bundle.settings_json)?;
                settings::template_url(&tag, &template, spec.security)
            }
            _ => Err(SettingsError::MissingUrl {
                file: settings::SETTINGS_FILE_NAME,
                tag: tag.clone(),
                key: if spec.security.is_secured() {
                    settings::PUBLIC_SERVER_URL
                } else {
                    settings::SERVER_URL
                },
            }),
        };
        let source = match (source, configured.get(index)) {
            (Ok(url), _) => url,
            (Err(SettingsError::MissingUrl { .. }), Some(url)) => url.clone(),
            (Err(err), _) => return Err(err.into()),
        };
        let urls = settings::public_urls(
            &tag,
            &source,
            spec.security,
            http_port,
            tcp_port,
        )?;
        list.push(urls.http);
    }
    Ok(list)
}

/// Where log records go.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LogConfig {
    StderrTerminal {
        #[serde(default)]
        level: LogLevel,
    },
    File {
        #[serde(default)]
        level: LogLevel,
        path: Utf8PathBuf,
        #[serde(default)]
        if_exists: LogIfExists,
    },
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::StderrTerminal { level: LogLevel::default() }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogIfExists {
    Fail,
    Truncate,
    #[default]
    Append,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}

impl LogConfig {
    /// Builds the root logger. Records are written from a background
    /// thread, so the returned logger must be kept alive until the last
    /// record has been logged.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, ConfigError> {
        match self {
            LogConfig::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().stderr().build();
                let drain = slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }
            LogConfig::File { level, path, if_exists } => {
                let file_error =
                    |err| ConfigError::LogFile { path: path.clone(), err };
                if let Some(parent) =
                    path.parent().filter(|p| !p.as_str().is_empty())
                {
                    std::fs::create_dir_all(parent).map_err(file_error)?;
                }
                let mut open = OpenOptions::new();
                open.write(true).create(true);
                match if_exists {
                    LogIfExists::Fail => open.create_new(true),
                    LogIfExists::Append => open.append(true),
                    LogIfExists::Truncate => open.truncate(true),
                };
                let file = open.open(path).map_err(file_error)?;
                let drain = slog_bunyan::with_name(name, file).build().fuse();
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

fn async_root_logger<T>(level: LogLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let level_drain = slog::LevelFilter(drain, level.into()).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("pid" => std::process::id()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bundle::test::archive;
    use camino_tempfile::Utf8TempDir;
    use slog::info;

    struct Fixture {
        dir: Utf8TempDir,
    }

    impl Fixture {
        /// A directory holding an SSH key, an asset and a setup archive for
        /// nodes `a.db.example.com` and `b.db.example.com`.
        fn new(archive_files: &[(&str, &[u8])]) -> Fixture {
            let dir = camino_tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("id_ed25519"), "PRIVATE KEY").unwrap();
            std::fs::create_dir(dir.path().join("files")).unwrap();
            std::fs::write(dir.path().join("files/plugin.conf"), "plugin")
                .unwrap();
            std::fs::write(dir.path().join("cluster.zip"), archive(archive_files))
                .unwrap();
            Fixture { dir }
        }

        fn secured() -> Fixture {
            Fixture::new(&[
                ("license.json", b"{\"Id\":\"license\"}"),
                ("admin.client.certificate.crt", b"CLIENT CERT"),
                ("admin.client.certificate.key", b"CLIENT KEY"),
                ("A/server.pfx", b"pfx-a"),
                (
                    "A/settings.json",
                    br#"{"PublicServerUrl":"https://a.db.example.com:443"}"#,
                ),
                ("B/server.pfx", b"pfx-b"),
                (
                    "B/settings.json",
                    br#"{"PublicServerUrl":"https://b.db.example.com"}"#,
                ),
            ])
        }

        fn write_config(&self, body: &str) -> Utf8PathBuf {
            let path = self.dir.path().join("deploy.toml");
            std::fs::write(&path, body).unwrap();
            path
        }
    }

    const BASE: &str = r#"
        hosts = ["10.0.0.1", "10.0.0.2"]
        setup_archive = "cluster.zip"

        [package]
        version = "6.0.105"

        [ssh]
        user = "ubuntu"
        private_key = "id_ed25519"
    "#;

    #[test]
    fn secured_deployment_file() {
        let fixture = Fixture::secured();
        let path = fixture.write_config(&format!(
            r#"{BASE}
            [settings]
            "Logs.Mode" = "Operations"
            "Indexing.MaxNumberOfConcurrentlyRunningIndexes" = 4

            [assets]
            "/etc/ravendb/plugin.conf" = "files/plugin.conf"

            [[databases]]
            name = "orders"
            encryption_key = "c2VjcmV0"

            [[databases.indexes]]
            name = "Orders/ByCompany"
            maps = ["from o in docs.Orders select new {{ o.Company }}"]

            [[databases]]
            name = "audit"
            replication_nodes = ["A", "B"]

            [[databases_to_delete]]
            name = "scratch"
            hard_delete = true

            [[indexes_to_delete]]
            database = "orders"
            index_names = ["Old/Index"]
            "#
        ));

        let spec = ClusterConfig::from_file(&path).unwrap().into_spec().unwrap();

        assert_eq!(spec.security, SecurityMode::Secured);
        assert_eq!(spec.package.arch, Architecture::Amd64);
        assert_eq!(spec.ssh.port, 22);
        assert_eq!(spec.ssh.private_key, "PRIVATE KEY");
        assert_eq!(spec.healthcheck_database, "healthcheck");
        assert_eq!(
            spec.url.list,
            ["https://a.db.example.com", "https://b.db.example.com"]
        );
        assert!(spec.shared_bundle().unwrap().has_client_credential());
        assert_eq!(spec.node_bundle(1).unwrap().pfx, b"pfx-b");
        assert_eq!(spec.assets["/etc/ravendb/plugin.conf"], b"plugin");
        assert_eq!(
            spec.settings_overrides["Logs.Mode"],
            SettingValue::from("Operations")
        );
        assert_eq!(
            spec.settings_overrides
                ["Indexing.MaxNumberOfConcurrentlyRunningIndexes"]
                .to_string(),
            "4"
        );

        assert_eq!(spec.databases[0].replication_nodes, ["A"]);
        assert_eq!(spec.databases[0].key(), Some("c2VjcmV0"));
        assert_eq!(spec.databases[0].indexes[0].reduce, "");
        assert_eq!(spec.databases[1].replication_nodes, ["A", "B"]);
        assert!(spec.databases_to_delete[0].hard_delete);
        assert_eq!(spec.indexes_to_delete[0].index_names, ["Old/Index"]);
    }

    fn unsecured_base() -> String {
        BASE.replacen(
            "setup_archive = \"cluster.zip\"",
            "setup_archive = \"cluster.zip\"\nunsecured = true",
            1,
        )
    }

    #[test]
    fn unsecured_urls_keep_non_default_ports() {
        let fixture = Fixture::new(&[
            ("license.json", b"{}"),
            ("A/settings.json", br#"{"ServerUrl":"http://a.db.example.com"}"#),
        ]);
        let path = fixture.write_config(&format!(
            r#"{}
            [url]
            list = ["http://ignored.example.com", "http://b.db.example.com:9999"]
            "#,
            unsecured_base()
        ));

        let spec = ClusterConfig::from_file(&path).unwrap().into_spec().unwrap();

        assert_eq!(spec.security, SecurityMode::Unsecured);
        assert_eq!(spec.http_port(), 8080);
        // Node A's settings.json wins over the configured list; node B has
        // none.
        assert_eq!(
            spec.url.list,
            ["http://a.db.example.com:8080", "http://b.db.example.com:8080"]
        );
    }

    #[test]
    fn encryption_keys_need_a_secured_cluster() {
        let fixture = Fixture::new(&[
            ("license.json", b"{}"),
            ("A/settings.json", br#"{"ServerUrl":"http://a.db.example.com"}"#),
            ("B/settings.json", br#"{"ServerUrl":"http://b.db.example.com"}"#),
        ]);
        let body = unsecured_base();
        let path = fixture.write_config(&format!(
            r#"{body}
            [[databases]]
            name = "vault"
            encryption_key = "c2VjcmV0"
            "#
        ));

        let err = ClusterConfig::from_file(&path).unwrap().into_spec().unwrap_err();
        assert!(
            matches!(&err, ConfigError::KeyWithoutTls { database } if database == "vault"),
            "{err}"
        );
    }

    #[test]
    fn missing_public_url_names_settings_json() {
        let fixture = Fixture::new(&[
            ("license.json", b"{}"),
            ("A/server.pfx", b"pfx-a"),
            ("A/settings.json", br#"{"PublicServerUrl":"https://a.db.example.com"}"#),
            ("B/server.pfx", b"pfx-b"),
            ("B/settings.json", br#"{"ServerUrl":"https://0.0.0.0"}"#),
        ]);
        let path = fixture.write_config(BASE);

        let err = ClusterConfig::from_file(&path).unwrap().into_spec().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("settings.json"), "{message}");
        assert!(message.contains("PublicServerUrl"), "{message}");
    }

    #[test]
    fn configuration_mistakes_are_reported() {
        let fixture = Fixture::secured();

        let path = fixture.write_config(&BASE.replace(
            r#"hosts = ["10.0.0.1", "10.0.0.2"]"#,
            "hosts = []",
        ));
        assert!(matches!(
            ClusterConfig::from_file(&path).unwrap().into_spec(),
            Err(ConfigError::NoHosts)
        ));

        let path = fixture.write_config(&format!(
            "{BASE}\n[url]\nlist = [\"https://a.db.example.com\"]\n"
        ));
        assert!(matches!(
            ClusterConfig::from_file(&path).unwrap().into_spec(),
            Err(ConfigError::UrlCount { expected: 2, found: 1 })
        ));

        let path = fixture.write_config(&BASE.replace(
            "version = \"6.0.105\"",
            "version = \"6.0.105\"\narch = \"sparc\"",
        ));
        assert!(matches!(
            ClusterConfig::from_file(&path).unwrap().into_spec(),
            Err(ConfigError::Architecture(_))
        ));

        let path = fixture.write_config(&BASE.replace("id_ed25519", "missing"));
        let err = ClusterConfig::from_file(&path).unwrap().into_spec().unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");

        let path = fixture.write_config(&format!("{BASE}\nsurprise = 1\n"));
        assert!(matches!(
            ClusterConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn log_table_selects_the_drain() {
        let log: LogConfig = toml::from_str(
            r#"
            mode = "file"
            level = "debug"
            path = "/var/log/deployer.log"
            if_exists = "truncate"
            "#,
        )
        .unwrap();
        assert_eq!(
            log,
            LogConfig::File {
                level: LogLevel::Debug,
                path: "/var/log/deployer.log".into(),
                if_exists: LogIfExists::Truncate,
            }
        );

        let log: LogConfig = toml::from_str(r#"mode = "stderr-terminal""#).unwrap();
        assert_eq!(log, LogConfig::default());
    }

    #[test]
    fn file_logger_honours_if_exists() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/deployer.log");
        let config = |if_exists| LogConfig::File {
            level: LogLevel::Info,
            path: path.clone(),
            if_exists,
        };

        {
            let log = config(LogIfExists::Fail).to_logger("test").unwrap();
            info!(log, "first");
        }
        assert!(matches!(
            config(LogIfExists::Fail).to_logger("test"),
            Err(ConfigError::LogFile { .. })
        ));
        {
            let log = config(LogIfExists::Append).to_logger("test").unwrap();
            info!(log, "second");
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
        assert!(contents.contains("\"name\":\"test\""));
    }
}
