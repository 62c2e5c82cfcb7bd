// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checking that a node's public name points back at the node.

use async_trait::async_trait;
use hickory_resolver::ResolveError;
use hickory_resolver::TokioResolver;
use slog::debug;
use slog::Logger;
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("failed to set up DNS resolver from system configuration")]
    Setup(#[source] ResolveError),
    #[error("failed to resolve {name}")]
    Lookup {
        name: String,
        #[source]
        err: ResolveError,
    },
    #[error("invalid public URL {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        err: url::ParseError,
    },
    #[error("public URL {url:?} has no host")]
    NoHost { url: String },
    #[error(
        "{name} resolves to [{}], which does not include this node's \
         address {expected}",
        join(.resolved)
    )]
    Mismatch { name: String, resolved: Vec<IpAddr>, expected: IpAddr },
}

fn join(ips: &[IpAddr]) -> String {
    ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Resolves through the system's configured nameservers.
pub struct SystemResolver {
    log: Logger,
    resolver: TokioResolver,
}

impl SystemResolver {
    pub fn new(log: Logger) -> Result<Self, DnsError> {
        let resolver =
            TokioResolver::builder_tokio().map_err(DnsError::Setup)?.build();
        Ok(Self { log, resolver })
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        debug!(self.log, "resolving"; "name" => name);
        let response = self.resolver.lookup_ip(name).await.map_err(|err| {
            DnsError::Lookup { name: name.to_string(), err }
        })?;
        Ok(response.iter().collect())
    }
}

/// Fails unless the host of `public_url` resolves to a set of addresses that
/// includes `expected`. IP literals are compared as they are.
pub async fn verify_resolution(
    resolver: &dyn HostResolver,
    public_url: &str,
    expected: IpAddr,
) -> Result<(), DnsError> {
    let parsed = url::Url::parse(public_url).map_err(|err| {
        DnsError::InvalidUrl { url: public_url.to_string(), err }
    })?;
    let (name, resolved) = match parsed.host() {
        Some(url::Host::Domain(name)) => {
            (name.to_string(), resolver.lookup(name).await?)
        }
        Some(url::Host::Ipv4(ip)) => (ip.to_string(), vec![IpAddr::V4(ip)]),
        Some(url::Host::Ipv6(ip)) => (ip.to_string(), vec![IpAddr::V6(ip)]),
        None => {
            return Err(DnsError::NoHost { url: public_url.to_string() });
        }
    };
    if resolved.contains(&expected) {
        Ok(())
    } else {
        Err(DnsError::Mismatch { name, resolved, expected })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::BTreeMap;

    /// Answers from a fixed table; unknown names resolve to nothing.
    #[derive(Default)]
    pub(crate) struct StaticResolver {
        names: BTreeMap<String, Vec<IpAddr>>,
    }

    impl StaticResolver {
        pub(crate) fn with(mut self, name: &str, ips: &[&str]) -> Self {
            let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
            self.names.insert(name.to_string(), ips);
            self
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
            Ok(self.names.get(name).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn matching_address_passes() {
        let resolver = StaticResolver::default()
            .with("a.db.example.com", &["10.0.0.4", "10.0.0.5"]);
        verify_resolution(
            &resolver,
            "https://a.db.example.com",
            "10.0.0.5".parse().unwrap(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn mismatch_lists_every_address() {
        let resolver = StaticResolver::default()
            .with("a.db.example.com", &["10.0.0.6", "10.0.0.7"]);
        let err = verify_resolution(
            &resolver,
            "https://a.db.example.com:8443",
            "10.0.0.5".parse().unwrap(),
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        for ip in ["10.0.0.5", "10.0.0.6", "10.0.0.7"] {
            assert!(message.contains(ip), "{ip} missing from {message}");
        }
    }

    #[tokio::test]
    async fn ip_literals_skip_the_lookup() {
        let resolver = StaticResolver::default();
        verify_resolution(
            &resolver,
            "http://10.0.0.5:8080",
            "10.0.0.5".parse().unwrap(),
        )
        .await
        .unwrap();
        assert!(verify_resolution(
            &resolver,
            "http://10.0.0.6:8080",
            "10.0.0.5".parse().unwrap(),
        )
        .await
        .is_err());
    }
}
