//! Describes what a watcher resolves, and where the discovery backend lives.

use crate::health::HealthFilterMode;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// URL scheme of targets understood by [Target::from_str].
pub const TARGET_SCHEME: &str = "consul";

/// Backend address used when a target URL has no host.
pub const DEFAULT_BACKEND_ADDRESS: &str = "127.0.0.1:8500";

/// The logical name of a service registered with the discovery backend.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub struct ServiceName(Arc<str>);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ServiceName {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for ServiceName {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ServiceName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// Protocol used to talk to the discovery backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BackendScheme {
    #[default]
    Http,
    Https,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid target url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported target scheme '{0}'")]
    UnsupportedTargetScheme(String),

    #[error("path is missing in url")]
    MissingService,

    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("unsupported health parameter value: '{0}'")]
    UnsupportedHealthFilter(String),

    #[error("unsupported parameter: '{0}'")]
    UnsupportedParameter(String),
}

/// A fully validated description of what to resolve.
///
/// Only `service`, `tags` and `health_filter` influence the watcher itself;
/// the remaining fields are meant for whoever builds the
/// [crate::query::QueryPort].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Target {
    pub service: ServiceName,
    pub backend_address: String,
    pub backend_scheme: BackendScheme,

    /// Only instances carrying every one of these tags are resolved.
    pub tags: Vec<String>,
    pub health_filter: HealthFilterMode,
    pub access_token: Option<String>,
}

impl Target {
    /// A target for `service` on the default backend, with default options.
    pub fn new(service: impl Into<ServiceName>) -> Self {
        Self {
            service: service.into(),
            backend_address: DEFAULT_BACKEND_ADDRESS.to_string(),
            backend_scheme: BackendScheme::default(),
            tags: Vec::new(),
            health_filter: HealthFilterMode::default(),
            access_token: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_health_filter(mut self, health_filter: HealthFilterMode) -> Self {
        self.health_filter = health_filter;
        self
    }
}

/// Parses `consul://[<host[:port]>]/<service>[?<opt>[&<opt>]...]`.
///
/// Options (keys are case-insensitive, the last occurrence wins):
///
/// - `scheme=http|https`: protocol for the backend. Default: `http`
/// - `tags=<tag>[,<tag>]...`: only resolve instances carrying these tags.
/// - `health=healthy|fallbackToUnhealthy`: see [HealthFilterMode].
///   Default: `healthy`
/// - `token=<string>`: access token for backend requests.
impl FromStr for Target {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;
        if url.scheme() != TARGET_SCHEME {
            return Err(ParseError::UnsupportedTargetScheme(url.scheme().to_string()));
        }

        let service = url.path().strip_prefix('/').unwrap_or(url.path());
        if service.is_empty() {
            return Err(ParseError::MissingService);
        }
        let mut target = Target::new(service);

        match url.host_str() {
            Some(host) if !host.is_empty() => {
                target.backend_address = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
            }
            _ => (),
        }

        // Only the last occurrence of an option counts, so earlier ones are
        // not validated.
        let options: BTreeMap<String, String> = url
            .query_pairs()
            .map(|(key, value)| (key.to_lowercase(), value.into_owned()))
            .collect();

        for (key, value) in options {
            match key.as_str() {
                "scheme" => {
                    target.backend_scheme = match value.to_lowercase().as_str() {
                        "http" => BackendScheme::Http,
                        "https" => BackendScheme::Https,
                        _ => return Err(ParseError::UnsupportedScheme(value)),
                    };
                }
                "tags" => {
                    target.tags = value
                        .split(',')
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "health" => {
                    target.health_filter = match value.to_lowercase().as_str() {
                        "healthy" => HealthFilterMode::OnlyHealthy,
                        "fallbacktounhealthy" => HealthFilterMode::FallbackToUnhealthy,
                        _ => return Err(ParseError::UnsupportedHealthFilter(value)),
                    };
                }
                "token" => target.access_token = Some(value),
                _ => return Err(ParseError::UnsupportedParameter(key)),
            }
        }

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_options() {
        let target: Target =
            "consul://127.0.0.1:8500/user-service-rpc?scheme=https&tags=primary,backup&health=healthy&token=s3cr3t"
                .parse()
                .unwrap();
        assert_eq!(target.service.as_str(), "user-service-rpc");
        assert_eq!(target.backend_address, "127.0.0.1:8500");
        assert_eq!(target.backend_scheme, BackendScheme::Https);
        assert_eq!(target.tags, ["primary", "backup"]);
        assert_eq!(target.health_filter, HealthFilterMode::OnlyHealthy);
        assert_eq!(target.access_token.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn applies_defaults() {
        let target: Target = "consul://localhost/user-service-rpc".parse().unwrap();
        assert_eq!(target.backend_address, "localhost");
        assert_eq!(target.backend_scheme, BackendScheme::Http);
        assert!(target.tags.is_empty());
        assert_eq!(target.health_filter, HealthFilterMode::OnlyHealthy);
        assert_eq!(target.access_token, None);

        let target: Target = "consul:///user-service-rpc".parse().unwrap();
        assert_eq!(target.backend_address, DEFAULT_BACKEND_ADDRESS);
    }

    #[test]
    fn option_keys_and_values_are_case_insensitive() {
        let target: Target =
            "consul://127.0.0.1/user-service-rpc?tags=pri-mary,backup&SCHEME=HTTP&health=fallbackToUnhealthy"
                .parse()
                .unwrap();
        assert_eq!(target.backend_scheme, BackendScheme::Http);
        assert_eq!(target.tags, ["pri-mary", "backup"]);
        assert_eq!(target.health_filter, HealthFilterMode::FallbackToUnhealthy);
    }

    #[test]
    fn last_occurrence_wins() {
        let target: Target = "consul://127.0.0.1:8500/user-service-rpc?scheme=http&scheme=https&tags=primary,backup&health=healthy&tags=secondary&health=fallbacktounhealthy"
            .parse()
            .unwrap();
        assert_eq!(target.backend_scheme, BackendScheme::Https);
        assert_eq!(target.tags, ["secondary"]);
        assert_eq!(target.health_filter, HealthFilterMode::FallbackToUnhealthy);

        // Superseded values are never validated.
        let target: Target = "consul://localhost/svc?scheme=ftp&health=bogus&SCHEME=https&health=healthy"
            .parse()
            .unwrap();
        assert_eq!(target.backend_scheme, BackendScheme::Https);
        assert_eq!(target.health_filter, HealthFilterMode::OnlyHealthy);
    }

    #[test]
    fn rejects_invalid_targets() {
        let cases = [
            ("consul://consul/user-service-rpc?health=blablub", ParseError::UnsupportedHealthFilter("blablub".into())),
            ("consul://consul:8500/user-service-rpc?scheme=ftp", ParseError::UnsupportedScheme("ftp".into())),
            (
                "consul://[::1]/user-service-rpc?scheme=http?tags=primary",
                ParseError::UnsupportedScheme("http?tags=primary".into()),
            ),
            (
                "consul://localhost/user-service-rpc?unsupportedparam=yo",
                ParseError::UnsupportedParameter("unsupportedparam".into()),
            ),
            ("consul://localhost", ParseError::MissingService),
            ("dns://localhost/user-service-rpc", ParseError::UnsupportedTargetScheme("dns".into())),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<Target>(), Err(expected), "parsing {input}");
        }

        assert!(matches!("".parse::<Target>(), Err(ParseError::Url(_))));
    }

    #[test]
    fn keeps_ipv6_backend_brackets() {
        let target: Target = "consul://[::1]:8500/db".parse().unwrap();
        assert_eq!(target.backend_address, "[::1]:8500");
    }
}
