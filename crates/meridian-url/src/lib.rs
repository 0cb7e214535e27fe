//! Endpoint address parsing for the meridian bus.
//!
//! Every object reachable over the bus is addressed by a URL of the form
//! `[scheme://]<netloc>/<Class>/<name|index>[?key=value&...]`. The bus
//! portion (`scheme://netloc`) is the routing key used to decide whether a
//! message is local or must cross the wire; the path portion identifies one
//! object instance on that bus.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Address parsing errors.
///
/// `InvalidHost` and `InvalidPath` are distinguishable so callers can tell a
/// relative path (no host) apart from a genuinely malformed address.
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid host '{0}': host must be in the format '[tcp://]<host>:<port>'")]
    InvalidHost(String),

    #[error("invalid path '{0}': {1}")]
    InvalidPath(String, &'static str),
}

/// One parsed endpoint address.
///
/// Two addresses are *bus-equal* when their [`Url::bus`] strings match, and
/// *identity-equal* when the whole struct matches. Instances are immutable
/// after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    /// Transport scheme (`tcp`, `inproc`).
    pub scheme: String,
    /// Host name. For `inproc` this is the endpoint name.
    pub host: String,
    /// Port, present only for schemes with host:port netlocs.
    pub port: Option<u16>,
    /// Canonical routing key: `{scheme}://{netloc}`.
    pub bus: String,
    /// Object path: `/<Class>/<name>`.
    pub path: String,
    /// Class portion of the path.
    pub cls: String,
    /// Instance name portion of the path.
    pub name: String,
    /// True when the instance name is a numeric index.
    pub indexed: bool,
    /// Optional query-style configuration attached to the address.
    pub config: BTreeMap<String, String>,
}

impl Url {
    /// Full normalized address: bus + path (query excluded).
    pub fn url(&self) -> String {
        format!("{}{}", self.bus, self.path)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bus, self.path)
    }
}

/// Parse a free-form endpoint string into a normalized [`Url`].
///
/// A missing scheme defaults to `tcp`. `tcp` addresses require a
/// `host:port` netloc; `inproc` addresses require a non-empty name and
/// carry no port.
pub fn parse_url(input: &str) -> Result<Url, UrlError> {
    let (scheme, rest) = match input.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("tcp".to_string(), input),
    };

    let (rest, config) = match rest.split_once('?') {
        Some((rest, query)) => (rest, parse_query(query)),
        None => (rest, BTreeMap::new()),
    };

    let (netloc, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (host, port) = parse_netloc(&scheme, netloc)?;
    let (cls, name, indexed) = parse_path(path)?;

    let bus = format!("{scheme}://{netloc}");

    Ok(Url {
        scheme,
        host,
        port,
        bus,
        path: format!("/{cls}/{name}"),
        cls,
        name,
        indexed,
        config,
    })
}

fn parse_netloc(scheme: &str, netloc: &str) -> Result<(String, Option<u16>), UrlError> {
    if scheme == "tcp" {
        let (host, port) = netloc
            .split_once(':')
            .ok_or_else(|| UrlError::InvalidHost(netloc.to_string()))?;

        if host.is_empty() || host.contains(' ') {
            return Err(UrlError::InvalidHost(netloc.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| UrlError::InvalidHost(netloc.to_string()))?;

        Ok((host.to_string(), Some(port)))
    } else {
        if netloc.is_empty() || netloc.contains(' ') {
            return Err(UrlError::InvalidHost(netloc.to_string()));
        }
        Ok((netloc.to_string(), None))
    }
}

fn parse_path(path: &str) -> Result<(String, String, bool), UrlError> {
    if !path.starts_with('/') {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "path does not start with '/'",
        ));
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 3 {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "path is not in the format '/<class>/<name|index>'",
        ));
    }

    let (cls, name) = (parts[1], parts[2]);

    if cls.is_empty() || cls.contains('$') || cls.contains(' ') {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "class is empty or contains invalid characters",
        ));
    }

    if cls.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "class cannot start with a number",
        ));
    }

    if name.is_empty() || name.contains(' ') {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "name is empty or contains spaces",
        ));
    }

    let indexed = name.chars().all(|c| c.is_ascii_digit());
    if name.starts_with(|c: char| c.is_ascii_digit()) && !indexed {
        return Err(UrlError::InvalidPath(
            path.to_string(),
            "name cannot start with a number unless it is fully numeric",
        ));
    }

    Ok((cls.to_string(), name.to_string(), indexed))
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_url() {
        let url = parse_url("hostname:1000/Class/name").unwrap();

        assert_eq!(url.scheme, "tcp");
        assert_eq!(url.host, "hostname");
        assert_eq!(url.port, Some(1000));
        assert_eq!(url.cls, "Class");
        assert_eq!(url.name, "name");
        assert_eq!(url.bus, "tcp://hostname:1000");
        assert_eq!(url.path, "/Class/name");
        assert_eq!(url.url(), "tcp://hostname:1000/Class/name");
        assert!(!url.indexed);
    }

    #[test]
    fn explicit_scheme_is_preserved() {
        let url = parse_url("tcp://127.0.0.1:2000/Telescope/0").unwrap();
        assert_eq!(url.bus, "tcp://127.0.0.1:2000");
        assert!(url.indexed);
    }

    #[test]
    fn inproc_urls_have_no_port() {
        let url = parse_url("inproc://busA/Telescope/0").unwrap();
        assert_eq!(url.scheme, "inproc");
        assert_eq!(url.host, "busA");
        assert_eq!(url.port, None);
        assert_eq!(url.bus, "inproc://busA");
    }

    #[test]
    fn equal_urls_compare_and_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let url_1 = parse_url("host.com.br:1000/Class/name").unwrap();
        let url_2 = parse_url("host.com.br:1000/Class/name").unwrap();
        assert_eq!(url_1, url_2);

        let hash = |u: &Url| {
            let mut h = DefaultHasher::new();
            u.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&url_1), hash(&url_2));
    }

    #[test]
    fn query_config_is_parsed_and_excluded_from_identity_string() {
        let url = parse_url("host:1000/Camera/cam1?binning=2x2&filter=R").unwrap();
        assert_eq!(url.config.get("binning").map(String::as_str), Some("2x2"));
        assert_eq!(url.config.get("filter").map(String::as_str), Some("R"));
        assert_eq!(url.url(), "tcp://host:1000/Camera/cam1");
    }

    #[test]
    fn valid_urls() {
        for input in [
            "200.100.100.100:1000/Class/other",
            "200.100.100.100:1000/Class/1",
            "localhost:9000/class/o",
        ] {
            assert!(parse_url(input).is_ok(), "{input} should parse");
        }
    }

    #[test]
    fn invalid_hosts() {
        for input in [
            "/Class/name",
            "200.100.100.100/Class/name",
            ":1000/Class/name",
            "200.100.100.100:port/Class/name",
        ] {
            assert!(
                matches!(parse_url(input), Err(UrlError::InvalidHost(_))),
                "{input} should fail host validation"
            );
        }
    }

    #[test]
    fn invalid_paths() {
        for input in [
            "200.100.100.100:1000/Who/am/I",
            "200.100.100.100:1000/Who",
            "200.100.100.100:1000/1234/name",
            "200.100.100.100:1000/12345Class/o",
            "200.100.100.100:1000/Class/1what",
        ] {
            assert!(
                matches!(parse_url(input), Err(UrlError::InvalidPath(_, _))),
                "{input} should fail path validation"
            );
        }
    }
}
