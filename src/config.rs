//! Configuration records for the proxy and the certificate center.
//!
//! Both programs read a JSON file. The proxy file looks like:
//!
//! ```json
//! {
//!     "proxy": {"socks5": "127.0.0.1:1080"},
//!     "log": 30,
//!     "hosts": [
//!         {"host": "example.com", "decoder": "tls1", "forward": "http://127.0.0.1:8080", "dump_request": 1}
//!     ],
//!     "decoder": [
//!         {"name": "tls1", "type": "TlsDecoder", "server": "https://certs.local/cert?host={host}",
//!          "username": "proxy", "password": "secret"}
//!     ]
//! }
//! ```

use std::{collections::HashMap, fs, path::Path};

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::Error;

/// Routing entry: destinations matching `host` or `ip` are decoded and forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, alias = "decorder")]
    pub decoder: String,
    #[serde(default)]
    pub forward: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub dump_request: bool,
}

impl HostRule {
    /// A rule matches a destination key when its host or ip equals the whole key or the
    /// key's host part.
    pub fn matches(&self, destination: &str) -> bool {
        let host = host_part(destination);
        [self.host.as_str(), self.ip.as_str()]
            .into_iter()
            .filter(|candidate| !candidate.is_empty())
            .any(|candidate| candidate == destination || candidate == host)
    }

    /// Key handed to the decoder: the configured host, falling back to the ip.
    pub fn match_key(&self) -> &str {
        if self.host.is_empty() {
            &self.ip
        } else {
            &self.host
        }
    }
}

/// Strips a trailing `:port` (and IPv6 brackets) from a destination key.
pub fn host_part(destination: &str) -> &str {
    match destination.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.is_empty() => {
            match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
                Some(ipv6) => ipv6,
                // An unbracketed host with more colons is a bare IPv6 literal.
                None if host.contains(':') => destination,
                None => host,
            }
        }
        _ => destination,
    }
}

/// Named decoder settings. `name` and `type` are required, everything else is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub settings: HashMap<String, serde_json::Value>,
}

impl DecoderConfig {
    /// String setting, `None` when absent, empty or not a string.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }
}

/// Host rules plus the decoders they reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<HostRule>,
    #[serde(default, alias = "decorder")]
    pub decoder: Vec<DecoderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub socks5: String,
    /// Address of the external HTTP-to-SOCKS helper. Parsed but not managed here.
    #[serde(default)]
    pub http: String,
}

/// Proxy-mode configuration file: the routing [`Config`] plus listen addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub hosts: Vec<HostRule>,
    #[serde(default, alias = "decorder")]
    pub decoder: Vec<DecoderConfig>,
    #[serde(default)]
    pub proxy: ListenConfig,
    #[serde(default)]
    pub log: i32,
}

impl ProxyConfig {
    pub fn routing(&self) -> Config {
        Config {
            hosts: self.hosts.clone(),
            decoder: self.decoder.clone(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let config: Self = load_json(path)?;
        if config.proxy.socks5.is_empty() {
            return Err(Error::Config("proxy.socks5 is required".into()));
        }
        Ok(config)
    }
}

/// Certificate record served by the certificate center.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertEntry {
    pub host: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Hex SHA-256 of `salt + password`.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

/// Server-mode configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertServerConfig {
    pub listen: String,
    #[serde(default)]
    pub certs: Vec<CertEntry>,
    #[serde(default)]
    pub log: i32,
}

impl CertServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        load_json(path)
    }
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> crate::Result<T> {
    let path = path.as_ref();
    let data = fs::read(path)
        .map_err(|err| Error::Config(format!("reading {}: {}", path.display(), err)))?;
    serde_json::from_slice(&data)
        .map_err(|err| Error::Config(format!("parsing {}: {}", path.display(), err)))
}

/// Maps the numeric `log` setting (10 error, 20 warn, 30 info, 40 debug) to a filter
/// directive.
pub fn log_directive(level: i32) -> &'static str {
    match level {
        l if l >= 40 => "debug",
        l if l >= 30 => "info",
        l if l >= 20 => "warn",
        l if l > 0 => "error",
        _ => "info",
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(flag) => flag,
        Flag::Int(value) => value > 0,
    })
}
