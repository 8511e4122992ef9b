//! Agent configuration, read from the environment.

use std::{path::PathBuf, str::FromStr, time::Duration};

use node_agent_transport::{HTTP_RETRY_PERIOD, HttpConfig, WriterConfig};

use crate::AgentError;

const DEFAULT_CONFIG_DIR: &str = "/var/lib/node-agent";

const DEFAULT_LONG_POLL_TIMEOUT_SECS: u64 = 600;

const DEFAULT_POST_TIMEOUT_SECS: u64 = 60;

const DEFAULT_WRITER_CYCLE_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Agent endpoint on the manager
    pub manager_url: String,
    /// Verify the manager's TLS certificate
    pub verify_tls: bool,
    /// Extra PEM root certificate
    pub ca_file: Option<PathBuf>,
    /// Client certificate, overriding the one in `config_dir`
    pub cert_file: Option<PathBuf>,
    /// Client key, overriding the one in `config_dir`
    pub key_file: Option<PathBuf>,
    /// Directory holding the agent's key and certificate
    pub config_dir: PathBuf,
    pub long_poll_timeout: Duration,
    pub post_timeout: Duration,
    pub writer_cycle: Duration,
    pub reader_retry: Duration,
    /// Address reported on registration
    pub server_address: Option<String>,
}

impl AgentConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns error if `MANAGER_URL` is unset or a value does not parse.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if `MANAGER_URL` is missing or a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let manager_url = lookup("MANAGER_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| AgentError::Config("MANAGER_URL is not set".to_string()))?;

        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        let verify_tls = match lookup("TLS_VERIFY").as_deref() {
            None | Some("1" | "true" | "yes") => true,
            Some("0" | "false" | "no") => false,
            Some(other) => {
                return Err(AgentError::Config(format!("Invalid TLS_VERIFY: {other}")));
            }
        };

        Ok(Self {
            manager_url,
            verify_tls,
            ca_file: path("CA_FILE"),
            cert_file: path("CERT_FILE"),
            key_file: path("KEY_FILE"),
            config_dir: path("CONFIG_DIR").unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR)),
            long_poll_timeout: Duration::from_secs(parse(
                &lookup,
                "LONG_POLL_TIMEOUT_SECS",
                DEFAULT_LONG_POLL_TIMEOUT_SECS,
            )?),
            post_timeout: Duration::from_secs(parse(
                &lookup,
                "POST_TIMEOUT_SECS",
                DEFAULT_POST_TIMEOUT_SECS,
            )?),
            writer_cycle: Duration::from_millis(parse(
                &lookup,
                "WRITER_CYCLE_MS",
                DEFAULT_WRITER_CYCLE_MS,
            )?),
            reader_retry: Duration::from_secs(parse(
                &lookup,
                "READER_RETRY_SECS",
                HTTP_RETRY_PERIOD.as_secs(),
            )?),
            server_address: lookup("SERVER_ADDRESS").filter(|v| !v.is_empty()),
        })
    }

    /// HTTP client settings.
    ///
    /// The client identity is taken from `CERT_FILE`/`KEY_FILE` when both
    /// are set, otherwise from `fallback`.
    #[must_use]
    pub fn http_config(&self, fallback: Option<(PathBuf, PathBuf)>) -> HttpConfig {
        let identity = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => fallback,
        };
        HttpConfig {
            url: self.manager_url.clone(),
            verify_tls: self.verify_tls,
            ca_file: self.ca_file.clone(),
            identity,
            long_poll_timeout: self.long_poll_timeout,
            post_timeout: self.post_timeout,
        }
    }

    #[must_use]
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            cycle: self.writer_cycle,
            ..WriterConfig::default()
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AgentError> {
    lookup(key).map_or(Ok(default), |value| {
        value
            .parse()
            .map_err(|_| AgentError::Config(format!("Invalid {key}: {value}")))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<AgentConfig, AgentError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("MANAGER_URL", "https://manager/agent/message/")]).unwrap();
        assert!(config.verify_tls);
        assert_eq!(config.long_poll_timeout, Duration::from_secs(600));
        assert_eq!(config.post_timeout, Duration::from_secs(60));
        assert_eq!(config.writer_cycle, Duration::from_secs(1));
        assert_eq!(config.reader_retry, HTTP_RETRY_PERIOD);
        assert_eq!(config.config_dir, PathBuf::from(DEFAULT_CONFIG_DIR));
        assert!(config.server_address.is_none());
    }

    #[test]
    fn test_manager_url_required() {
        assert!(matches!(config(&[]), Err(AgentError::Config(_))));
        assert!(matches!(
            config(&[("MANAGER_URL", "")]),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("MANAGER_URL", "https://manager/"),
            ("TLS_VERIFY", "false"),
            ("WRITER_CYCLE_MS", "250"),
            ("READER_RETRY_SECS", "3"),
            ("SERVER_ADDRESS", "10.0.0.5"),
        ])
        .unwrap();
        assert!(!config.verify_tls);
        assert_eq!(config.writer_config().cycle, Duration::from_millis(250));
        assert_eq!(config.reader_retry, Duration::from_secs(3));
        assert_eq!(config.server_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&[("MANAGER_URL", "https://m/"), ("TLS_VERIFY", "maybe")]).is_err());
        assert!(config(&[("MANAGER_URL", "https://m/"), ("POST_TIMEOUT_SECS", "soon")]).is_err());
    }

    #[test]
    fn test_identity_precedence() {
        let fallback = Some((PathBuf::from("/d/self.crt"), PathBuf::from("/d/private.pem")));

        let config = config(&[("MANAGER_URL", "https://m/"), ("CERT_FILE", "/etc/c.pem")]).unwrap();
        assert_eq!(config.http_config(fallback.clone()).identity, fallback);

        let config = AgentConfig {
            key_file: Some(PathBuf::from("/etc/k.pem")),
            ..config
        };
        assert_eq!(
            config.http_config(fallback).identity,
            Some((PathBuf::from("/etc/c.pem"), PathBuf::from("/etc/k.pem")))
        );
    }
}
