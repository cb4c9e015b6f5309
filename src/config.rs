//! Command-line configuration.
//!
//! Every option maps directly onto a field the core state machines need:
//! backend selection, timeouts, logging, and process shape. There is no
//! configuration file; the proxy is driven entirely by flags.

use std::net::SocketAddr;

use clap::Parser;

use crate::error::ProxyError;

#[derive(Debug, Clone, Parser)]
#[command(name = "ldap-proxy", about = "LDAP directory proxy")]
pub struct Config {
    /// Address to accept downstream LDAP connections on.
    #[arg(short = 'b', long, default_value = "127.0.0.1:8389")]
    pub bind_address: String,

    /// Fallback upstream backend, used when no suffix matches.
    #[arg(long = "backend-server")]
    pub default_backend: String,

    /// Additional backend, `suffix_dn:host:port`. May be repeated.
    #[arg(long = "backend-additional-server", value_parser = parse_additional_backend)]
    pub additional_backends: Vec<(String, String)>,

    /// Upper bound, in seconds, on a search's time limit.
    #[arg(long = "backend-timeout", default_value_t = 10)]
    pub timeout_seconds: u32,

    /// Minimum log level: debug, info, warn, or error.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Optional bind address for a profiling endpoint. Disabled by default.
    #[arg(long = "pprof")]
    pub pprof_address: Option<String>,

    /// Worker task parallelism. Defaults to the number of available CPUs.
    #[arg(long = "max-parallelism")]
    pub max_parallelism: Option<usize>,
}

impl Config {
    /// Validates fields that `clap` cannot express as a type constraint.
    /// Runs once at startup; any failure here is a `Config` error and the
    /// process exits non-zero without ever opening a socket.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.default_backend.trim().is_empty() {
            return Err(ProxyError::Config(
                "backend-server is required and must not be empty".into(),
            ));
        }
        self.bind_address
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Config(format!("invalid bind-address: {e}")))?;
        if let Some(addr) = &self.pprof_address {
            addr.parse::<SocketAddr>()
                .map_err(|e| ProxyError::Config(format!("invalid pprof address: {e}")))?;
        }
        if let Some(0) = self.max_parallelism {
            return Err(ProxyError::Config(
                "max-parallelism must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn parallelism(&self) -> usize {
        self.max_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        match self.log_level.to_lowercase().as_str() {
            "debug" => log::LevelFilter::Debug,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        }
    }
}

/// Parses `suffix_dn:host:port` by splitting from the right on the last two
/// colons, rather than requiring exactly three colon-separated fields. The
/// naive split-on-every-colon approach breaks as soon as the suffix DN itself
/// contains a colon (rare, but legal in an AVA value); splitting from the
/// right instead only mishandles the rarer case of a colon-bearing DN
/// immediately adjacent to the host:port pair, which is the known, documented
/// limitation here rather than a silent bug.
fn parse_additional_backend(raw: &str) -> Result<(String, String), String> {
    let mut parts = raw.rsplitn(3, ':');
    let port = parts.next().ok_or_else(|| invalid(raw))?;
    let host = parts.next().ok_or_else(|| invalid(raw))?;
    let suffix = parts.next().ok_or_else(|| invalid(raw))?;
    if suffix.is_empty() || host.is_empty() || port.is_empty() {
        return Err(invalid(raw));
    }
    Ok((suffix.to_string(), format!("{host}:{port}")))
}

fn invalid(raw: &str) -> String {
    format!("expected suffix_dn:host:port, got {raw:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_entry() {
        let (suffix, addr) = parse_additional_backend("dc=corp,dc=com:ldap-b:389").unwrap();
        assert_eq!(suffix, "dc=corp,dc=com");
        assert_eq!(addr, "ldap-b:389");
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_additional_backend("dc=corp,dc=com:ldap-b").is_err());
        assert!(parse_additional_backend("justahost").is_err());
    }

    #[test]
    fn tolerates_colon_free_dns_reliably() {
        // The common case: no colons in the DN, splitting from the right or
        // the left gives the same answer.
        let (suffix, addr) = parse_additional_backend("ou=eng,dc=corp,dc=com:10.0.0.1:1389")
            .unwrap();
        assert_eq!(suffix, "ou=eng,dc=corp,dc=com");
        assert_eq!(addr, "10.0.0.1:1389");
    }
}
