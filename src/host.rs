//! Host address model shared by both roles.
//!
//! A host is written `name[:port]`. Names are case-insensitive and kept
//! uppercased; `localhost` stands for the local node's own name.

use std::fmt;

use crate::error::{ClusrunError, Result};

pub const DEFAULT_PORT: u16 = 50505;

/// A normalized `NAME:PORT` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    hostname: String,
    port: u16,
}

impl HostAddress {
    /// Parse `name[:port]`, resolving `localhost` to `local_name`.
    pub fn parse(address: &str, local_name: &str) -> Result<Self> {
        let segs: Vec<&str> = address.split(':').collect();
        if segs.len() > 2 {
            return Err(ClusrunError::InvalidHost(
                address.to_string(),
                "too many ':' separators".to_string(),
            ));
        }

        let mut hostname = segs[0].trim().to_uppercase();
        if hostname.is_empty() {
            return Err(ClusrunError::InvalidHost(
                address.to_string(),
                "empty address".to_string(),
            ));
        }
        if hostname == "LOCALHOST" {
            hostname = local_name.to_uppercase();
        }

        let port = match segs.get(1) {
            Some(p) => p.trim().parse::<u16>().map_err(|e| {
                ClusrunError::InvalidHost(address.to_string(), format!("incorrect port: {}", e))
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self { hostname, port })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Endpoint URI used to dial this host.
    pub fn uri(&self) -> String {
        format!("http://{}", self)
    }

    /// Filesystem-safe form (`:` replaced by `.`).
    pub fn file_name(&self) -> String {
        file_name_format(&self.to_string())
    }

    /// Display name of a node claiming `nodename` while reporting from this host.
    ///
    /// The bare name is used only when it matches the host on the default
    /// port; otherwise the host is appended as `NAME(HOST:PORT)`.
    pub fn display_name(&self, nodename: &str) -> String {
        let nodename = nodename.to_uppercase();
        if self.hostname == nodename && self.port == DEFAULT_PORT {
            nodename
        } else {
            format!("{}({})", nodename, self)
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Recover the dialable `HOST:PORT` from a display name.
pub fn host_of_display_name(display_name: &str) -> String {
    match display_name.split_once('(') {
        Some((_, rest)) => rest.trim_end_matches(')').to_string(),
        None => format!("{}:{}", display_name, DEFAULT_PORT),
    }
}

pub fn file_name_format(host: &str) -> String {
    host.replace(':', ".")
}
