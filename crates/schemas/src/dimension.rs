// Dimension rows
//
// Devices and network endpoints are global across tenants: the same physical
// device seen under two campaigns shares one row. Rows accumulate and are
// never deleted by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device identified by its composite fingerprint hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: i64,
    /// Natural key (lowercase hex SHA-256)
    pub device_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: i64,
    /// Highest raw event sequence id already counted in `hit_count`
    pub last_event_id: i64,
}

/// Routing scope of a network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointScope {
    Public,
    Private,
    Loopback,
    LinkLocal,
    Unspecified,
    /// Address text that does not parse as an IP address
    Unknown,
}

impl EndpointScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Loopback => "loopback",
            Self::LinkLocal => "link_local",
            Self::Unspecified => "unspecified",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EndpointScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndpointScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "loopback" => Ok(Self::Loopback),
            "link_local" => Ok(Self::LinkLocal),
            "unspecified" => Ok(Self::Unspecified),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown endpoint scope: {other}")),
        }
    }
}

/// A network endpoint identified by its normalized address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub endpoint_id: i64,
    /// Natural key
    pub address: String,
    /// 4 or 6, `None` for unparseable addresses
    pub ip_version: Option<i16>,
    pub scope: EndpointScope,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: i64,
    pub last_event_id: i64,
}
