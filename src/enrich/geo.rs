//! Geo-IP lookup backends.
//!
//! [`GeoTable`] is a network-prefix table loaded once at startup from a TOML
//! file:
//!
//! ```toml
//! [[network]]
//! cidr = "203.0.113.0/24"
//! country_code = "FR"
//! time_zone = "Europe/Paris"
//! ```

use super::{GeoLocator, Location, LookupError};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

/// Locator that knows nothing; every lookup misses.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoGeo;

impl GeoLocator for NoGeo {
    fn locate(&self, ip: &IpAddr) -> Result<Location, LookupError> {
        Err(LookupError::NotFound(*ip))
    }
}

#[derive(Deserialize)]
struct TableFile {
    #[serde(default)]
    network: Vec<NetworkEntry>,
}

#[derive(Deserialize)]
struct NetworkEntry {
    cidr: String,
    country_code: String,
    time_zone: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .with_context(|| format!("invalid network address in {:?}", cidr))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .with_context(|| format!("invalid prefix length in {:?}", cidr))?,
            None => max,
        };
        if prefix > max {
            bail!("prefix length {} too long for {:?}", prefix, cidr);
        }
        // Queries are normalized to IPv4, so mapped networks must be too
        if let IpAddr::V6(v6) = addr {
            if let Some(v4) = v6.to_ipv4_mapped() {
                if prefix >= 96 {
                    return Ok(Self {
                        addr: IpAddr::V4(v4),
                        prefix: prefix - 96,
                    });
                }
            }
        }
        Ok(Self { addr, prefix })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                masked(u32::from(net) as u128, 32, self.prefix)
                    == masked(u32::from(ip) as u128, 32, self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                masked(u128::from(net), 128, self.prefix) == masked(u128::from(ip), 128, self.prefix)
            }
            _ => false,
        }
    }
}

/// IPv4-mapped IPv6 addresses are matched against IPv4 networks
fn normalize(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
        other => *other,
    }
}

fn masked(bits: u128, width: u8, prefix: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let shift = width - prefix;
    (bits >> shift) << shift
}

/// Longest-prefix-match table of networks
#[derive(Clone, Debug, Default)]
pub struct GeoTable {
    entries: Vec<(Network, Location)>,
}

impl GeoTable {
    /// Loads the table from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read geo table {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse geo table {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: TableFile = toml::from_str(contents).map_err(|e| anyhow!(e))?;
        let mut entries = file
            .network
            .into_iter()
            .map(|entry| -> Result<(Network, Location)> {
                let network = Network::parse(&entry.cidr)?;
                Ok((
                    network,
                    Location {
                        country_code: entry.country_code,
                        time_zone: entry.time_zone,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        // Most specific first so the first hit is the longest match
        entries.sort_by(|a, b| b.0.prefix.cmp(&a.0.prefix));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl GeoLocator for GeoTable {
    fn locate(&self, ip: &IpAddr) -> Result<Location, LookupError> {
        self.entries
            .iter()
            .find(|(network, _)| network.contains(ip))
            .map(|(_, location)| location.clone())
            .ok_or(LookupError::NotFound(*ip))
    }
}
