//! User table: per-user secrets, source address allow-lists and logging

use crate::crypto::Secret;
use crate::handshake::Authenticator;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

/// Contents of the users file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: BTreeMap<String, UserEntry>,
}

/// One `[users.<name>]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub secret: String,
    /// Addresses or CIDR blocks; empty allows any source
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Log this user's sessions and channels
    #[serde(default = "default_logging")]
    pub logging: bool,
}

fn default_logging() -> bool {
    true
}

impl UsersFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read users file {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse users file: {}", e)))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize users: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write users file: {}", e)))
    }
}

/// A parsed allow-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_match(u32::from(net) as u128, u32::from(ip) as u128, self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_match(u128::from(net), u128::from(ip), self.prefix, 128)
            }
            _ => false,
        }
    }
}

fn prefix_match(net: u128, ip: u128, prefix: u8, bits: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(bits - prefix);
    (net >> shift) == (ip >> shift)
}

impl FromStr for IpNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid address {:?}", s))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid prefix length in {:?}", s))?,
            None => max,
        };

        Ok(Self { addr, prefix })
    }
}

/// Source addresses a user may connect from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAllowList {
    nets: Vec<IpNet>,
}

impl IpAllowList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, crate::Error> {
        let nets = entries
            .iter()
            .map(|entry| entry.as_ref().parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(crate::Error::Config)?;
        Ok(Self { nets })
    }

    pub fn allows_all(&self) -> bool {
        self.nets.is_empty()
    }

    /// IPv4-mapped IPv6 peers match IPv4 entries
    pub fn contains(&self, ip: IpAddr) -> bool {
        if self.nets.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.nets.iter().any(|net| net.contains(ip))
    }
}

#[derive(Debug, Clone)]
struct UserRecord {
    secret: Secret,
    allow: IpAllowList,
    logging: bool,
}

/// Authenticated identities known to the server
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, UserRecord>,
    legacy: Option<Secret>,
}

impl UserTable {
    /// Build the table; `legacy` verifies tokens that carry no username
    pub fn from_file(file: &UsersFile, legacy: Option<Secret>) -> Result<Self, crate::Error> {
        if file.users.is_empty() && legacy.is_none() {
            return Err(crate::Error::Config("No users configured".into()));
        }

        let mut users = HashMap::with_capacity(file.users.len());
        for (name, entry) in &file.users {
            if name.trim().is_empty() || name.contains(':') {
                return Err(crate::Error::Config(format!("Invalid username {:?}", name)));
            }
            if entry.secret.is_empty() {
                return Err(crate::Error::Config(format!("User {:?} has an empty secret", name)));
            }
            let allow = IpAllowList::parse(&entry.whitelist)
                .map_err(|e| crate::Error::Config(format!("User {:?}: {}", name, e)))?;

            users.insert(
                name.clone(),
                UserRecord {
                    secret: Secret::from(entry.secret.as_str()),
                    allow,
                    logging: entry.logging,
                },
            );
        }

        Ok(Self { users, legacy })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Whether sessions of `username` are logged; legacy sessions always are
    pub fn logging_enabled(&self, username: &str) -> bool {
        self.users.get(username).map_or(true, |user| user.logging)
    }
}

impl Authenticator for UserTable {
    fn secret_for(&self, username: Option<&str>) -> Option<Secret> {
        match username {
            Some(name) => self.users.get(name).map(|user| user.secret.clone()),
            None => self.legacy.clone(),
        }
    }

    fn permits(&self, username: &str, peer: IpAddr) -> bool {
        match self.users.get(username) {
            Some(user) => user.allow.contains(peer),
            // Legacy identity has no allow-list
            None => username.is_empty() && self.legacy.is_some(),
        }
    }
}
