use std::str::FromStr;
use std::time::Duration;

use mirror_channels::{ChannelId, MasterIndex, MasterOptions};

use crate::telemetry::DEFAULT_LOG_FILTER;

/// Which masters this process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Front,
    Back,
    Both,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "front" => Some(Role::Front),
            "back" => Some(Role::Back),
            "both" => Some(Role::Both),
            _ => None,
        }
    }

    pub fn hosts_front(self) -> bool {
        matches!(self, Role::Front | Role::Both)
    }

    pub fn hosts_back(self) -> bool {
        matches!(self, Role::Back | Role::Both)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub log_filter: String,
    pub role: Role,
    pub channel_ids: Vec<ChannelId>,
    pub front_master_index: MasterIndex,
    pub back_master_index: MasterIndex,
    /// Channels across the whole cluster when this node hosts a subset.
    pub total_channels: Option<usize>,
    pub connect_timeout_ms: u64,
    pub client_link_timeout_ms: u64,
    pub flush_interval_ms: u64,
    pub bus_capacity: usize,
    /// Settings that were present but unusable; logged once tracing is up.
    pub warnings: Vec<String>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unparsable values fall back to
    /// their defaults and leave a warning behind.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        let log_filter = lookup("MIRROR_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.into());
        let role = match lookup("MIRROR_ROLE") {
            None => Role::Both,
            Some(raw) => Role::parse(&raw).unwrap_or_else(|| {
                warnings.push(format!("MIRROR_ROLE={raw:?} is not front, back or both; hosting both"));
                Role::Both
            }),
        };
        let channel_ids = lookup("MIRROR_CHANNEL_IDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|ids| !ids.is_empty())
            .unwrap_or_else(|| vec!["0".into(), "1".into()]);
        let w = &mut warnings;
        let front_master_index: MasterIndex =
            parse_setting("MIRROR_FRONT_MASTER_INDEX", &lookup, w).unwrap_or(0);
        let back_master_index: MasterIndex =
            parse_setting("MIRROR_BACK_MASTER_INDEX", &lookup, w).unwrap_or(0);
        let total_channels: Option<usize> = parse_setting("MIRROR_TOTAL_CHANNELS", &lookup, w);
        let connect_timeout_ms: u64 =
            parse_setting("MIRROR_CONNECT_TIMEOUT_MS", &lookup, w).unwrap_or(15_000);
        let client_link_timeout_ms: u64 =
            parse_setting("MIRROR_CLIENT_LINK_TIMEOUT_MS", &lookup, w).unwrap_or(5_000);
        let flush_interval_ms: u64 = parse_setting("MIRROR_FLUSH_INTERVAL_MS", &lookup, w)
            .unwrap_or(50)
            .max(1);
        let bus_capacity: usize = parse_setting("MIRROR_BUS_CAPACITY", &lookup, w).unwrap_or(1024);
        Self {
            log_filter,
            role,
            channel_ids,
            front_master_index,
            back_master_index,
            total_channels,
            connect_timeout_ms,
            client_link_timeout_ms,
            flush_interval_ms,
            bus_capacity,
            warnings,
        }
    }

    pub fn master_options(&self) -> MasterOptions {
        MasterOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            client_link_timeout: Duration::from_millis(self.client_link_timeout_ms),
            total_channels: self.total_channels,
        }
    }
}

fn parse_setting<T, F>(key: &str, lookup: &F, warnings: &mut Vec<String>) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("{key}={raw:?} is not a valid number; using the default"));
            None
        }
    }
}
