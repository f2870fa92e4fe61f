use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(15_000);
pub const DEFAULT_CLIENT_LINK_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Timing knobs for a front master and its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterOptions {
    pub connect_timeout: Duration,
    pub client_link_timeout: Duration,
    /// Logical channels in the whole cluster, which every front channel
    /// waits for when connecting. `None` means the channels the front
    /// master hosts.
    pub total_channels: Option<usize>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_link_timeout: DEFAULT_CLIENT_LINK_TIMEOUT,
            total_channels: None,
        }
    }
}
