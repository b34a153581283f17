//! Centralized configuration for roomrpc.
//!
//! Constant structs hold limits that are fixed at compile time; [`ChannelConfig`]
//! holds the few knobs a caller can tune per context.

use std::time::Duration;

/// Topic naming for registered extensions.
pub struct TopicConfig;

impl TopicConfig {
    pub const MODULE_PREFIX: &'static str = "module.";
    pub const SYSTEM_PREFIX: &'static str = "system.";
}

/// Limits for the TCP hub relay.
pub struct HubConfig;

impl HubConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 256;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Per-channel runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Reject and drop a pending request after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl ChannelConfig {
    /// Set a timeout applied to every outbound request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}
