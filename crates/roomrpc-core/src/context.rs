//! Process-wide entry point.
//!
//! An [`RpcContext`] is built once at startup from the host's transport and
//! roster, then handed to every extension that needs a channel. Each module or
//! system gets one channel on its own namespaced topic.

use crate::channel::Channel;
use crate::config::{ChannelConfig, TopicConfig};
use crate::error::{Result, RpcError};
use crate::peer::{PeerId, Roster};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Owns one [`Channel`] per registered extension.
pub struct RpcContext {
    transport: Arc<dyn Transport>,
    roster: Arc<dyn Roster>,
    config: ChannelConfig,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl RpcContext {
    pub fn new(transport: impl Transport, roster: impl Roster) -> Self {
        Self::from_shared(Arc::new(transport), Arc::new(roster))
    }

    /// Build from already-shared transport and roster handles.
    pub fn from_shared(transport: Arc<dyn Transport>, roster: Arc<dyn Roster>) -> Self {
        Self {
            transport,
            roster,
            config: ChannelConfig::default(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Settings applied to channels opened after this call.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.roster.local_peer_id()
    }

    /// Open (or return the already open) channel for a module.
    pub async fn register_module(&self, name: &str) -> Result<Arc<Channel>> {
        validate_name("module", name)?;
        self.open(format!("{}{}", TopicConfig::MODULE_PREFIX, name))
            .await
    }

    /// Open (or return the already open) channel for a system.
    pub async fn register_system(&self, name: &str) -> Result<Arc<Channel>> {
        validate_name("system", name)?;
        self.open(format!("{}{}", TopicConfig::SYSTEM_PREFIX, name))
            .await
    }

    pub async fn module(&self, name: &str) -> Option<Arc<Channel>> {
        let topic = format!("{}{}", TopicConfig::MODULE_PREFIX, name);
        self.channels.lock().await.get(&topic).cloned()
    }

    pub async fn system(&self, name: &str) -> Option<Arc<Channel>> {
        let topic = format!("{}{}", TopicConfig::SYSTEM_PREFIX, name);
        self.channels.lock().await.get(&topic).cloned()
    }

    /// Topics with an open channel, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn open(&self, topic: String) -> Result<Arc<Channel>> {
        // Held across the subscribe so two registrations cannot both open a channel.
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(&topic) {
            debug!("Channel {} already registered", topic);
            return Ok(existing.clone());
        }

        let channel = Channel::open(
            topic.clone(),
            self.transport.clone(),
            self.roster.clone(),
            self.config.clone(),
        )
        .await?;
        channels.insert(topic, channel.clone());
        Ok(channel)
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RpcError::validation(kind, "name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RpcError::validation(
            kind,
            format!("name '{}' must not contain whitespace", name),
        ));
    }
    Ok(())
}
