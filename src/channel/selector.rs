use std::sync::Arc;

use super::{Channel, ChannelRegistry};
use crate::error::{RelayError, Result};
use crate::task::Task;

/// Deterministic channel choice over a registry snapshot.
///
/// Candidates are enabled channels of the requested platform that serve the
/// model. Channels with an open circuit are skipped while any healthy
/// candidate remains. The winner has the highest priority, then the highest
/// weight, then the lowest id.
#[derive(Clone)]
pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
}

impl ChannelSelector {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn select_channel(&self, model: &str, platform: &str) -> Result<Arc<Channel>> {
        let candidates: Vec<Arc<Channel>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|channel| {
                channel.is_enabled() && channel.platform == platform && channel.supports_model(model)
            })
            .collect();

        let healthy: Vec<&Arc<Channel>> = candidates
            .iter()
            .filter(|channel| self.registry.is_healthy(channel.id))
            .collect();
        let pool: Vec<&Arc<Channel>> = if healthy.is_empty() {
            candidates.iter().collect()
        } else {
            healthy
        };

        pool.into_iter()
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| b.weight.cmp(&a.weight))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
            .ok_or_else(|| RelayError::NoAvailableChannel {
                model: model.to_string(),
                platform: platform.to_string(),
            })
    }

    /// Resolves the channel that must continue `origin_task`. The provider
    /// job lives on that channel's account, so a disabled origin channel is
    /// an error rather than a reason to reroute.
    pub fn failover(&self, origin_task: &Task, current_channel_id: i64) -> Result<Arc<Channel>> {
        if origin_task.channel_id != current_channel_id {
            tracing::info!(
                task_id = %origin_task.id,
                origin_channel_id = origin_task.channel_id,
                current_channel_id,
                "continuing task on its origin channel"
            );
        }
        let channel = self
            .registry
            .get(origin_task.channel_id)
            .ok_or(RelayError::ChannelNotFound {
                channel_id: origin_task.channel_id,
            })?;
        if !channel.is_enabled() {
            return Err(RelayError::ChannelDisabled {
                channel_id: channel.id,
            });
        }
        if channel.platform != origin_task.platform {
            return Err(RelayError::InvalidPlatform {
                platform: origin_task.platform.clone(),
            });
        }
        Ok(channel)
    }
}
