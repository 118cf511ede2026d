use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Task, TaskCursor, TaskService, TaskTransition};
use crate::adaptor::AdaptorRegistry;
use crate::channel::ChannelRegistry;
use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskPollConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    15
}

fn default_batch_size() -> usize {
    100
}

impl Default for TaskPollConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub polled: usize,
    pub applied: usize,
    pub ignored: usize,
    pub failed_fetches: usize,
}

/// Periodically asks providers about unfinished tasks and feeds the answers
/// through [`TaskService::update_from_provider_poll`].
///
/// Each pass resumes after the last task of the previous one and wraps
/// around once a short batch comes back, so tasks that never settle cannot
/// keep newer ones out of the batch.
pub struct TaskPoller {
    tasks: Arc<TaskService>,
    channels: Arc<ChannelRegistry>,
    adaptors: Arc<AdaptorRegistry>,
    config: TaskPollConfig,
    cursor: tokio::sync::Mutex<Option<TaskCursor>>,
}

/// Stops the poll loop when dropped. A poll in flight is aborted.
pub struct PollerHandle {
    cancel: CancellationToken,
    task: tokio::task::AbortHandle,
}

impl PollerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl TaskPoller {
    pub fn new(
        tasks: Arc<TaskService>,
        channels: Arc<ChannelRegistry>,
        adaptors: Arc<AdaptorRegistry>,
        config: TaskPollConfig,
    ) -> Self {
        Self {
            tasks,
            channels,
            adaptors,
            config,
            cursor: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn poll_once(&self) -> Result<PollSummary> {
        let batch_size = self.config.batch_size.max(1);
        let unfinished = {
            let mut cursor = self.cursor.lock().await;
            let unfinished = self
                .tasks
                .unfinished_tasks(cursor.as_ref(), batch_size)
                .await?;
            *cursor = if unfinished.len() < batch_size {
                None
            } else {
                unfinished.last().map(TaskCursor::from)
            };
            unfinished
        };
        let mut groups: BTreeMap<(i64, String), Vec<Task>> = BTreeMap::new();
        for task in unfinished {
            groups
                .entry((task.channel_id, task.platform.clone()))
                .or_default()
                .push(task);
        }

        let mut summary = PollSummary::default();
        for ((channel_id, platform), tasks) in groups {
            let Some(channel) = self.channels.get(channel_id) else {
                tracing::warn!(channel_id, "skipping tasks of unknown channel");
                continue;
            };
            let adaptor = match self.adaptors.create(&platform) {
                Ok(adaptor) if adaptor.is_async() => adaptor,
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(channel_id, %platform, error = %err, "no adaptor for task platform");
                    continue;
                }
            };

            let ids: Vec<String> = tasks.iter().map(|t| t.provider_task_id.clone()).collect();
            summary.polled += ids.len();
            let updates = match adaptor.fetch_tasks(&channel, &ids).await {
                Ok(updates) => updates,
                Err(err) => {
                    summary.failed_fetches += 1;
                    tracing::warn!(channel_id, %platform, error = %err, "task fetch failed");
                    continue;
                }
            };

            for update in updates {
                let Some(task) = tasks
                    .iter()
                    .find(|t| t.provider_task_id == update.provider_task_id)
                else {
                    continue;
                };
                match self.tasks.update_from_provider_poll(task, update).await {
                    Ok(TaskTransition::Applied { .. }) => summary.applied += 1,
                    Ok(TaskTransition::Ignored { .. }) => summary.ignored += 1,
                    Err(err) => {
                        tracing::error!(task_id = %task.id, error = %err, "task update failed");
                    }
                }
            }
        }
        Ok(summary)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(summary) if summary.polled > 0 => {
                            tracing::debug!(
                                polled = summary.polled,
                                applied = summary.applied,
                                ignored = summary.ignored,
                                failed_fetches = summary.failed_fetches,
                                "task poll finished"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "task poll failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("task poller shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> PollerHandle {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.run(cancel.clone()));
        PollerHandle {
            cancel,
            task: handle.abort_handle(),
        }
    }
}
