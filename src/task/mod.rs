//! Durable async jobs: creation after a successful submit, status reads for the
//! feed endpoints and monotonic updates from provider polls.

pub mod poller;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::ledger::QuotaLedger;
use crate::observability::Observability;
use crate::store::{TaskStore, now_millis};
use crate::utils::ids;

pub use poller::{PollSummary, PollerHandle, TaskPollConfig, TaskPoller};

const MAX_UPDATE_ATTEMPTS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Terminal tasks accept nothing; live tasks accept same-or-later states.
    pub fn accepts(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub provider_task_id: String,
    pub platform: String,
    pub action: String,
    pub user_id: i64,
    pub channel_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub quota: i64,
    pub submit_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time_ms: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Position in the `(submit_time_ms, id)` order of unfinished tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskCursor {
    pub submit_time_ms: u64,
    pub id: String,
}

impl TaskCursor {
    pub fn precedes(&self, task: &Task) -> bool {
        (self.submit_time_ms, self.id.as_str()) < (task.submit_time_ms, task.id.as_str())
    }
}

impl From<&Task> for TaskCursor {
    fn from(task: &Task) -> Self {
        Self {
            submit_time_ms: task.submit_time_ms,
            id: task.id.clone(),
        }
    }
}

/// Fields written by a single status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: Option<String>,
    pub fail_reason: Option<String>,
    pub data: serde_json::Value,
    pub start_time_ms: Option<u64>,
    pub finish_time_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub platform: String,
    pub action: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: Option<i64>,
    pub provider_task_id: String,
    pub quota: i64,
    pub data: serde_json::Value,
}

/// Status report for one job as returned by a provider's fetch endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderTaskUpdate {
    pub provider_task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub fail_reason: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskTransition {
    Applied { from: TaskStatus, to: TaskStatus },
    Ignored { current: TaskStatus },
}

/// Feed lookups keyed by relay mode.
#[derive(Clone, Debug)]
pub enum FeedQuery {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Serialize)]
struct FeedDocument<T> {
    code: &'static str,
    message: &'static str,
    data: T,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    ledger: Arc<QuotaLedger>,
    observability: Arc<Observability>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<QuotaLedger>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            ledger,
            observability,
        }
    }

    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let now = now_millis();
        let task = Task {
            id: ids::task_id(),
            provider_task_id: new.provider_task_id,
            platform: new.platform,
            action: new.action,
            user_id: new.user_id,
            channel_id: new.channel_id,
            token_id: new.token_id,
            status: TaskStatus::Pending,
            progress: None,
            fail_reason: None,
            quota: new.quota,
            submit_time_ms: now,
            start_time_ms: Some(now),
            finish_time_ms: None,
            data: new.data,
        };
        self.store.insert_task(&task).await?;
        self.observability.record_task_created();
        tracing::info!(
            task_id = %task.id,
            provider_task_id = %task.provider_task_id,
            platform = %task.platform,
            channel_id = task.channel_id,
            quota = task.quota,
            "task created"
        );
        Ok(task)
    }

    /// Reads the cached task state; never talks to the provider.
    pub async fn get_task_status(&self, user_id: Option<i64>, id: &str) -> Result<Task> {
        self.store
            .find_task(user_id, id)
            .await?
            .ok_or_else(|| RelayError::TaskNotFound {
                task_id: id.to_string(),
            })
    }

    pub async fn unfinished_tasks(
        &self,
        after: Option<&TaskCursor>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        Ok(self.store.unfinished_tasks(after, limit).await?)
    }

    /// Serialized status document for the feed endpoints.
    pub async fn feed(&self, user_id: i64, query: FeedQuery) -> Result<Vec<u8>> {
        let body = match query {
            FeedQuery::One(id) => {
                let task = self.get_task_status(Some(user_id), &id).await?;
                serde_json::to_vec(&FeedDocument {
                    code: "success",
                    message: "",
                    data: task,
                })
            }
            FeedQuery::Many(ids) => {
                if ids.is_empty() {
                    return Err(RelayError::invalid_request(
                        "invalid_request",
                        "ids must not be empty",
                    ));
                }
                let tasks = self.store.find_tasks(user_id, &ids).await?;
                serde_json::to_vec(&FeedDocument {
                    code: "success",
                    message: "",
                    data: tasks,
                })
            }
        };
        body.map_err(|err| RelayError::Store(err.into()))
    }

    /// Advances a task monotonically. Stale, duplicate or post-terminal
    /// updates are ignored rather than reported as errors.
    pub async fn update_from_provider_poll(
        &self,
        task: &Task,
        update: ProviderTaskUpdate,
    ) -> Result<TaskTransition> {
        let mut current = task.clone();
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            if !current.status.accepts(update.status) {
                return Ok(TaskTransition::Ignored {
                    current: current.status,
                });
            }

            let now = now_millis();
            let patch = TaskUpdate {
                status: update.status,
                progress: update.progress.clone().or_else(|| current.progress.clone()),
                fail_reason: update.fail_reason.clone(),
                data: if update.data.is_null() {
                    current.data.clone()
                } else {
                    update.data.clone()
                },
                start_time_ms: current.start_time_ms.or(Some(now)),
                finish_time_ms: update.status.is_terminal().then_some(now),
            };

            if self
                .store
                .compare_and_update_task(&current.id, current.status, &patch)
                .await?
            {
                let from = current.status;
                if update.status == TaskStatus::Failed && current.quota > 0 {
                    self.refund_failed_task(&current, update.fail_reason.as_deref())
                        .await;
                }
                tracing::debug!(
                    task_id = %current.id,
                    from = from.as_str(),
                    to = update.status.as_str(),
                    "task status advanced"
                );
                return Ok(TaskTransition::Applied {
                    from,
                    to: update.status,
                });
            }

            match self.store.find_task(None, &current.id).await? {
                Some(reloaded) => current = reloaded,
                None => {
                    return Err(RelayError::TaskNotFound {
                        task_id: current.id.clone(),
                    });
                }
            }
        }

        Ok(TaskTransition::Ignored {
            current: current.status,
        })
    }

    async fn refund_failed_task(&self, task: &Task, reason: Option<&str>) {
        let content = format!(
            "task {} ({}) failed, refunded {} quota: {}",
            task.id,
            task.action,
            task.quota,
            reason.unwrap_or("unknown reason")
        );
        if let Err(err) = self
            .ledger
            .refund(task.user_id, task.quota, Some(task.channel_id), content)
            .await
        {
            tracing::error!(
                task_id = %task.id,
                user_id = task.user_id,
                quota = task.quota,
                error = %err,
                "failed to refund quota for failed task"
            );
            return;
        }
        self.observability.record_refund();
    }
}
