//! Commands fanned out to every running task of an application.
//!
//! Exec commands travel as executor messages; results come back as
//! executor reports and are merged under the per-command lock.

use drover_id::CommandId;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::driver::ExecutorMessage;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{Command, CommandKind, CommandResult, CommandState, TaskGroup, TaskStatus};
use crate::store::StoreError;

pub struct CommandService {
    ctx: Context,
}

impl CommandService {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Runs `command` in every running task of the application.
    pub async fn exec(&self, namespace: &str, app: &str, command: &str) -> SchedulerResult<Command> {
        self.fan_out(
            namespace,
            app,
            CommandKind::Exec {
                command: command.to_string(),
            },
        )
        .await
    }

    /// Delivers `signal` to every running task of the application.
    pub async fn send_signal(&self, namespace: &str, app: &str, signal: i32) -> SchedulerResult<Command> {
        self.fan_out(namespace, app, CommandKind::Signal { signal }).await
    }

    async fn fan_out(&self, namespace: &str, app: &str, kind: CommandKind) -> SchedulerResult<Command> {
        let targets = self.running_groups(namespace, app).await?;
        let mut command = Command {
            id: CommandId::new(),
            namespace: namespace.to_string(),
            app: app.to_string(),
            kind,
            results: Default::default(),
            created_at: self.ctx.now(),
        };
        let _guard = self.ctx.locks.lock_command(&command.id.to_string()).await;

        for group in &targets {
            for task in group.tasks.iter().filter(|t| t.status == TaskStatus::Running) {
                command.results.insert(task.id.to_string(), CommandResult::pending());
            }
        }
        self.ctx.store.put_command(&command).await?;

        for group in &targets {
            for task in group.tasks.iter().filter(|t| t.status == TaskStatus::Running) {
                let task_id = task.id.to_string();
                let message = match &command.kind {
                    CommandKind::Exec { command: line } => ExecutorMessage::Exec {
                        command_id: command.id,
                        task_id: task_id.clone(),
                        command: line.clone(),
                    },
                    CommandKind::Signal { signal } => ExecutorMessage::Signal {
                        task_id: task_id.clone(),
                        signal: *signal,
                    },
                };
                let sent = self
                    .ctx
                    .driver
                    .message(&group.agent_id, &group.id.executor_id(), &message)
                    .await;

                let result = match (sent, &command.kind) {
                    (Err(e), _) => {
                        warn!(command_id = %command.id, task_id = %task_id, error = %e, "Command delivery failed");
                        Some(CommandResult {
                            state: CommandState::Failed,
                            exit_code: None,
                            output: Some(e.to_string()),
                        })
                    }
                    // Signals report nothing back; delivery is the result.
                    (Ok(()), CommandKind::Signal { .. }) => Some(CommandResult {
                        state: CommandState::Succeeded,
                        exit_code: None,
                        output: None,
                    }),
                    (Ok(()), CommandKind::Exec { .. }) => None,
                };
                if let Some(result) = result {
                    command.results.insert(task_id, result);
                }
            }
        }

        self.ctx.store.put_command(&command).await?;
        info!(
            command_id = %command.id,
            app = %format!("{namespace}.{app}"),
            tasks = command.results.len(),
            "Command dispatched"
        );
        Ok(command)
    }

    /// Merges one task's exec result.
    pub async fn handle_result(
        &self,
        command_id: &CommandId,
        task_id: &str,
        exit_code: i32,
        output: Option<String>,
    ) -> SchedulerResult<()> {
        let _guard = self.ctx.locks.lock_command(&command_id.to_string()).await;
        let Some(mut command) = self.ctx.store.get_command(command_id).await? else {
            debug!(command_id = %command_id, "Result for unknown command");
            return Ok(());
        };
        let Some(result) = command.results.get_mut(task_id) else {
            debug!(command_id = %command_id, task_id, "Result for a task outside the command");
            return Ok(());
        };
        result.state = if exit_code == 0 {
            CommandState::Succeeded
        } else {
            CommandState::Failed
        };
        result.exit_code = Some(exit_code);
        result.output = output;
        self.ctx.store.put_command(&command).await?;
        if command.is_complete() {
            info!(command_id = %command_id, "Command complete");
        }
        Ok(())
    }

    pub async fn get(&self, id: &CommandId) -> SchedulerResult<Command> {
        self.ctx
            .store
            .get_command(id)
            .await?
            .ok_or_else(|| SchedulerError::Store(StoreError::not_found("command", id.to_string())))
    }

    async fn running_groups(&self, namespace: &str, app: &str) -> SchedulerResult<Vec<TaskGroup>> {
        let application = self
            .ctx
            .store
            .get_application(namespace, app)
            .await?
            .ok_or_else(|| SchedulerError::AppNotFound(format!("{namespace}.{app}")))?;
        let mut groups = Vec::new();
        for id in application.task_groups.values() {
            if let Some(group) = self.ctx.store.get_task_group(id).await? {
                if group.has_running_task() {
                    groups.push(group);
                }
            }
        }
        Ok(groups)
    }
}
