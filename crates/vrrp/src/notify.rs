//! Notifier (§4.8): per-transition script spawn and FIFO event fan-out.
//!
//! Process spawn is abstracted behind [`ProcessLauncher`] so tests don't
//! fork real children; the FIFO is abstracted behind [`FifoWriter`] for the
//! same reason (opening a named pipe for writing can block indefinitely if
//! nothing has it open for reading).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::types::NotifyEvent;

/// One notify dispatch's context, turned into environment variables for a
/// spawned script and a newline-delimited record for the FIFO.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    pub instance: String,
    pub group: Option<String>,
    pub event: NotifyEvent,
    pub priority: u8,
}

impl NotifyContext {
    pub fn as_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("VRRP_INSTANCE_NAME".to_string(), self.instance.clone());
        env.insert("VRRP_INSTANCE_STATE".to_string(), self.event.to_string());
        env.insert("VRRP_INSTANCE_PRIORITY".to_string(), self.priority.to_string());
        if let Some(group) = &self.group {
            env.insert("VRRP_GROUP_NAME".to_string(), group.clone());
        }
        env
    }

    /// FIFO line: `instance|group-or-dash|event|priority`.
    pub fn as_fifo_record(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.instance,
            self.group.as_deref().unwrap_or("-"),
            self.event,
            self.priority
        )
    }
}

/// Seam for actually forking and running a notify script. A real
/// implementation shells out (`tokio::process::Command`); tests use an
/// in-memory recorder.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, command: &str, env: &HashMap<String, String>) -> std::io::Result<()>;
}

/// Seam for writing one line to the configured notify FIFO.
#[async_trait]
pub trait FifoWriter: Send + Sync {
    async fn write_line(&self, path: &str, line: &str) -> std::io::Result<()>;
}

/// Per-instance notify script configuration, one optional command per
/// event kind plus an optional FIFO path.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub on_backup: Option<String>,
    pub on_master: Option<String>,
    pub on_fault: Option<String>,
    pub on_stop: Option<String>,
    pub fifo_path: Option<String>,
}

impl NotifyConfig {
    fn command_for(&self, event: NotifyEvent) -> Option<&str> {
        match event {
            NotifyEvent::Backup => self.on_backup.as_deref(),
            NotifyEvent::Master => self.on_master.as_deref(),
            NotifyEvent::Fault => self.on_fault.as_deref(),
            NotifyEvent::Stop => self.on_stop.as_deref(),
            // DELETED and MASTER_RX_LOWER_PRI have no dedicated script slot
            // in the config shape; only the FIFO receives them.
            NotifyEvent::Deleted | NotifyEvent::MasterRxLowerPri => None,
        }
    }
}

/// Dispatches one event to its configured script and/or FIFO. Failures are
/// logged (by the caller, via the returned error) but never propagate into
/// the state machine — §4.8 "Failures to exec are logged but never block
/// the state machine."
pub struct Notifier<'a> {
    launcher: &'a dyn ProcessLauncher,
    fifo: &'a dyn FifoWriter,
}

impl<'a> Notifier<'a> {
    pub fn new(launcher: &'a dyn ProcessLauncher, fifo: &'a dyn FifoWriter) -> Self {
        Self { launcher, fifo }
    }

    /// Returns the individual script/FIFO failures (if any) rather than a
    /// single combined error, so the caller can log each with its own
    /// tracing event without losing which sink failed.
    pub async fn dispatch(&self, config: &NotifyConfig, ctx: &NotifyContext) -> NotifyOutcome {
        let script_result = match config.command_for(ctx.event) {
            Some(command) => Some(self.launcher.spawn(command, &ctx.as_env()).await),
            None => None,
        };
        let fifo_result = match &config.fifo_path {
            Some(path) => Some(self.fifo.write_line(path, &ctx.as_fifo_record()).await),
            None => None,
        };
        NotifyOutcome { script_result, fifo_result }
    }
}

#[derive(Debug)]
pub struct NotifyOutcome {
    pub script_result: Option<std::io::Result<()>>,
    pub fifo_result: Option<std::io::Result<()>>,
}

impl NotifyOutcome {
    pub fn had_any_failure(&self) -> bool {
        self.script_result.as_ref().is_some_and(|r| r.is_err())
            || self.fifo_result.as_ref().is_some_and(|r| r.is_err())
    }
}
