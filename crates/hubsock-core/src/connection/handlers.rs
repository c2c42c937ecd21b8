// ── Handler registries ──
//
// Connection and log handlers are lists deduplicated by identity; the
// command output handlers hold a single slot each.

use std::sync::Arc;

use super::Connection;
use crate::callback::{CmdExitHandler, CmdOutputHandler, ConnectionHandler, LogHandler};
use crate::subscription::same_handler;

impl Connection {
    /// Called with `true` on every (re)connect and `false` on disconnect.
    /// Registering the same handler twice has no effect.
    pub fn register_connection_handler(&self, handler: Arc<ConnectionHandler>) {
        let mut t = self.tables();
        if !t
            .connection_handlers
            .iter()
            .any(|h| same_handler(h, &handler))
        {
            t.connection_handlers.push(handler);
        }
    }

    pub fn unregister_connection_handler(&self, handler: &Arc<ConnectionHandler>) {
        self.tables()
            .connection_handlers
            .retain(|h| !same_handler(h, handler));
    }

    /// Receive every pushed log line. Registering the same handler twice
    /// has no effect.
    pub fn register_log_handler(&self, handler: Arc<LogHandler>) {
        let mut t = self.tables();
        if !t.log_handlers.iter().any(|h| same_handler(h, &handler)) {
            t.log_handlers.push(handler);
        }
    }

    pub fn unregister_log_handler(&self, handler: &Arc<LogHandler>) {
        self.tables()
            .log_handlers
            .retain(|h| !same_handler(h, handler));
    }

    /// Replace the `cmdStdout` handler.
    pub fn register_cmd_stdout_handler(&self, handler: Arc<CmdOutputHandler>) {
        self.tables().cmd_stdout = Some(handler);
    }

    pub fn unregister_cmd_stdout_handler(&self) {
        self.tables().cmd_stdout = None;
    }

    /// Replace the `cmdStderr` handler.
    pub fn register_cmd_stderr_handler(&self, handler: Arc<CmdOutputHandler>) {
        self.tables().cmd_stderr = Some(handler);
    }

    pub fn unregister_cmd_stderr_handler(&self) {
        self.tables().cmd_stderr = None;
    }

    /// Replace the `cmdExit` handler.
    pub fn register_cmd_exit_handler(&self, handler: Arc<CmdExitHandler>) {
        self.tables().cmd_exit = Some(handler);
    }

    pub fn unregister_cmd_exit_handler(&self) {
        self.tables().cmd_exit = None;
    }
}
