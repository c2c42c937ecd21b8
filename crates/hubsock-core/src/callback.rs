// ── Handler types and construction hooks ──
//
// Subscribers and hooks are plain closures behind `Arc`. Every invocation
// goes through `guarded`, so a panicking handler is logged and the
// remaining handlers still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;

use crate::connection::ConnectionState;
use crate::model::{IoObject, LogEntry, ObjectIdentity, PermissionError, State};

/// `(id, state)`. `None` when the state was deleted.
pub type StateHandler = dyn Fn(&str, Option<&State>) + Send + Sync;
/// `(id, object, previous identity)`. `object` is `None` on deletion.
pub type ObjectHandler = dyn Fn(&str, Option<&IoObject>, Option<&ObjectIdentity>) + Send + Sync;
/// `(meta id, file name, size)`. `size` is `None` when the file was removed.
pub type FileHandler = dyn Fn(&str, &str, Option<u64>) + Send + Sync;
/// `(data, source instance, message type)`.
pub type InstanceMessageHandler = dyn Fn(&Value, &str, &str) + Send + Sync;
pub type ConnectionHandler = dyn Fn(bool) + Send + Sync;
pub type LogHandler = dyn Fn(&LogEntry) + Send + Sync;
/// `(command id, text)`.
pub type CmdOutputHandler = dyn Fn(&str, &str) + Send + Sync;
/// `(command id, exit code)`.
pub type CmdExitHandler = dyn Fn(&str, i64) + Send + Sync;

type Hook<T> = Option<Arc<T>>;

/// Hooks installed at construction time.
///
/// All hooks are optional. Without `on_error` errors are logged through
/// `tracing`; without `on_permission_error` permission denials are
/// reported through `on_error`.
#[derive(Default, Clone)]
pub struct ConnectionCallbacks {
    pub(crate) on_progress: Hook<dyn Fn(ConnectionState) + Send + Sync>,
    pub(crate) on_ready: Hook<dyn Fn(&HashMap<String, IoObject>) + Send + Sync>,
    pub(crate) on_error: Hook<dyn Fn(&str) + Send + Sync>,
    pub(crate) on_log: Hook<LogHandler>,
    pub(crate) on_object_change: Hook<dyn Fn(&str, Option<&IoObject>) + Send + Sync>,
    pub(crate) on_language: Hook<dyn Fn(&str) + Send + Sync>,
    pub(crate) on_permission_error: Hook<dyn Fn(&PermissionError) + Send + Sync>,
    pub(crate) on_auth_required: Hook<dyn Fn() + Send + Sync>,
    pub(crate) on_restart_required: Hook<dyn Fn() + Send + Sync>,
}

impl ConnectionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_progress(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Called once the initial load finished, with the object set that
    /// was loaded (the whole tree, or just `system.config`).
    #[must_use]
    pub fn on_ready(
        mut self,
        f: impl Fn(&HashMap<String, IoObject>) + Send + Sync + 'static,
    ) -> Self {
        self.on_ready = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_log(mut self, f: impl Fn(&LogEntry) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_object_change(
        mut self,
        f: impl Fn(&str, Option<&IoObject>) + Send + Sync + 'static,
    ) -> Self {
        self.on_object_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_language(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_language = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_permission_error(
        mut self,
        f: impl Fn(&PermissionError) + Send + Sync + 'static,
    ) -> Self {
        self.on_permission_error = Some(Arc::new(f));
        self
    }

    /// The server asked for a fresh login.
    #[must_use]
    pub fn on_auth_required(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_auth_required = Some(Arc::new(f));
        self
    }

    /// A restart was armed with `set_wait_for_restart` and the
    /// connection came back; the embedding UI should reload.
    #[must_use]
    pub fn on_restart_required(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_restart_required = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_ready", &self.on_ready.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_log", &self.on_log.is_some())
            .field("on_object_change", &self.on_object_change.is_some())
            .field("on_language", &self.on_language.is_some())
            .field("on_permission_error", &self.on_permission_error.is_some())
            .field("on_auth_required", &self.on_auth_required.is_some())
            .field("on_restart_required", &self.on_restart_required.is_some())
            .finish()
    }
}

/// Run a handler, logging instead of unwinding if it panics.
pub(crate) fn guarded(handler: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".into());
        tracing::error!(handler, %message, "subscriber panicked");
    }
}
