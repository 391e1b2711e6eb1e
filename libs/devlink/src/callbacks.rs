//! Callback slots a connection invokes on its owner

use std::fmt;
use std::sync::Arc;

use crate::connection::Payload;

/// `(source, data)` for every received unit of data
pub type DataCallback = Arc<dyn Fn(&str, Payload) + Send + Sync>;

/// `(source)` for connect/disconnect notifications
pub type LifecycleCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// `(should_suspend, by)` after repeated reconnect failures
pub type SuspendCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;

/// Runs after a successful `open()`
pub type OpenHook = Arc<dyn Fn() + Send + Sync>;

/// Runs before each send; returning `false` cancels the send
pub type SendHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// Lifecycle callbacks and hooks supplied by the owning plugin
#[derive(Clone, Default)]
pub struct LinkCallbacks {
    pub on_connect: Option<LifecycleCallback>,
    pub on_disconnect: Option<LifecycleCallback>,
    pub on_suspend: Option<SuspendCallback>,
    pub init_on_open: Option<OpenHook>,
    pub init_on_send: Option<SendHook>,
}

impl LinkCallbacks {
    pub fn is_empty(&self) -> bool {
        self.on_connect.is_none()
            && self.on_disconnect.is_none()
            && self.on_suspend.is_none()
            && self.init_on_open.is_none()
            && self.init_on_send.is_none()
    }
}

impl fmt::Debug for LinkCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_suspend", &self.on_suspend.is_some())
            .field("init_on_open", &self.init_on_open.is_some())
            .field("init_on_send", &self.init_on_send.is_some())
            .finish()
    }
}
