use tokio::sync::broadcast;

/// Typed events the manager emits, replacing the "inherit EventEmitter"
/// pattern spec.md's REDESIGN FLAGS calls out: no dynamic string event
/// names escape the manager's boundary, only this closed sum type.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Fired after the aggregate tool catalog changes following a
    /// per-service `(re)connect()` (spec.md §4.4's "tool-cache refresh").
    ToolsChanged,
    /// One service transitioned to `Failed` after exhausting its
    /// reconnect policy (spec.md §7's propagation policy: "the manager
    /// records the last error; other services are unaffected").
    ServiceFailed { service: String },
}

/// A small broadcast bus so multiple consumers (notably `ProxyMCPServer`)
/// can subscribe to manager events without the manager holding a
/// callback list keyed by string event name.
pub(crate) struct EventBus {
    sender: broadcast::Sender<ManagerEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        // No receivers is a normal state (e.g. before the proxy subscribes);
        // `send` only errors when every receiver has been dropped.
        let _ = self.sender.send(event);
    }
}
