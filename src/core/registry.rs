//! Handler registry: order types resolved to handlers, protocol names resolved to
//! plugins. Both tables are assembled once at startup from explicit lists.

use super::executor::{Fleet, FleetExecutor};
use super::state::BuildState;
use super::types::{Command, CommandResult, OrderType};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// How a handler failed. Plain string errors are treated as retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl From<String> for PluginError {
    fn from(value: String) -> Self {
        Self::Retryable(value)
    }
}

impl PluginError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Translate a handler outcome into a command result.
pub fn to_result(outcome: Result<Option<serde_json::Value>, PluginError>) -> CommandResult {
    match outcome {
        Ok(output) => CommandResult::Success(output),
        Err(PluginError::Retryable(cause)) => CommandResult::Error(cause),
        Err(PluginError::Fatal(cause)) => CommandResult::Fatal(cause),
    }
}

/// Executes one kind of order. Output data marks the end of an operation and
/// is forwarded on the completion queue.
#[async_trait]
pub trait OrderHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> Result<Option<serde_json::Value>, PluginError>;
}

/// Order type to handler table.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<OrderType, Arc<dyn OrderHandler>>,
}

impl Registry {
    /// Build from a static table. Registering an order type twice is an error.
    pub fn from_table(table: Vec<(OrderType, Arc<dyn OrderHandler>)>) -> Result<Self, String> {
        let mut handlers = HashMap::new();
        for (order_type, handler) in table {
            if handlers.insert(order_type, handler).is_some() {
                return Err(format!("order type {} registered twice", order_type));
            }
        }
        Ok(Self { handlers })
    }

    pub fn resolve(&self, order_type: OrderType) -> Option<Arc<dyn OrderHandler>> {
        self.handlers.get(&order_type).cloned()
    }

    /// Order types with no handler, in declaration order.
    pub fn missing(&self) -> Vec<OrderType> {
        OrderType::ALL
            .into_iter()
            .filter(|t| !self.handlers.contains_key(t))
            .collect()
    }

    /// Run the command's handler and classify the outcome.
    pub async fn dispatch(&self, command: &Command) -> CommandResult {
        match self.resolve(command.order.order_type) {
            Some(handler) => to_result(handler.handle(command).await),
            None => CommandResult::Fatal(format!(
                "no handler registered for order type {}",
                command.order.order_type
            )),
        }
    }
}

/// Everything a protocol plugin works with during one operation.
pub struct BuildEnv {
    pub state: Arc<BuildState>,
    pub fleet: Fleet,
    pub executor: Arc<FleetExecutor>,
    /// Protocol parameters from the order payload
    pub params: serde_json::Value,
    /// File inside node containers that daemons tee their output to
    pub output_file: String,
}

/// A blockchain protocol that knows how to build a network and scale it out.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    async fn build(&self, env: &BuildEnv) -> Result<(), PluginError>;

    async fn add(&self, env: &BuildEnv) -> Result<(), PluginError>;

    /// Default parameters.
    fn defaults(&self) -> serde_json::Value;

    /// JSON schema of the parameters.
    fn params(&self) -> serde_json::Value;
}

/// Protocol name to plugin table. Aliases are extra rows.
#[derive(Default)]
pub struct Protocols {
    table: IndexMap<String, Arc<dyn Protocol>>,
}

impl Protocols {
    pub fn from_table(table: Vec<(&str, Arc<dyn Protocol>)>) -> Result<Self, String> {
        let mut out = IndexMap::new();
        for (name, plugin) in table {
            if out.insert(name.to_string(), plugin).is_some() {
                return Err(format!("protocol {} registered twice", name));
            }
        }
        Ok(Self { table: out })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.table.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::types::{Order, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted sequence of outcomes, then succeeds.
    pub(crate) struct ScriptedHandler {
        pub script: Mutex<Vec<Result<Option<serde_json::Value>, PluginError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedHandler {
        pub(crate) fn new(script: Vec<Result<Option<serde_json::Value>, PluginError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderHandler for ScriptedHandler {
        async fn handle(&self, _: &Command) -> Result<Option<serde_json::Value>, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop().unwrap_or(Ok(None))
        }
    }

    pub(crate) fn command(id: &str, order_type: OrderType, deps: &[&str]) -> Command {
        Command {
            id: id.to_string(),
            timestamp: 0,
            retry: 0,
            target: Target {
                testnet: "tn".to_string(),
                ip: None,
            },
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            order: Order {
                order_type,
                payload: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn test_registry_error_translation() {
        assert_eq!(to_result(Ok(None)), CommandResult::Success(None));
        assert_eq!(
            to_result(Err(PluginError::from("flaky".to_string()))),
            CommandResult::Error("flaky".to_string())
        );
        assert_eq!(
            to_result(Err(PluginError::fatal("bad payload"))),
            CommandResult::Fatal("bad payload".to_string())
        );
    }

    #[test]
    fn test_registry_duplicate_rejected() {
        let h: Arc<dyn OrderHandler> = ScriptedHandler::new(vec![]);
        let err = Registry::from_table(vec![
            (OrderType::Build, h.clone()),
            (OrderType::Build, h),
        ])
        .err()
        .unwrap();
        assert!(err.contains("build registered twice"));
    }

    #[test]
    fn test_registry_missing() {
        let h: Arc<dyn OrderHandler> = ScriptedHandler::new(vec![]);
        let reg = Registry::from_table(vec![(OrderType::CreateContainer, h)]).unwrap();
        let missing = reg.missing();
        assert_eq!(missing.len(), OrderType::ALL.len() - 1);
        assert!(!missing.contains(&OrderType::CreateContainer));
    }

    #[tokio::test]
    async fn test_registry_dispatch() {
        let handler = ScriptedHandler::new(vec![Err(PluginError::from("once".to_string()))]);
        let h: Arc<dyn OrderHandler> = handler.clone();
        let reg = Registry::from_table(vec![(OrderType::CreateContainer, h)]).unwrap();
        let cmd = command("a", OrderType::CreateContainer, &[]);
        assert_eq!(reg.dispatch(&cmd).await, CommandResult::Error("once".to_string()));
        assert_eq!(reg.dispatch(&cmd).await, CommandResult::Success(None));
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn test_registry_unregistered_is_fatal() {
        let reg = Registry::default();
        let cmd = command("a", OrderType::Build, &[]);
        assert!(reg.dispatch(&cmd).await.is_fatal());
    }
}
