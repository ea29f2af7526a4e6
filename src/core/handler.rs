//! Delivery handler: decode → ledger gate → dispatch → retry policy → publish.
//!
//! Decode failures and failed dependencies are fatal. Unresolved dependencies
//! are a wait, not a failure: the command is republished after a fixed delay
//! with its retry count untouched. Retryable errors are republished through the
//! delayed exchange with a delay proportional to the attempt number until
//! `max_message_retries` is exceeded, at which point they are dead-lettered.
//! The issuer sees exactly one terminal status per command ID.

use super::config::Config;
use super::eventlog::{self, now_iso8601};
use super::ledger::{DependencyLedger, Gate, Outcome};
use super::registry::Registry;
use super::types::{
    Command, CommandResult, CompletionMessage, ErrorMessage, StatusKind, StatusUpdate,
};
use crate::queue::{Broker, Delivery};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Decode a message body into a command and check its target.
pub fn decode(body: &[u8]) -> Result<Command, String> {
    let command: Command =
        serde_json::from_slice(body).map_err(|e| format!("malformed command: {}", e))?;
    command
        .validate()
        .map_err(|e| format!("invalid command {}: {}", command.id, e))?;
    Ok(command)
}

pub struct DeliveryHandler {
    config: Config,
    registry: Registry,
    ledger: DependencyLedger,
    broker: Arc<dyn Broker>,
    gate: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
}

impl DeliveryHandler {
    pub fn new(config: Config, registry: Registry, broker: Arc<dyn Broker>) -> Self {
        let ledger = DependencyLedger::new(config.ledger_retention);
        let gate = Arc::new(Semaphore::new(config.queue_max_concurrency.max(1)));
        Self {
            config,
            registry,
            ledger,
            broker,
            gate,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &DependencyLedger {
        &self.ledger
    }

    /// Admission gate bounding the commands mid-dispatch at once.
    pub fn gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate)
    }

    /// Decode and dispatch only: no dependency gate, no retry decision,
    /// nothing published.
    pub async fn process_message(&self, delivery: &Delivery) -> CommandResult {
        match decode(&delivery.body) {
            Ok(command) => self.registry.dispatch(&command).await,
            Err(cause) => CommandResult::Fatal(cause),
        }
    }

    /// Handle one delivery end to end. Returns whether the command was put back
    /// on the queue, and the result of this attempt.
    pub async fn process(&self, delivery: &Delivery) -> (bool, CommandResult) {
        let command = match decode(&delivery.body) {
            Ok(c) => c,
            Err(cause) => {
                warn!(queue = %delivery.queue, error = %cause, "dropping undecodable message");
                self.dead_letter(ErrorMessage {
                    command: None,
                    body: Some(String::from_utf8_lossy(&delivery.body).to_string()),
                    cause: cause.clone(),
                })
                .await;
                return (false, CommandResult::Fatal(cause));
            }
        };

        match self.ledger.outcome(&command.id) {
            Some(Outcome::Success) => {
                info!(id = %command.id, "duplicate delivery of a completed command");
                return (false, CommandResult::Success(None));
            }
            Some(Outcome::Fatal) => {
                info!(id = %command.id, "duplicate delivery of a failed command");
                return (
                    false,
                    CommandResult::Fatal(format!("command {} already failed", command.id)),
                );
            }
            _ => {}
        }

        match self.ledger.check(&command.dependencies) {
            Gate::Ready => {}
            Gate::Failed(dep) => {
                let cause = format!("dependency {} failed", dep);
                self.fail(&command, &cause).await;
                return (false, CommandResult::Fatal(cause));
            }
            Gate::Wait(waiting) => {
                debug!(id = %command.id, waiting = ?waiting, "dependencies unresolved");
                let cause = format!("waiting on {}", waiting.join(", "));
                return self.wait(&command, cause).await;
            }
        }

        if !self.claim(&command.id) {
            let cause = format!("command {} is already being processed", command.id);
            return self.wait(&command, cause).await;
        }

        info!(
            id = %command.id,
            order = %command.order.order_type,
            network = %command.target.testnet,
            retry = command.retry,
            "dispatching"
        );
        let result = self.registry.dispatch(&command).await;
        let settled = self.settle(command.clone(), result).await;
        self.release(&command.id);
        settled
    }

    fn claim(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    /// Put a command back without consuming a retry.
    async fn wait(&self, command: &Command, cause: String) -> (bool, CommandResult) {
        self.republish(command, self.config.dependency_wait()).await;
        (true, CommandResult::Error(cause))
    }

    async fn settle(&self, mut command: Command, result: CommandResult) -> (bool, CommandResult) {
        match result {
            CommandResult::Success(output) => {
                if self.ledger.record(&command.id, Outcome::Success) != Outcome::Success {
                    return (false, CommandResult::Success(output));
                }
                info!(id = %command.id, "command succeeded");
                self.publish_status(&command, StatusKind::Success, None).await;
                if let Some(ref out) = output {
                    let message = CompletionMessage {
                        id: command.id.clone(),
                        target: command.target.clone(),
                        output: out.clone(),
                    };
                    self.publish_json(&self.config.completion_queue_name, &message, Duration::ZERO)
                        .await;
                }
                (false, CommandResult::Success(output))
            }
            CommandResult::Error(cause) => {
                match command.retry.checked_add(1) {
                    Some(retry) if retry <= self.config.max_message_retries => {
                        command.retry = retry;
                        let delay = self.config.retry_delay() * u32::from(retry);
                        warn!(
                            id = %command.id,
                            retry,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %cause,
                            "command failed, retrying"
                        );
                        self.republish(&command, delay).await;
                        (true, CommandResult::Error(cause))
                    }
                    _ => {
                        command.retry = command.retry.saturating_add(1);
                        let cause = format!(
                            "retries exhausted after {} attempts: {}",
                            command.retry, cause
                        );
                        self.fail(&command, &cause).await;
                        (false, CommandResult::Fatal(cause))
                    }
                }
            }
            CommandResult::Fatal(cause) => {
                self.fail(&command, &cause).await;
                (false, CommandResult::Fatal(cause))
            }
        }
    }

    /// Record a terminal failure: ledger, error queue, status.
    async fn fail(&self, command: &Command, cause: &str) {
        if self.ledger.record(&command.id, Outcome::Fatal) != Outcome::Fatal {
            return;
        }
        error!(id = %command.id, retry = command.retry, error = %cause, "command failed");
        self.dead_letter(ErrorMessage {
            command: Some(command.clone()),
            body: None,
            cause: cause.to_string(),
        })
        .await;
        self.publish_status(command, StatusKind::Failure, Some(cause.to_string()))
            .await;
    }

    async fn dead_letter(&self, message: ErrorMessage) {
        if self.config.enable_error_collection {
            self.publish_json(&self.config.error_queue_name, &message, Duration::ZERO)
                .await;
        }
    }

    async fn republish(&self, command: &Command, delay: Duration) {
        self.publish_json(&self.config.command_queue_name, command, delay)
            .await;
    }

    async fn publish_status(&self, command: &Command, status: StatusKind, message: Option<String>) {
        let update = StatusUpdate {
            id: command.id.clone(),
            network: command.target.testnet.clone(),
            status,
            message,
            retry: command.retry,
            ts: now_iso8601(),
        };
        if let Some(dir) = &self.config.state_dir {
            if let Err(e) = eventlog::append_event(dir, &update) {
                warn!(id = %command.id, error = %e, "cannot append to event log");
            }
        }
        self.publish_json(&self.config.status_queue_name, &update, Duration::ZERO)
            .await;
    }

    async fn publish_json<T: Serialize + Sync>(&self, queue: &str, value: &T, delay: Duration) {
        let body = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                error!(queue, error = %e, "cannot serialize message");
                return;
            }
        };
        if let Err(e) = self.broker.publish(queue, body, delay).await {
            error!(queue, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::tests::{command, ScriptedHandler};
    use crate::core::registry::{OrderHandler, PluginError};
    use crate::core::types::OrderType;
    use crate::queue::memory::MemoryBroker;

    fn config(max_retries: u8) -> Config {
        Config {
            max_message_retries: max_retries,
            retry_delay_millis: 5,
            dependency_wait_millis: 5,
            ..Config::default()
        }
    }

    fn handler_with(
        config: Config,
        script: Vec<Result<Option<serde_json::Value>, PluginError>>,
    ) -> (DeliveryHandler, Arc<ScriptedHandler>, MemoryBroker) {
        let scripted = ScriptedHandler::new(script);
        let h: Arc<dyn OrderHandler> = scripted.clone();
        let registry = Registry::from_table(vec![
            (OrderType::CreateContainer, h.clone()),
            (OrderType::Build, h),
        ])
        .unwrap();
        let broker = MemoryBroker::new();
        let handler = DeliveryHandler::new(config, registry, Arc::new(broker.clone()));
        (handler, scripted, broker)
    }

    fn delivery(cmd: &Command) -> Delivery {
        Delivery::from_body("commands", serde_json::to_vec(cmd).unwrap())
    }

    fn statuses(broker: &MemoryBroker) -> Vec<StatusUpdate> {
        broker
            .published_to("status")
            .iter()
            .map(|p| serde_json::from_slice(&p.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_handler_success_without_dependencies() {
        let (h, scripted, broker) = handler_with(config(2), vec![]);
        let cmd = command("a", OrderType::CreateContainer, &[]);
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert_eq!(result, CommandResult::Success(None));
        assert_eq!(scripted.calls(), 1);
        assert!(broker.published_to("commands").is_empty());
        assert!(broker.published_to("teardownRequests").is_empty());
        let st = statuses(&broker);
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].status, StatusKind::Success);
        assert_eq!(h.ledger().outcome("a"), Some(Outcome::Success));
    }

    #[tokio::test]
    async fn test_handler_completion_carries_output() {
        let output = serde_json::json!({"network": "tn", "exported": {"port": 8545}});
        let (h, _, broker) = handler_with(config(2), vec![Ok(Some(output.clone()))]);
        let cmd = command("b", OrderType::Build, &[]);
        h.process(&delivery(&cmd)).await;
        let completions = broker.published_to("teardownRequests");
        assert_eq!(completions.len(), 1);
        let msg: CompletionMessage = serde_json::from_slice(&completions[0].body).unwrap();
        assert_eq!(msg.id, "b");
        assert_eq!(msg.output, output);
    }

    #[tokio::test]
    async fn test_handler_fatal_dependency_skips_dispatch() {
        let (h, scripted, broker) = handler_with(config(2), vec![]);
        h.ledger().record("dep", Outcome::Fatal);
        let cmd = command("c", OrderType::CreateContainer, &["dep"]);
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert!(result.is_fatal());
        assert_eq!(scripted.calls(), 0);
        assert_eq!(h.ledger().outcome("c"), Some(Outcome::Fatal));
        assert_eq!(broker.published_to("errors").len(), 1);
        assert_eq!(statuses(&broker)[0].status, StatusKind::Failure);
    }

    #[tokio::test]
    async fn test_handler_unresolved_dependency_waits_without_retry() {
        let (h, scripted, broker) = handler_with(config(2), vec![]);
        let cmd = command("d", OrderType::CreateContainer, &["dep"]);
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(requeue);
        assert!(matches!(result, CommandResult::Error(ref c) if c.contains("dep")));
        assert_eq!(scripted.calls(), 0);

        let requeued = broker.published_to("commands");
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].delay, Duration::from_millis(5));
        let again = decode(&requeued[0].body).unwrap();
        assert_eq!(again.retry, 0);
        assert_eq!(again.dependencies, vec!["dep"]);
        assert!(statuses(&broker).is_empty());

        h.ledger().record("dep", Outcome::Success);
        let (requeue, result) = h.process(&delivery(&again)).await;
        assert!(!requeue);
        assert!(result.is_success());
        assert_eq!(scripted.calls(), 1);
    }

    #[tokio::test]
    async fn test_handler_retries_then_dead_letters() {
        let script = (0..10)
            .map(|i| Err(PluginError::from(format!("attempt {}", i))))
            .collect();
        let (h, scripted, broker) = handler_with(config(2), script);
        let mut next = delivery(&command("e", OrderType::CreateContainer, &[]));
        let mut retries_seen = Vec::new();
        loop {
            let (requeue, result) = h.process(&next).await;
            if !requeue {
                assert!(result.is_fatal());
                break;
            }
            let d = broker.consume("commands").await.unwrap();
            retries_seen.push(decode(&d.body).unwrap().retry);
            broker.ack(&d).await.unwrap();
            next = d;
        }
        assert_eq!(scripted.calls(), 3);
        assert_eq!(retries_seen, vec![1, 2]);
        let delays: Vec<_> = broker
            .published_to("commands")
            .iter()
            .map(|p| p.delay)
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(5), Duration::from_millis(10)]);
        assert_eq!(broker.published_to("errors").len(), 1);
        let st = statuses(&broker);
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].status, StatusKind::Failure);
        assert_eq!(st[0].retry, 3);
        assert_eq!(h.ledger().outcome("e"), Some(Outcome::Fatal));
    }

    #[tokio::test]
    async fn test_handler_fail_once_then_succeed() {
        let (h, scripted, broker) =
            handler_with(config(5), vec![Err(PluginError::from("docker busy".to_string()))]);
        let cmd = command("a", OrderType::CreateContainer, &[]);
        let (requeue, _) = h.process(&delivery(&cmd)).await;
        assert!(requeue);
        let redelivered = broker.consume("commands").await.unwrap();
        let (requeue, result) = h.process(&redelivered).await;
        assert!(!requeue);
        assert!(result.is_success());

        let requeued = broker.published_to("commands");
        assert_eq!(requeued.len(), 1);
        assert!(requeued[0].delay > Duration::ZERO);
        assert!(broker.published_to("errors").is_empty());
        let st = statuses(&broker);
        assert_eq!(st.len(), 1);
        assert_eq!(st[0].status, StatusKind::Success);
        assert_eq!(st[0].retry, 1);
        assert_eq!(scripted.calls(), 2);
    }

    #[tokio::test]
    async fn test_handler_plugin_fatal_never_retried() {
        let (h, scripted, broker) =
            handler_with(config(5), vec![Err(PluginError::fatal("unknown image"))]);
        let cmd = command("f", OrderType::CreateContainer, &[]);
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert_eq!(result, CommandResult::Fatal("unknown image".to_string()));
        assert_eq!(scripted.calls(), 1);
        assert!(broker.published_to("commands").is_empty());
        assert_eq!(broker.published_to("errors").len(), 1);
    }

    #[tokio::test]
    async fn test_handler_undecodable_message() {
        let (h, scripted, broker) = handler_with(config(5), vec![]);
        let bad = Delivery::from_body("commands", "should be a failure");
        assert!(h.process_message(&bad).await.is_fatal());
        assert!(broker.history().is_empty());

        let (requeue, result) = h.process(&bad).await;
        assert!(!requeue);
        assert!(result.is_fatal());
        assert!(broker.published_to("commands").is_empty());
        let dead = broker.published_to("errors");
        assert_eq!(dead.len(), 1);
        let msg: ErrorMessage = serde_json::from_slice(&dead[0].body).unwrap();
        assert_eq!(msg.body.as_deref(), Some("should be a failure"));
        assert_eq!(scripted.calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_rejects_unsafe_target() {
        let (h, scripted, broker) = handler_with(config(5), vec![]);
        let mut cmd = command("k", OrderType::CreateContainer, &[]);
        cmd.target.testnet = "../../etc".to_string();
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert!(matches!(result, CommandResult::Fatal(ref c) if c.contains("network name")));
        assert_eq!(scripted.calls(), 0);
        assert_eq!(broker.published_to("errors").len(), 1);
        assert!(statuses(&broker).is_empty());

        let mut cmd = command("l", OrderType::CreateContainer, &[]);
        cmd.target.ip = Some("-oProxyCommand=touch /tmp/x".to_string());
        assert!(h.process_message(&delivery(&cmd)).await.is_fatal());
        assert_eq!(scripted.calls(), 0);
    }

    /// Holds every dispatch open for a while so deliveries overlap.
    struct SlowHandler {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OrderHandler for SlowHandler {
        async fn handle(&self, _: &Command) -> Result<Option<serde_json::Value>, PluginError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_handler_same_id_in_flight_is_requeued() {
        let slow = Arc::new(SlowHandler {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let h: Arc<dyn OrderHandler> = slow.clone();
        let registry = Registry::from_table(vec![(OrderType::CreateContainer, h)]).unwrap();
        let broker = MemoryBroker::new();
        let handler = DeliveryHandler::new(config(5), registry, Arc::new(broker.clone()));

        let cmd = command("m", OrderType::CreateContainer, &[]);
        let (first, second) = (delivery(&cmd), delivery(&cmd));
        let ((first_requeued, first_result), (second_requeued, second_result)) =
            tokio::join!(handler.process(&first), handler.process(&second));

        assert!(!first_requeued);
        assert!(first_result.is_success());
        assert!(second_requeued);
        assert!(
            matches!(second_result, CommandResult::Error(ref c) if c.contains("already being processed"))
        );
        assert_eq!(slow.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let requeued = broker.published_to("commands");
        assert_eq!(requeued.len(), 1);
        assert_eq!(decode(&requeued[0].body).unwrap().retry, 0);
        assert_eq!(statuses(&broker).len(), 1);

        // The requeued copy lands on a completed ID and stays silent.
        let (requeue, result) = handler.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert!(result.is_success());
        assert_eq!(slow.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(statuses(&broker).len(), 1);
    }

    #[tokio::test]
    async fn test_handler_process_message_dispatches() {
        let (h, scripted, broker) = handler_with(config(5), vec![]);
        let cmd = command("g", OrderType::Build, &["never-seen"]);
        assert!(h.process_message(&delivery(&cmd)).await.is_success());
        assert_eq!(scripted.calls(), 1);
        assert!(broker.history().is_empty());
        assert_eq!(h.ledger().outcome("g"), None);
    }

    #[tokio::test]
    async fn test_handler_duplicate_after_success_is_silent() {
        let (h, scripted, broker) = handler_with(config(5), vec![]);
        let cmd = command("h", OrderType::CreateContainer, &[]);
        h.process(&delivery(&cmd)).await;
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert!(result.is_success());
        assert_eq!(scripted.calls(), 1);
        assert_eq!(statuses(&broker).len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_collection_disabled() {
        let cfg = Config {
            enable_error_collection: false,
            ..config(0)
        };
        let (h, _, broker) = handler_with(cfg, vec![Err(PluginError::from("down".to_string()))]);
        let cmd = command("i", OrderType::CreateContainer, &[]);
        let (requeue, result) = h.process(&delivery(&cmd)).await;
        assert!(!requeue);
        assert!(matches!(result, CommandResult::Fatal(ref c) if c.contains("retries exhausted")));
        assert!(broker.published_to("errors").is_empty());
        assert_eq!(statuses(&broker)[0].status, StatusKind::Failure);
    }

    #[tokio::test]
    async fn test_handler_status_written_to_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            state_dir: Some(dir.path().to_path_buf()),
            ..config(1)
        };
        let (h, _, _) = handler_with(cfg, vec![]);
        h.process(&delivery(&command("j", OrderType::CreateContainer, &[])))
            .await;
        let log = std::fs::read_to_string(dir.path().join("tn/events.jsonl")).unwrap();
        assert!(log.contains("\"id\":\"j\""));
    }
}
