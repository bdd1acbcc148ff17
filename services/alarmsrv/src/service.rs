//! Alarm service context
//!
//! Built once at startup and shared by every collaborator: hardware callbacks,
//! the inbound message handler, timers and the command surface all reach the
//! manager through it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::ServiceErrorTrait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::board::{ActuationListener, AlarmsBoard, HardwareLink, SwitchEvent};
use crate::commands::{CommandHandler, CommandReply};
use crate::config::AlarmConfig;
use crate::dispatcher::DispatcherStatus;
use crate::domain::AlarmChange;
use crate::error::{AlarmError, Result};
use crate::listeners::{BroadcastListener, PersistenceListener};
use crate::manager::AlarmManager;
use crate::messages::{Message, MessageType, Payload, ServiceEvent};
use crate::messaging::{InboundHandler, Messaging};
use crate::registry::AlarmRegistry;
use crate::sources::{AlarmRaiser, SourceReconciler, StoredAlarmsRaiser};
use crate::storage::AlarmPersistence;
use crate::test_controller::{ActiveTestInfo, TestController};

/// Point-in-time service status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub dispatcher: DispatcherStatus,
    pub queue_depth: usize,
    pub processed: u64,
    pub alarms: usize,
    /// Known sources and whether each is connected
    pub sources: BTreeMap<String, bool>,
    pub active_test: Option<ActiveTestInfo>,
}

fn log_error(context: &str, e: &AlarmError) {
    let level = e.log_level();
    if level == Level::ERROR {
        error!("{}: {}", context, e);
    } else if level == Level::WARN {
        warn!("{}: {}", context, e);
    } else {
        info!("{}: {}", context, e);
    }
}

pub struct AlarmService {
    config: AlarmConfig,
    manager: Arc<AlarmManager>,
    tests: Arc<TestController>,
    reconciler: Arc<SourceReconciler>,
    commands: CommandHandler,
    messaging: Arc<dyn Messaging>,
    board: Option<Arc<AlarmsBoard>>,
}

impl AlarmService {
    /// Load stored alarms, register every raiser and wire the listeners.
    ///
    /// Failing to load the stored alarm set is a configuration error.
    pub async fn bootstrap(
        config: AlarmConfig,
        messaging: Arc<dyn Messaging>,
        store: Arc<dyn AlarmPersistence>,
        link: Option<Arc<dyn HardwareLink>>,
    ) -> Result<Arc<Self>> {
        let stored = store
            .load_alarms()
            .await
            .map_err(|e| AlarmError::config(format!("cannot load stored alarms: {}", e)))?;
        let known = store
            .known_ids()
            .await
            .map_err(|e| AlarmError::config(format!("cannot load stored alarm ids: {}", e)))?;
        info!("Loaded {} stored alarms ({} known ids)", stored.len(), known.len());

        let registry = AlarmRegistry::with_known_ids(known);
        let manager = Arc::new(AlarmManager::with_registry(
            registry,
            config.dispatcher.options(),
        ));
        let tests = Arc::new(TestController::new(manager.clone(), config.test.options()));
        let local_source = config.service.local_source.clone();
        let reconciler = Arc::new(SourceReconciler::new(
            manager.clone(),
            messaging.clone(),
            &local_source,
        ));

        let board = match link {
            Some(link) if config.board.enabled => {
                let board = Arc::new(AlarmsBoard::new(
                    &local_source,
                    config.board.alarms.clone(),
                    config.board.controls.clone(),
                    link,
                    manager.clone(),
                ));
                reconciler.add_raiser(board.as_ref())?;
                // Unconfirmed until the board reports ready
                manager.disconnect(&local_source);
                Some(board)
            },
            _ => None,
        };

        for raiser in StoredAlarmsRaiser::group(&stored, &local_source) {
            reconciler.add_raiser(&raiser)?;
            reconciler.add_remote_source(raiser.source_name()).await?;
            // Unconfirmed until the peer reports in
            manager.disconnect(raiser.source_name());
        }
        for remote in &config.remotes {
            reconciler.add_remote_source(remote).await?;
        }

        let dispatcher = manager.dispatcher();
        dispatcher.add_listener(Arc::new(PersistenceListener::new(store)));
        dispatcher.add_listener(Arc::new(BroadcastListener::new(messaging.clone())));
        if let Some(board) = &board {
            dispatcher.add_listener(Arc::new(ActuationListener::new(board.clone())));
        }

        let commands = CommandHandler::new(
            manager.clone(),
            tests.clone(),
            reconciler.clone(),
            messaging.clone(),
        );

        info!(
            "Alarm service ready: {} alarms, remotes={:?}",
            manager.list_alarms().len(),
            reconciler.remotes()
        );

        Ok(Arc::new(Self {
            config,
            manager,
            tests,
            reconciler,
            commands,
            messaging,
            board,
        }))
    }

    pub fn manager(&self) -> &Arc<AlarmManager> {
        &self.manager
    }

    pub fn tests(&self) -> &Arc<TestController> {
        &self.tests
    }

    pub fn reconciler(&self) -> &Arc<SourceReconciler> {
        &self.reconciler
    }

    pub fn commands(&self) -> &CommandHandler {
        &self.commands
    }

    pub fn board(&self) -> Option<&Arc<AlarmsBoard>> {
        self.board.as_ref()
    }

    pub fn status(&self) -> ServiceStatus {
        let dispatcher = self.manager.dispatcher();
        ServiceStatus {
            dispatcher: dispatcher.status(),
            queue_depth: dispatcher.depth(),
            processed: dispatcher.processed(),
            alarms: self.manager.list_alarms().len(),
            sources: self.manager.sources(),
            active_test: self.tests.active_test(),
        }
    }

    // ========================================================================
    // Hardware callbacks
    // ========================================================================

    /// Board readiness drives the local source and the master switch
    pub async fn on_board_ready(&self, ready: bool) -> Vec<AlarmChange> {
        let Some(board) = &self.board else {
            return Vec::new();
        };

        if let Err(e) = board.set_ready(ready).await {
            log_error("Master switch", &e);
        }
        let changes = self.reconciler.on_hardware_ready(ready);
        if ready {
            if let Err(e) = board.request_status().await {
                log_error("Board status request", &e);
            }
        }
        changes
    }

    pub fn on_switch(&self, event: &SwitchEvent) -> Option<AlarmChange> {
        let board = self.board.as_ref()?;
        match board.handle_switch(event) {
            Ok(change) => change,
            Err(e) => {
                log_error(&format!("Switch {}", event.switch_id), &e);
                None
            },
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&self, message: &Message) {
        let me = self.messaging.name();
        let reply = match message.command_payload() {
            Some(request) => match self.commands.handle(request).await {
                Ok(CommandReply::Alarms(alarms)) => {
                    Message::alarms_list(me, &message.sender, &alarms)
                },
                Ok(CommandReply::Alarm(alarm)) => {
                    Message::alarm_response(me, &message.sender, &alarm)
                },
                Err(e) => {
                    log_error(&format!("Command {} from {}", request.name, message.sender), &e);
                    Message::error(me, &message.sender, e.to_error_info())
                },
            },
            None => {
                let e = AlarmError::validation("command message without a command");
                Message::error(me, &message.sender, e.to_error_info())
            },
        };

        if let Err(e) = self.messaging.send(reply).await {
            log_error(&format!("Reply to {}", message.sender), &e);
        }
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Run until `cancel` fires, then shut down in order: announce, end any
    /// test, switch the board off, drain the queue.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let stop = CancellationToken::new();
        let dispatcher = self.manager.dispatcher();
        let consumer = {
            let messaging = self.messaging.clone();
            let stop = stop.clone();
            tokio::spawn(async move { dispatcher.run(move || messaging.is_ready(), stop).await })
        };

        let announce = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.announce(cancel).await })
        };

        let refresh = self.spawn_refresh(cancel.clone());

        info!("Alarm service running");
        cancel.cancelled().await;
        info!("Alarm service stopping");

        announce.abort();
        if let Some(refresh) = refresh {
            refresh.abort();
        }

        let goodbye = Message::service_event(self.messaging.name(), ServiceEvent::Disconnecting);
        if let Err(e) = self.messaging.broadcast(goodbye).await {
            log_error("Disconnecting broadcast", &e);
        }
        if let Err(e) = self.tests.end_active() {
            log_error("End active test", &e);
        }
        if let Some(board) = &self.board {
            board.shutdown().await;
        }

        stop.cancel();
        match consumer.await {
            Ok(result) => result?,
            Err(e) => return Err(AlarmError::internal(format!("dispatcher task: {}", e))),
        }

        info!("Alarm service stopped");
        Ok(())
    }

    /// Broadcast Connected once messaging is up, then resync every remote
    async fn announce(&self, cancel: CancellationToken) {
        let poll = self.config.dispatcher.options().ready_poll;
        while !self.messaging.is_ready() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll) => {},
            }
        }

        let hello = Message::service_event(self.messaging.name(), ServiceEvent::Connected);
        match self.messaging.broadcast(hello).await {
            Ok(()) => info!("Announced as {}", self.messaging.name()),
            Err(e) => log_error("Connected broadcast", &e),
        }
        self.reconciler.refresh_remotes().await;
    }

    fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.config.refresh.interval_secs;
        if secs == 0 {
            return None;
        }

        let period = Duration::from_secs(secs);
        let reconciler = self.reconciler.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        debug!("Refreshing remote alarms");
                        reconciler.refresh_remotes().await;
                    },
                }
            }
        }))
    }
}

#[async_trait]
impl InboundHandler for AlarmService {
    async fn on_message(&self, message: Message) {
        let sender = message.sender.as_str();
        if sender == self.messaging.name() {
            return;
        }

        match message.message_type {
            MessageType::Alert => match message.alarm() {
                Some(payload) => {
                    if let Err(e) = self.reconciler.apply_remote_alert(sender, payload) {
                        log_error(&format!("Alert from {}", sender), &e);
                    }
                },
                None => debug!("Alert from {} without alarm", sender),
            },
            MessageType::Command => self.handle_command(&message).await,
            MessageType::CommandResponse => match message.alarms_list_payload() {
                Some(list) => {
                    self.reconciler.apply_remote_list(sender, list);
                },
                None => debug!("Response from {} ignored", sender),
            },
            MessageType::Notification => match message.service_event_payload() {
                Some(event) => {
                    self.reconciler.on_service_event(sender, event).await;
                },
                None => debug!("Notification from {} ignored", sender),
            },
            MessageType::SubscribeResponse => debug!("Subscribed to {}", sender),
            MessageType::Error => match &message.payload {
                Payload::Error(info) => warn!("Error from {}: {} ({})", sender, info.message, info.error_code),
                other => warn!("Error from {}: {:?}", sender, other),
            },
        }
    }
}
