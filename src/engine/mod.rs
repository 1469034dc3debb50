use crate::alerts::{AggregatedAlert, AlertEntry};
use crate::binding::SessionBinding;
use crate::connection::{
    ConnectionError, ConnectionManager, ConnectionStatus, Connector, EngineSignal, NORMAL_CLOSURE,
};
use crate::decoder;
use crate::model::{AlertCommand, AlertLevel, Command, ResourceKind};
use crate::reconnect::ReconnectState;
use crate::router;
use crate::session::Session;
use crate::store::{ClientCaches, StateStore};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;
use uuid::Uuid;

const SESSION_EXPIRED_TEXT: &str = "Your session has expired. Please log in again.";

/// Requests from the view layer and the API client.
#[derive(Debug)]
pub enum ConsoleCommand {
    Login {
        token: String,
        account_id: Option<String>,
    },
    SwitchAccount {
        account_id: Option<String>,
    },
    Logout,
    RotateToken {
        token: String,
    },
    Navigate {
        path: String,
    },
    DismissAlert {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    LoadCache {
        kind: ResourceKind,
        records: Vec<Value>,
    },
    ReadCache {
        kind: ResourceKind,
        reply: oneshot::Sender<Vec<Value>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connection: ConnectionStatus,
    pub reconnect: ReconnectState,
    pub channel_account: Option<String>,
    pub session: Session,
    pub current_path: String,
    pub alerts: Vec<AlertEntry>,
    pub caches: BTreeMap<String, usize>,
}

/// Explicit sync context: the one owner of session, channel, caches and
/// alerts. Everything happens on the task that drives it, in arrival order.
pub struct SyncEngine<C: Connector> {
    session: Session,
    connection: ConnectionManager<C>,
    caches: ClientCaches,
    alerts: AggregatedAlert,
    current_path: String,
    signals: mpsc::UnboundedReceiver<EngineSignal>,
    snapshots: watch::Sender<StatusSnapshot>,
}

impl<C: Connector> SyncEngine<C> {
    pub fn new(connector: C, endpoint: Url, retry_interval: Duration, initial_path: &str) -> Self {
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(connector, endpoint, retry_interval, signal_tx);
        let session = Session::new();
        let initial = StatusSnapshot {
            connection: connection.status(),
            reconnect: connection.reconnect_state(),
            channel_account: None,
            session: session.clone(),
            current_path: initial_path.to_string(),
            alerts: Vec::new(),
            caches: BTreeMap::new(),
        };
        let (snapshots, _) = watch::channel(initial);
        Self {
            session,
            connection,
            caches: ClientCaches::new(),
            alerts: AggregatedAlert::new(),
            current_path: initial_path.to_string(),
            signals,
            snapshots,
        }
    }

    fn binding(&mut self) -> SessionBinding<'_, C> {
        SessionBinding::new(&mut self.session, &mut self.connection)
    }

    pub fn login(
        &mut self,
        token: impl Into<String>,
        account_id: Option<String>,
    ) -> Result<(), ConnectionError> {
        let prev = self.session.account_id().map(str::to_string);
        self.session.login(token, account_id);
        let new = self.session.account_id().map(str::to_string);
        tracing::info!(account_id = new.as_deref().unwrap_or("-"), "logged in");
        self.binding()
            .on_account_change(new.as_deref(), prev.as_deref())
    }

    pub fn switch_account(&mut self, account_id: Option<String>) -> Result<(), ConnectionError> {
        let prev = self.session.set_account(account_id);
        let new = self.session.account_id().map(str::to_string);
        if new != prev {
            self.caches.clear();
        }
        self.binding()
            .on_account_change(new.as_deref(), prev.as_deref())
    }

    pub fn logout(&mut self) {
        self.binding().on_logout();
        self.caches.clear();
        self.alerts.clear();
    }

    pub fn rotate_token(&mut self, token: impl Into<String>) {
        self.session.rotate_token(token);
    }

    /// Changing screens drops every pending alert.
    pub fn navigate(&mut self, path: impl Into<String>) {
        self.current_path = path.into();
        self.alerts.clear();
        tracing::debug!(path = %self.current_path, "navigation context changed");
    }

    pub fn dismiss_alert(&mut self, id: Uuid) -> bool {
        self.alerts.dismiss(id)
    }

    pub fn load_cache(&mut self, kind: ResourceKind, records: Vec<Value>) {
        self.caches.load(kind, records);
    }

    #[cfg(test)]
    pub fn caches(&self) -> &ClientCaches {
        &self.caches
    }

    #[cfg(test)]
    pub async fn next_signal(&mut self) -> Option<EngineSignal> {
        self.signals.recv().await
    }

    /// Applies one channel or timer signal; returns the commands produced if
    /// the signal carried a frame.
    pub fn handle_signal(&mut self, signal: EngineSignal) -> Vec<Command> {
        match signal {
            EngineSignal::Channel { generation, event } => {
                match self.connection.on_transport_event(generation, event) {
                    Some(raw) => self.process_frame(&raw),
                    None => Vec::new(),
                }
            }
            EngineSignal::RetryDue { ticket } => {
                self.connection.on_retry_due(ticket, &self.session);
                Vec::new()
            }
        }
    }

    /// Decode, route, then apply in order: mutations to the caches, alerts to
    /// the aggregated list, forced logout to the binding.
    pub fn process_frame(&mut self, raw: &str) -> Vec<Command> {
        let notification = decoder::decode_or_fallback(raw);
        let commands = router::route(&notification, &self.current_path, &self.caches);
        for command in &commands {
            match command {
                Command::Mutate(mutation) => self.caches.apply(mutation),
                Command::Alert(alert) => {
                    self.alerts.record(alert.clone());
                }
                Command::ForceLogout { message } => {
                    self.binding().on_auth_expired(message.as_deref());
                    self.caches.clear();
                    self.alerts.clear();
                    self.alerts.record(AlertCommand {
                        level: AlertLevel::Error,
                        text: message
                            .clone()
                            .unwrap_or_else(|| SESSION_EXPIRED_TEXT.to_string()),
                    });
                }
            }
        }
        commands
    }

    pub fn apply(&mut self, command: ConsoleCommand) {
        let result = match command {
            ConsoleCommand::Login { token, account_id } => self.login(token, account_id),
            ConsoleCommand::SwitchAccount { account_id } => self.switch_account(account_id),
            ConsoleCommand::Logout => {
                self.logout();
                Ok(())
            }
            ConsoleCommand::RotateToken { token } => {
                self.rotate_token(token);
                Ok(())
            }
            ConsoleCommand::Navigate { path } => {
                self.navigate(path);
                Ok(())
            }
            ConsoleCommand::DismissAlert { id, reply } => {
                let _ = reply.send(self.dismiss_alert(id));
                Ok(())
            }
            ConsoleCommand::LoadCache { kind, records } => {
                self.load_cache(kind, records);
                Ok(())
            }
            ConsoleCommand::ReadCache { kind, reply } => {
                let _ = reply.send(self.caches.list(&kind).to_vec());
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "console command could not open the push channel");
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connection: self.connection.status(),
            reconnect: self.connection.reconnect_state(),
            channel_account: self.connection.channel_account().map(str::to_string),
            session: self.session.clone(),
            current_path: self.current_path.clone(),
            alerts: self.alerts.entries().to_vec(),
            caches: self.caches.sizes(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshots.subscribe()
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Drives the engine until `shutdown` flips or every command sender is
    /// gone; the channel is closed with normal closure on the way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ConsoleCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.publish();
        loop {
            tokio::select! {
                Some(signal) = self.signals.recv() => {
                    self.handle_signal(signal);
                }
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
            self.publish();
        }
        self.connection.close(NORMAL_CLOSURE, "normal termination");
        self.publish();
        tracing::info!("sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{endpoint, FakeConnector};
    use crate::connection::{TransportCommand, TransportEvent};
    use crate::model::MutationKind;
    use serde_json::json;

    const RETRY: Duration = Duration::from_millis(1000);

    fn engine(path: &str) -> (SyncEngine<FakeConnector>, FakeConnector) {
        let connector = FakeConnector::default();
        (
            SyncEngine::new(connector.clone(), endpoint(), RETRY, path),
            connector,
        )
    }

    fn frame(record: Value) -> String {
        json!({ "data": record.to_string() }).to_string()
    }

    async fn step(engine: &mut SyncEngine<FakeConnector>) -> Vec<Command> {
        let signal = engine.next_signal().await.unwrap();
        engine.handle_signal(signal)
    }

    async fn connected(path: &str) -> (SyncEngine<FakeConnector>, FakeConnector) {
        let (mut engine, connector) = engine(path);
        engine.login("tok-1", Some("A1".to_string())).unwrap();
        connector.emit(0, TransportEvent::Opened);
        step(&mut engine).await;
        (engine, connector)
    }

    #[tokio::test]
    async fn login_then_volume_patch_yields_one_replace() {
        let (mut engine, connector) = engine("/volumes");
        engine.login("tok-1", Some("A1".to_string())).unwrap();
        assert_eq!(connector.connects(), 1);

        connector.emit(0, TransportEvent::Opened);
        step(&mut engine).await;
        assert_eq!(engine.snapshot().reconnect, ReconnectState::Connected);

        connector.emit(
            0,
            TransportEvent::Frame(frame(json!({
                "object": "VOLUME_SERIES",
                "method": "PATCH",
                "data": { "meta": { "id": "vs-1" }, "name": "vol" }
            }))),
        );
        let commands = step(&mut engine).await;

        assert_eq!(commands.len(), 1);
        let Command::Mutate(mutation) = &commands[0] else {
            panic!("expected mutation, got {:?}", commands[0]);
        };
        assert_eq!(mutation.kind, MutationKind::Replace);
        assert_eq!(mutation.resource_type, ResourceKind::Volumes);
        assert_eq!(mutation.id.as_deref(), Some("vs-1"));
        assert_eq!(engine.caches().volume_name("vs-1").as_deref(), Some("vol"));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn account_chosen_before_login_opens_on_login() {
        let (mut engine, connector) = engine("/volumes");
        engine.switch_account(Some("A1".to_string())).unwrap();
        assert_eq!(connector.connects(), 0);

        engine.login("tok-1", None).unwrap();
        assert_eq!(connector.connects(), 1);
        let url = connector.url(0);
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "accountId" && v == "A1"));
        assert_eq!(engine.snapshot().channel_account.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn irrelevant_frame_leaves_caches_untouched() {
        let (mut engine, connector) = connected("/somewhere-unrelated").await;
        connector.emit(
            0,
            TransportEvent::Frame(frame(json!({
                "object": "CLUSTER",
                "method": "POST",
                "data": { "meta": { "id": "c-1" } }
            }))),
        );
        assert!(step(&mut engine).await.is_empty());
        assert!(engine.snapshot().caches.is_empty());
    }

    #[tokio::test]
    async fn repeated_failures_collapse_into_one_alert() {
        let (mut engine, connector) = connected("/volumes").await;
        engine.load_cache(
            ResourceKind::Volumes,
            vec![json!({ "meta": { "id": "vs-1" }, "name": "db-data" })],
        );
        let failed = frame(json!({
            "object": "VOLUME_SERIES_REQUEST",
            "method": "PATCH",
            "data": {
                "meta": { "id": "vsr-1" },
                "volumeSeriesId": "vs-1",
                "volumeSeriesRequestState": "FAILED",
                "requestedOperations": ["MOUNT"],
                "requestMessages": [{ "message": "error: node down" }]
            }
        }));
        for _ in 0..3 {
            connector.emit(0, TransportEvent::Frame(failed.clone()));
            step(&mut engine).await;
        }

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.alerts[0].text, "db-data MOUNT FAILED error: node down");
        assert_eq!(snapshot.alerts[0].level, AlertLevel::Error);
        assert_eq!(snapshot.alerts[0].duplicates, 2);

        engine.navigate("/dashboard");
        assert!(engine.snapshot().alerts.is_empty());
    }

    #[tokio::test]
    async fn auth_expired_forces_logout_regardless_of_path() {
        let (mut engine, connector) = connected("/somewhere-unrelated").await;
        engine.load_cache(ResourceKind::Clusters, vec![json!({ "id": "c-1" })]);
        connector.emit(
            0,
            TransportEvent::Frame(frame(json!({
                "object": "AUTH_EXPIRED",
                "message": "token expired"
            }))),
        );
        let commands = step(&mut engine).await;
        assert_eq!(
            commands,
            vec![Command::ForceLogout {
                message: Some("token expired".to_string())
            }]
        );

        let snapshot = engine.snapshot();
        assert!(snapshot.session.is_logged_out());
        assert_eq!(snapshot.connection, ConnectionStatus::Disconnected);
        assert_eq!(snapshot.reconnect, ReconnectState::Idle);
        assert!(snapshot.caches.is_empty());
        assert_eq!(snapshot.alerts.len(), 1);
        assert_eq!(snapshot.alerts[0].text, "token expired");
        assert_eq!(
            connector.commands(0),
            vec![TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "normal termination".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn garbage_frame_surfaces_generic_alert() {
        let (mut engine, connector) = connected("/volumes").await;
        connector.emit(0, TransportEvent::Frame("<html>".to_string()));
        let commands = step(&mut engine).await;
        assert_eq!(commands.len(), 1);
        assert_eq!(engine.snapshot().alerts[0].level, AlertLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_during_reconnect_wait_stops_retrying() {
        let (mut engine, connector) = connected("/volumes").await;
        connector.emit(
            0,
            TransportEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
        );
        step(&mut engine).await;
        assert_eq!(engine.snapshot().reconnect, ReconnectState::Reconnecting);

        engine.apply(ConsoleCommand::Logout);
        tokio::time::advance(RETRY * 3).await;
        tokio::task::yield_now().await;

        assert_eq!(connector.connects(), 1);
        assert_eq!(engine.snapshot().reconnect, ReconnectState::Idle);
    }

    #[tokio::test]
    async fn account_switch_clears_caches_and_rebinds() {
        let (mut engine, connector) = connected("/volumes").await;
        engine.load_cache(ResourceKind::Volumes, vec![json!({ "id": "vs-1" })]);

        engine.apply(ConsoleCommand::SwitchAccount {
            account_id: Some("A2".to_string()),
        });

        let snapshot = engine.snapshot();
        assert!(snapshot.caches.is_empty());
        assert_eq!(snapshot.channel_account.as_deref(), Some("A2"));
        assert_eq!(snapshot.session.account_id(), Some("A2"));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn run_publishes_snapshots_and_closes_on_shutdown() {
        let (engine, connector) = engine("/dashboard");
        let mut snapshots = engine.subscribe();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(command_rx, shutdown_rx));

        command_tx
            .send(ConsoleCommand::Login {
                token: "tok-1".to_string(),
                account_id: Some("A1".to_string()),
            })
            .await
            .unwrap();
        snapshots
            .wait_for(|s| s.connection == ConnectionStatus::Connecting)
            .await
            .unwrap();

        connector.emit(0, TransportEvent::Opened);
        snapshots
            .wait_for(|s| s.connection == ConnectionStatus::Connected)
            .await
            .unwrap();

        let (reply, answer) = oneshot::channel();
        command_tx
            .send(ConsoleCommand::ReadCache {
                kind: ResourceKind::Volumes,
                reply,
            })
            .await
            .unwrap();
        assert!(answer.await.unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(
            connector.commands(0).last(),
            Some(&TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "normal termination".to_string()
            })
        );
    }
}
