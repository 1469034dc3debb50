use crate::connection::{
    ConnectionError, ConnectionManager, Connector, ControlMessage, NORMAL_CLOSURE,
    SESSION_TIMEOUT,
};
use crate::session::Session;

/// The only caller allowed to open or close the channel. Keeps the channel in
/// step with the session: one channel while logged in with an account, none
/// otherwise.
pub struct SessionBinding<'a, C: Connector> {
    session: &'a mut Session,
    connection: &'a mut ConnectionManager<C>,
}

impl<'a, C: Connector> SessionBinding<'a, C> {
    pub fn new(session: &'a mut Session, connection: &'a mut ConnectionManager<C>) -> Self {
        Self {
            session,
            connection,
        }
    }

    /// Reacts to the session's account having moved from `prev` to `new`.
    /// The session is expected to already hold `new`.
    pub fn on_account_change(
        &mut self,
        new: Option<&str>,
        prev: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let new = new.map(str::trim).filter(|id| !id.is_empty());
        let Some(new) = new else {
            if self.connection.is_open() {
                self.connection.send(&ControlMessage::LocalClose);
            }
            self.connection.close(SESSION_TIMEOUT, "session timeout");
            return Ok(());
        };

        if !self.session.is_logged_in() {
            tracing::debug!(account_id = %new, "account set before login; channel deferred");
            return Ok(());
        }

        if Some(new) == prev && self.connection.has_channel() {
            return Ok(());
        }

        if self.connection.is_open() {
            tracing::info!(
                from = prev.unwrap_or("-"),
                to = %new,
                "switching push channel account in place"
            );
            self.connection.send(&ControlMessage::AccountUpdate {
                account_id: new.to_string(),
            });
            self.connection.rebind(new);
            return Ok(());
        }

        if self.connection.has_channel() {
            // Still connecting: the server has not bound the old account yet.
            self.connection.close(NORMAL_CLOSURE, "normal termination");
        }
        self.connection.open(new, self.session.token())
    }

    /// User-initiated logout: tell the server, close with normal closure and
    /// clear the session.
    pub fn on_logout(&mut self) {
        if self.connection.is_open() {
            self.connection.send(&ControlMessage::LocalClose);
        }
        self.connection.close(NORMAL_CLOSURE, "normal termination");
        let account = self.session.logout();
        tracing::info!(account_id = account.as_deref().unwrap_or("-"), "logged out");
    }

    /// Server reported the credentials expired: forced logout, never retried.
    pub fn on_auth_expired(&mut self, message: Option<&str>) {
        let account = self.session.logout();
        self.connection.close(NORMAL_CLOSURE, "normal termination");
        tracing::warn!(
            account_id = account.as_deref().unwrap_or("-"),
            message = message.unwrap_or(""),
            "authentication expired; session cleared"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{endpoint, FakeConnector};
    use crate::connection::{ConnectionStatus, EngineSignal, TransportCommand, TransportEvent};
    use crate::reconnect::ReconnectState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        session: Session,
        connection: ConnectionManager<FakeConnector>,
        connector: FakeConnector,
        rx: mpsc::UnboundedReceiver<EngineSignal>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = FakeConnector::default();
            Self {
                session: Session::new(),
                connection: ConnectionManager::new(
                    connector.clone(),
                    endpoint(),
                    Duration::from_millis(500),
                    tx,
                ),
                connector,
                rx,
            }
        }

        fn binding(&mut self) -> SessionBinding<'_, FakeConnector> {
            SessionBinding::new(&mut self.session, &mut self.connection)
        }

        fn switch(&mut self, account: Option<&str>) {
            let prev = self.session.set_account(account.map(str::to_string));
            self.binding()
                .on_account_change(account, prev.as_deref())
                .unwrap();
        }

        async fn pump(&mut self) {
            match self.rx.recv().await.unwrap() {
                EngineSignal::Channel { generation, event } => {
                    self.connection.on_transport_event(generation, event);
                }
                EngineSignal::RetryDue { ticket } => {
                    self.connection.on_retry_due(ticket, &self.session)
                }
            }
        }
    }

    #[tokio::test]
    async fn first_login_opens_once_and_connects() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", None);
        fx.switch(Some("A1"));

        assert_eq!(fx.connector.connects(), 1);
        fx.connector.emit(0, TransportEvent::Opened);
        fx.pump().await;
        assert_eq!(fx.connection.reconnect_state(), ReconnectState::Connected);
        assert_eq!(fx.connection.channel_account(), Some("A1"));
    }

    #[tokio::test]
    async fn switch_on_open_channel_sends_account_update() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", None);
        fx.switch(Some("A1"));
        fx.connector.emit(0, TransportEvent::Opened);
        fx.pump().await;

        fx.switch(Some("A2"));

        assert_eq!(fx.connector.connects(), 1);
        assert_eq!(fx.connection.channel_account(), Some("A2"));
        assert_eq!(
            fx.connector.commands(0),
            vec![TransportCommand::Send(
                r#"{"id":"ACCOUNT_UPDATE","accountId":"A2"}"#.to_string()
            )]
        );
    }

    #[tokio::test]
    async fn clearing_account_sends_local_close_then_4403() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", None);
        fx.switch(Some("A1"));
        fx.connector.emit(0, TransportEvent::Opened);
        fx.pump().await;

        fx.switch(None);

        assert!(!fx.connection.has_channel());
        assert_eq!(fx.connection.reconnect_state(), ReconnectState::Idle);
        assert_eq!(
            fx.connector.commands(0),
            vec![
                TransportCommand::Send(r#"{"id":"LOCAL_CLOSE"}"#.to_string()),
                TransportCommand::Close {
                    code: SESSION_TIMEOUT,
                    reason: "session timeout".to_string()
                }
            ]
        );
    }

    #[tokio::test]
    async fn switch_while_connecting_reopens_for_new_account() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", None);
        fx.switch(Some("A1"));
        fx.switch(Some("A2"));

        assert_eq!(fx.connector.connects(), 2);
        assert_eq!(fx.connection.channel_account(), Some("A2"));
        assert!(fx.connector.url(1).as_str().contains("accountId=A2"));
    }

    #[tokio::test]
    async fn account_before_login_defers_channel() {
        let mut fx = Fixture::new();
        fx.switch(Some("A1"));
        assert_eq!(fx.connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_during_reconnect_wait_opens_immediately() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", None);
        fx.switch(Some("A1"));
        fx.connector.emit(
            0,
            TransportEvent::Closed {
                code: 1006,
                reason: String::new(),
            },
        );
        fx.pump().await;
        assert_eq!(fx.connection.reconnect_state(), ReconnectState::Reconnecting);

        fx.switch(Some("A2"));
        assert_eq!(fx.connector.connects(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(fx.rx.try_recv().is_err());
        assert_eq!(fx.connector.connects(), 2);
    }

    #[tokio::test]
    async fn auth_expired_forces_logout() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", Some("A1".to_string()));
        fx.binding().on_account_change(Some("A1"), None).unwrap();
        fx.connector.emit(0, TransportEvent::Opened);
        fx.pump().await;

        fx.binding().on_auth_expired(Some("token expired"));

        assert!(fx.session.is_logged_out());
        assert_eq!(fx.session.token(), None);
        assert_eq!(fx.session.account_id(), None);
        assert_eq!(fx.connection.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            fx.connector.commands(0),
            vec![TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "normal termination".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn logout_closes_with_normal_closure() {
        let mut fx = Fixture::new();
        fx.session.login("tok-1", Some("A1".to_string()));
        fx.binding().on_account_change(Some("A1"), None).unwrap();
        fx.connector.emit(0, TransportEvent::Opened);
        fx.pump().await;

        fx.binding().on_logout();

        assert!(!fx.session.wants_channel());
        let commands = fx.connector.commands(0);
        assert_eq!(
            commands.last(),
            Some(&TransportCommand::Close {
                code: NORMAL_CLOSURE,
                reason: "normal termination".to_string()
            })
        );
        assert_eq!(
            commands.first(),
            Some(&TransportCommand::Send(r#"{"id":"LOCAL_CLOSE"}"#.to_string()))
        );
    }
}
