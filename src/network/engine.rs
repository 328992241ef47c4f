//! Protocol engine
//!
//! Owns the node state, runs the inbound dispatch loop and implements the
//! operations applications originate: message delivery with retries, route
//! discovery, peer registration and session requests.

use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{Address, Header, HeaderBody};
use crate::routing::{PeerRegistration, RouteEntry, RoutingTable};

use super::{
    AppEvent, EngineConfig, EngineError, EngineResult, NodeState, Radio, STATUS_OK, STATUS_SENDED,
    STATUS_SENDING,
};

/// Outcome of [`Engine::send_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The destination acknowledged the message
    Confirmed,
    /// Every attempt went unacknowledged; routes to the destination were
    /// dropped and a route error was broadcast
    Unconfirmed,
}

enum SessionRequest {
    Connect { timeout: u32 },
    Disconnect,
}

struct Inner {
    config: EngineConfig,
    radio: Arc<dyn Radio>,
    state: Mutex<NodeState>,
    /// Signalled after every processed frame
    changed: Notify,
    events: mpsc::Sender<AppEvent>,
    /// Held for the whole announce + payload exchange with the modem
    transmit: Mutex<()>,
}

/// Handle to a running protocol instance; cheap to clone
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine transmitting through `radio`.
    ///
    /// Returns the engine and the receiver of application events.
    pub fn new(config: EngineConfig, radio: Arc<dyn Radio>) -> (Self, mpsc::Receiver<AppEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue);
        let table = RoutingTable::new(config.known_nodes.clone(), config.cache_windows);
        let state = NodeState::new(config.address, config.default_ttl, table);

        let engine = Self {
            inner: Arc::new(Inner {
                config,
                radio,
                state: Mutex::new(state),
                changed: Notify::new(),
                events: events_tx,
                transmit: Mutex::new(()),
            }),
        };

        (engine, events_rx)
    }

    pub fn address(&self) -> Address {
        self.inner.config.address
    }

    pub async fn connected_node(&self) -> Option<Address> {
        self.inner.state.lock().await.connected_node()
    }

    /// Best route per known destination
    pub async fn best_routes(&self) -> Vec<RouteEntry> {
        self.inner.state.lock().await.table.best_routes()
    }

    pub async fn peers(&self) -> Vec<PeerRegistration> {
        self.inner.state.lock().await.table.peers()
    }

    pub async fn unsupported_devices(&self) -> Vec<Address> {
        self.inner.state.lock().await.table.unsupported_devices()
    }

    /// Process received frames until the inbound queue closes
    pub async fn run(self, mut inbound: mpsc::Receiver<String>) {
        info!(address = %self.address(), "Protocol engine started");

        while let Some(line) = inbound.recv().await {
            self.handle_frame(&line).await;
        }

        info!("Inbound queue closed, protocol engine stopped");
    }

    /// Process one raw line received from the modem
    pub async fn handle_frame(&self, raw: &str) {
        let actions = self.inner.state.lock().await.process_line(raw);
        self.inner.changed.notify_waiters();

        for event in actions.events {
            if self.inner.events.send(event).await.is_err() {
                debug!("Application event receiver dropped");
            }
        }
        for header in actions.outbound {
            self.send_header(&header).await;
        }
    }

    /// Transmit a header: announce its length, then send the payload.
    ///
    /// Returns whether the modem confirmed both steps. Failures are logged
    /// and never retried here.
    pub async fn send_header(&self, header: &Header) -> bool {
        let line = header.encode();

        let max_jitter_ms = self.inner.config.max_jitter.as_millis() as u64;
        if max_jitter_ms > 0 {
            let delay_ms = rand::rng().random_range(0..=max_jitter_ms);
            debug!(delay_ms, "Waiting before transmission");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let _transmitting = self.inner.transmit.lock().await;
        let radio = &self.inner.radio;
        let announce = format!("AT+SEND={}", line.len());

        let result = match radio.execute(&announce, &[STATUS_OK]).await {
            Ok(()) => radio.execute(&line, &[STATUS_SENDING, STATUS_SENDED]).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(%line, "Header sent");
                true
            }
            Err(e) => {
                warn!(%line, "Could not send header: {}", e);
                false
            }
        }
    }

    /// Send `payload` to the connected node and wait for its acknowledgment
    pub async fn send_message(&self, payload: impl Into<Bytes>) -> EngineResult<Delivery> {
        let config = &self.inner.config;
        let payload = payload.into();
        let destination = self
            .connected_node()
            .await
            .ok_or(EngineError::NotConnected)?;
        let route = self.resolve_route(destination).await?;

        let (header, message_id) = {
            let mut state = self.inner.state.lock().await;
            let message_id = state.next_message_id();
            state.await_ack(message_id);
            let header = Header::message(
                config.address,
                config.default_ttl,
                destination,
                route.next_node,
                message_id,
                payload,
            );
            (header, message_id)
        };

        for attempt in 1..=config.max_attempts {
            debug!(%destination, message_id, attempt, "Sending message");
            self.send_header(&header).await;
            let acknowledged = self
                .wait_until(config.ack_timeout, move |state| {
                    !state.is_awaiting_ack(message_id)
                })
                .await;
            if acknowledged {
                info!(%destination, message_id, "Message acknowledged by receiver");
                return Ok(Delivery::Confirmed);
            }
        }

        warn!(%destination, message_id, "Message not acknowledged, sending route error");
        {
            let mut state = self.inner.state.lock().await;
            state.table.remove_routes_for(destination);
            state.clear_ack(message_id);
        }
        self.send_header(&Header::route_error(
            config.address,
            config.default_ttl,
            destination,
        ))
        .await;

        Ok(Delivery::Unconfirmed)
    }

    /// Flood a route request for `end_node` and wait for a route to appear
    pub async fn send_route_request(&self, end_node: Address) -> EngineResult<bool> {
        let config = &self.inner.config;
        // Addresses outside the network are rejected up front
        self.inner.state.lock().await.table.best_route(end_node)?;

        let header = Header::route_request(config.address, config.default_ttl, 0, end_node);
        for attempt in 1..=config.max_attempts {
            debug!(%end_node, attempt, "Sending route request");
            self.send_header(&header).await;
            let found = self
                .wait_until(config.route_discovery_timeout, move |state| {
                    matches!(state.table.best_route(end_node), Ok(Some(_)))
                })
                .await;
            if found {
                info!(%end_node, "New route found");
                return Ok(true);
            }
        }

        info!(%end_node, "Got no answer to route request");
        Ok(false)
    }

    /// Register or unregister a local peer and broadcast the change.
    ///
    /// The local directory is updated immediately. Returns whether the
    /// broadcast was heard being relayed back by a neighbor.
    pub async fn send_registration(&self, subscribe: bool, peer_id: &str) -> EngineResult<bool> {
        let config = &self.inner.config;
        if peer_id.is_empty() || peer_id.contains(['|', '\r', '\n']) {
            return Err(EngineError::InvalidPeerId(peer_id.to_string()));
        }

        {
            let mut state = self.inner.state.lock().await;
            if subscribe {
                state.table.add_peer(peer_id, config.address);
            } else {
                state.table.remove_peer(peer_id, config.address);
            }
            state.expect_registration(subscribe, peer_id);
        }

        let header = Header::registration(config.address, config.default_ttl, subscribe, peer_id);
        let mut confirmed = false;
        for attempt in 1..=config.max_attempts {
            debug!(peer_id, subscribe, attempt, "Sending registration");
            self.send_header(&header).await;
            confirmed = self
                .wait_until(config.registration_timeout, |state| {
                    state.registration_echoed(subscribe, peer_id)
                })
                .await;
            if confirmed {
                break;
            }
        }
        self.inner
            .state
            .lock()
            .await
            .finish_registration(subscribe, peer_id);

        if !confirmed {
            info!(peer_id, "Registration was not relayed by any neighbor");
        }
        Ok(confirmed)
    }

    /// Ask the node hosting `target_peer_id` to open a session.
    ///
    /// Returns false when the same request was already sent within the
    /// session window or the transmission failed.
    pub async fn send_connect_request(
        &self,
        source_peer_id: &str,
        target_peer_id: &str,
        timeout: u32,
    ) -> EngineResult<bool> {
        self.send_session_request(source_peer_id, target_peer_id, SessionRequest::Connect { timeout })
            .await
    }

    /// Ask the node hosting `target_peer_id` to close a session
    pub async fn send_disconnect_request(
        &self,
        source_peer_id: &str,
        target_peer_id: &str,
    ) -> EngineResult<bool> {
        self.send_session_request(source_peer_id, target_peer_id, SessionRequest::Disconnect)
            .await
    }

    async fn send_session_request(
        &self,
        source_peer_id: &str,
        target_peer_id: &str,
        request: SessionRequest,
    ) -> EngineResult<bool> {
        let config = &self.inner.config;

        let end_node = {
            let mut state = self.inner.state.lock().await;
            let end_node = state.check_peers(source_peer_id, target_peer_id)?;
            let table = &mut state.table;
            let duplicate = match request {
                SessionRequest::Connect { .. } => {
                    table.seen_connect_request(source_peer_id, target_peer_id)
                }
                SessionRequest::Disconnect => {
                    table.seen_disconnect_request(source_peer_id, target_peer_id)
                }
            };
            if duplicate {
                info!(source_peer_id, target_peer_id, "Session request already sent recently");
                return Ok(false);
            }
            match request {
                SessionRequest::Connect { .. } => {
                    table.mark_connect_request(source_peer_id, target_peer_id)
                }
                SessionRequest::Disconnect => {
                    table.mark_disconnect_request(source_peer_id, target_peer_id)
                }
            }
            end_node
        };

        let route = self.resolve_route(end_node).await?;
        let source_peer_id = source_peer_id.to_string();
        let target_peer_id = target_peer_id.to_string();
        let body = match request {
            SessionRequest::Connect { timeout } => HeaderBody::ConnectRequest {
                end_node,
                next_node: route.next_node,
                source_peer_id,
                target_peer_id,
                timeout,
            },
            SessionRequest::Disconnect => HeaderBody::DisconnectRequest {
                end_node,
                next_node: route.next_node,
                source_peer_id,
                target_peer_id,
            },
        };

        info!(%end_node, next = %route.next_node, "Sending session request");
        Ok(self
            .send_header(&Header::new(config.address, config.default_ttl, body))
            .await)
    }

    /// Best route to `destination`, discovering one if none is known
    async fn resolve_route(&self, destination: Address) -> EngineResult<RouteEntry> {
        let known = self.inner.state.lock().await.table.best_route(destination)?;
        if let Some(route) = known {
            return Ok(route);
        }

        info!(%destination, "No route known, sending route request");
        if !self.send_route_request(destination).await? {
            return Err(EngineError::NoRoute(destination));
        }

        self.inner
            .state
            .lock()
            .await
            .table
            .best_route(destination)?
            .ok_or(EngineError::NoRoute(destination))
    }

    /// Wait until `done` holds for the node state or `timeout` elapses.
    ///
    /// Re-evaluated after every processed frame.
    async fn wait_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&NodeState) -> bool + Send,
    {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a frame processed in between is not missed
            notified.as_mut().enable();

            if done(&*self.inner.state.lock().await) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{TransportError, TransportResult};
    use crate::protocol::{decode_header, HeaderType};
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    /// Accepts every command and records transmitted headers
    struct RecordingRadio {
        sent: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Radio for RecordingRadio {
        async fn execute(&self, command: &str, _expected: &[&str]) -> TransportResult<()> {
            if !command.starts_with("AT+SEND=") {
                let _ = self.sent.send(command.to_string());
            }
            Ok(())
        }
    }

    struct DeadRadio;

    #[async_trait]
    impl Radio for DeadRadio {
        async fn execute(&self, _command: &str, _expected: &[&str]) -> TransportResult<()> {
            Err(TransportError::Closed)
        }
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn config(address: &str) -> EngineConfig {
        let known = (130..=140).map(|n| addr(&format!("{:04}", n)));
        EngineConfig::new(addr(address), known).without_jitter()
    }

    fn engine(
        address: &str,
    ) -> (Engine, mpsc::Receiver<AppEvent>, mpsc::UnboundedReceiver<String>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let radio = Arc::new(RecordingRadio { sent: sent_tx });
        let (engine, events) = Engine::new(config(address), radio);
        (engine, events, sent_rx)
    }

    fn frame(from: &str, header: &Header) -> String {
        format!("LR,{},-40,{}", from, header)
    }

    async fn state(engine: &Engine) -> tokio::sync::MutexGuard<'_, NodeState> {
        engine.inner.state.lock().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_then_delivery() {
        let (node, _events, mut sent) = engine("0130");
        state(&node).await.set_connected_node(Some(addr("0134")));

        let sender = node.clone();
        let delivery = tokio::spawn(async move { sender.send_message(&b"hello"[..]).await });

        let request = decode_header(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(request, Header::route_request(addr("0130"), 5, 0, addr("0134")));

        let reply = Header::route_reply(addr("0134"), 4, 1, addr("0130"), addr("0131"));
        node.handle_frame(&frame("0131", &reply)).await;

        let message = decode_header(&sent.recv().await.unwrap()).unwrap();
        match &message.body {
            HeaderBody::Message {
                destination,
                next_node,
                message_id,
                payload,
            } => {
                assert_eq!(*destination, addr("0134"));
                assert_eq!(*next_node, addr("0131"));
                assert_eq!(*message_id, 1);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("Wrong header: {:?}", other),
        }

        let ack = Header::ack(addr("0134"), 4, addr("0130"), "1");
        node.handle_frame(&frame("0131", &ack)).await;

        assert_eq!(delivery.await.unwrap().unwrap(), Delivery::Confirmed);
        assert!(!state(&node).await.is_awaiting_ack(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_purges_route() {
        let (node, _events, mut sent) = engine("0130");
        {
            let mut state = state(&node).await;
            state.set_connected_node(Some(addr("0134")));
            state.table.add_route(addr("0134"), addr("0131"), 2);
        }

        let delivery = assert_ok!(node.send_message(&b"lost"[..]).await);
        assert_eq!(delivery, Delivery::Unconfirmed);

        let mut kinds = Vec::new();
        while let Ok(line) = sent.try_recv() {
            kinds.push(decode_header(&line).unwrap());
        }
        let messages = kinds
            .iter()
            .filter(|h| h.header_type() == HeaderType::Message)
            .count();
        let errors: Vec<_> = kinds
            .iter()
            .filter(|h| h.header_type() == HeaderType::RouteError)
            .collect();
        assert_eq!(messages, 3);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].body,
            HeaderBody::RouteError {
                broken_node: addr("0134")
            }
        );

        let state = state(&node).await;
        assert!(!state.table.has_route(addr("0134")));
        assert!(!state.is_awaiting_ack(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_session_or_route() {
        let (node, _events, mut sent) = engine("0130");
        assert!(matches!(
            node.send_message(&b"x"[..]).await,
            Err(EngineError::NotConnected)
        ));

        state(&node).await.set_connected_node(Some(addr("0135")));
        assert!(matches!(
            node.send_message(&b"x"[..]).await,
            Err(EngineError::NoRoute(_))
        ));

        let mut requests = 0;
        while let Ok(line) = sent.try_recv() {
            assert_eq!(
                decode_header(&line).unwrap().header_type(),
                HeaderType::RouteRequest
            );
            requests += 1;
        }
        assert_eq!(requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_request_rejects_unknown_address() {
        let (node, _events, _sent) = engine("0130");
        assert!(matches!(
            node.send_route_request(addr("9999")).await,
            Err(EngineError::Routing(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_confirmed_by_loopback() {
        let (node, _events, mut sent) = engine("0130");

        let registrar = node.clone();
        let result = tokio::spawn(async move { registrar.send_registration(true, "alice").await });

        let line = sent.recv().await.unwrap();
        assert_eq!(line, "|0130|6|5|true|alice|");
        let relayed = Header::registration(addr("0130"), 4, true, "alice");
        node.handle_frame(&frame("0131", &relayed)).await;

        assert!(result.await.unwrap().unwrap());
        assert_eq!(
            node.peers().await,
            vec![PeerRegistration {
                peer_id: "alice".into(),
                address: addr("0130")
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_unconfirmed() {
        let (node, _events, mut sent) = engine("0130");
        assert!(!node.send_registration(true, "alice").await.unwrap());

        let mut attempts = 0;
        while sent.try_recv().is_ok() {
            attempts += 1;
        }
        assert_eq!(attempts, 3);
        assert!(state(&node).await.table.is_registered("alice"));

        assert!(matches!(
            node.send_registration(true, "a|b").await,
            Err(EngineError::InvalidPeerId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_registrations_confirm_separately() {
        let (node, _events, mut sent) = engine("0130");

        let registrar = node.clone();
        let alice = tokio::spawn(async move { registrar.send_registration(true, "alice").await });
        let registrar = node.clone();
        let bob = tokio::spawn(async move { registrar.send_registration(true, "bob").await });

        // Wait until both have gone out before echoing one of them
        let mut first_round = vec![sent.recv().await.unwrap(), sent.recv().await.unwrap()];
        first_round.sort();
        assert_eq!(first_round, vec!["|0130|6|5|true|alice|", "|0130|6|5|true|bob|"]);

        let relayed = Header::registration(addr("0130"), 4, true, "alice");
        node.handle_frame(&frame("0131", &relayed)).await;

        assert!(alice.await.unwrap().unwrap());
        assert!(!bob.await.unwrap().unwrap());
        assert!(!state(&node).await.registration_echoed(true, "bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_request_is_sent_once_per_window() {
        let (node, _events, mut sent) = engine("0130");
        {
            let mut state = state(&node).await;
            state.table.add_peer("alice", addr("0130"));
            state.table.add_peer("bob", addr("0134"));
            state.table.add_route(addr("0134"), addr("0132"), 2);
        }

        assert!(node.send_connect_request("alice", "bob", 60).await.unwrap());
        assert!(!node.send_connect_request("alice", "bob", 60).await.unwrap());
        assert!(node.send_disconnect_request("alice", "bob").await.unwrap());

        let connect = decode_header(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(
            connect.body,
            HeaderBody::ConnectRequest {
                end_node: addr("0134"),
                next_node: addr("0132"),
                source_peer_id: "alice".into(),
                target_peer_id: "bob".into(),
                timeout: 60,
            }
        );
        let disconnect = decode_header(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(disconnect.header_type(), HeaderType::DisconnectRequest);
        assert!(sent.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(node.send_connect_request("alice", "bob", 60).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_request_requires_local_source() {
        let (node, _events, _sent) = engine("0130");
        {
            let mut state = state(&node).await;
            state.table.add_peer("bob", addr("0134"));
            state.table.add_peer("carol", addr("0133"));
        }

        assert!(matches!(
            node.send_connect_request("carol", "bob", 60).await,
            Err(EngineError::PeerNotLocal(_))
        ));
        assert!(matches!(
            node.send_disconnect_request("alice", "bob").await,
            Err(EngineError::PeerNotRegistered(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_and_relays() {
        let (node, mut events, mut sent) = engine("0134");
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let runner = tokio::spawn(node.clone().run(inbound_rx));

        let connect = Header::new(
            addr("0130"),
            4,
            HeaderBody::ConnectRequest {
                end_node: addr("0134"),
                next_node: addr("0134"),
                source_peer_id: "alice".into(),
                target_peer_id: "bob".into(),
                timeout: 30,
            },
        );
        inbound_tx.send(frame("0133", &connect)).await.unwrap();
        let message = Header::message(addr("0130"), 4, addr("0134"), addr("0134"), 1, &b"hi"[..]);
        inbound_tx.send(frame("0133", &message)).await.unwrap();
        drop(inbound_tx);
        runner.await.unwrap();

        assert!(matches!(events.recv().await, Some(AppEvent::ConnectRequest { .. })));
        assert_eq!(
            events.recv().await,
            Some(AppEvent::Delivered {
                source: addr("0130"),
                message_id: 1,
                payload: Bytes::from_static(b"hi"),
            })
        );
        assert_eq!(sent.recv().await.unwrap(), "|0134|2|5|0130|1|");
        assert_eq!(node.connected_node().await, Some(addr("0130")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transmission_is_reported() {
        let (engine, _events) = Engine::new(config("0130"), Arc::new(DeadRadio));
        let header = Header::route_error(addr("0130"), 5, addr("0131"));
        assert!(!engine.send_header(&header).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_transmission() {
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let radio = Arc::new(RecordingRadio { sent: sent_tx });
        let mut config = config("0130");
        config.max_jitter = Duration::from_millis(500);
        let (engine, _events) = Engine::new(config, radio);

        let start = Instant::now();
        assert!(engine.send_header(&Header::route_error(addr("0130"), 5, addr("0131"))).await);
        assert!(start.elapsed() <= Duration::from_millis(500));
        assert!(sent_rx.try_recv().is_ok());
    }
}
