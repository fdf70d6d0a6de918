//! The minimal client: session manager driving one listen/connect cycle.
//!
//! ```no_run
//! use nettester_core::{ClientConfig, Endpoint, MinimalClient, UdpEnvironment};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), nettester_core::ClientError> {
//! let mut client = MinimalClient::new(Box::new(UdpEnvironment::default()), ClientConfig::default())?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! client.subscribe(Box::new(tx));
//!
//! client.connect(&Endpoint::new("127.0.0.1", 7777))?;
//! while !client.is_connected() {
//!     client.tick(Duration::from_millis(33));
//!     std::thread::sleep(Duration::from_millis(33));
//! }
//! client.send_text("hello")?;
//! while let Ok(event) = rx.try_recv() {
//!     println!("{event:?}");
//! }
//! client.cleanup();
//! # Ok(())
//! # }
//! ```

use crate::channel::{ChannelAcceptor, ChannelKind, DefaultChannelAcceptor};
use crate::config::ClientConfig;
use crate::connection::{ConnectionId, ConnectionStats, HandshakeState, Role};
use crate::driver::NetDriver;
use crate::endpoint::Endpoint;
use crate::environment::{ContextHandle, Environment};
use crate::error::ClientError;
use crate::events::{EventBus, EventSink, SubscriptionId};
use crate::CONTROL_CHANNEL;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Snapshot of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Connection role
    pub role: Role,
    /// Peer address
    pub remote: SocketAddr,
    /// Handshake state
    pub state: HandshakeState,
    /// Counters
    pub stats: ConnectionStats,
}

/// Tick-driven network test client.
///
/// All work happens inside calls on this type; nothing runs in the
/// background. Time advances only through [`MinimalClient::tick`].
pub struct MinimalClient {
    environment: Box<dyn Environment>,
    config: ClientConfig,
    events: EventBus,
    acceptor: Box<dyn ChannelAcceptor>,
    context: Option<ContextHandle>,
    driver: Option<NetDriver>,
    clock: Duration,
    next_connection_id: u64,
}

impl MinimalClient {
    /// Create an idle client
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidConfig` if the configuration is unusable.
    pub fn new(environment: Box<dyn Environment>, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            environment,
            config,
            events: EventBus::new(),
            acceptor: Box::new(DefaultChannelAcceptor),
            context: None,
            driver: None,
            clock: Duration::ZERO,
            next_connection_id: 1,
        })
    }

    /// Replace the policy for peer-opened channels
    #[must_use]
    pub fn with_channel_acceptor(mut self, acceptor: Box<dyn ChannelAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    /// Whether a peer may open a channel of this kind
    #[must_use]
    pub fn accept_channel(&self, kind: ChannelKind) -> bool {
        self.acceptor.accept(kind)
    }

    /// Register an event sink
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) -> SubscriptionId {
        self.events.subscribe(sink)
    }

    /// Remove an event sink, returning whether it was registered
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Get the client configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Logical time accumulated from ticks
    #[must_use]
    pub fn clock(&self) -> Duration {
        self.clock
    }

    /// Role of the active cycle
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.driver.as_ref().map(NetDriver::role)
    }

    /// Whether a listen/connect cycle is active
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.driver.is_some()
    }

    /// Whether at least one connection completed its handshake
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|d| d.connections().iter().any(|c| c.is_open()))
    }

    /// Bound local address of the active cycle
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.driver.as_ref().map(NetDriver::local_addr)
    }

    /// Snapshot of every connection, in creation order
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.driver
            .as_ref()
            .map(|d| {
                d.connections()
                    .iter()
                    .map(|c| ConnectionInfo {
                        id: c.id(),
                        role: c.role(),
                        remote: c.remote(),
                        state: c.state(),
                        stats: c.stats(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Unacknowledged frames and unflushed packets across all connections
    #[must_use]
    pub fn pending_reliable(&self) -> usize {
        self.driver
            .as_ref()
            .map_or(0, |d| d.connections().iter().map(|c| c.pending()).sum())
    }

    /// Start listening for peers on `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Setup` if a cycle is already active, the
    /// endpoint does not resolve, or the environment cannot provide a
    /// context or transport. The client is left as it was before the call.
    pub fn listen(&mut self, endpoint: &Endpoint) -> Result<(), ClientError> {
        self.check_idle()?;
        let addr = endpoint.resolve()?;

        let (context, transport) = self.open_context(addr)?;
        let driver = NetDriver::listen_init(
            transport,
            self.config.connection.clone(),
            self.config.max_connections,
            self.first_connection_id(),
        );
        self.install(context, driver)
    }

    /// Connect to a listener at `endpoint` and send the initial Hello
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Setup` under the same conditions as
    /// [`MinimalClient::listen`].
    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<(), ClientError> {
        self.check_idle()?;
        let remote = endpoint.resolve()?;
        let local = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let (context, transport) = self.open_context(local)?;
        let driver = NetDriver::connect_init(
            transport,
            remote,
            self.config.connection.clone(),
            self.first_connection_id(),
            self.clock,
        );
        self.install(context, driver)?;

        if let Some(driver) = self.driver.as_mut() {
            if let Err(err) = driver.send_initial_join(self.clock, &mut self.events) {
                tracing::warn!("Initial Hello to {} not sent: {}", remote, err);
            }
        }
        Ok(())
    }

    // A finished outbound cycle stays installed until its replacement is
    // set up, so a failed setup leaves it untouched.
    fn check_idle(&self) -> Result<(), ClientError> {
        match &self.driver {
            Some(driver) if !driver.is_finished() => Err(ClientError::Setup(
                "a listen or connect cycle is already active".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn first_connection_id(&self) -> u64 {
        self.driver
            .as_ref()
            .map_or(self.next_connection_id, NetDriver::next_id)
    }

    fn open_context(
        &mut self,
        addr: SocketAddr,
    ) -> Result<(ContextHandle, Box<dyn nettester_transport::Transport>), ClientError> {
        let context = self.environment.create_context()?;
        match self.environment.bind(context, addr) {
            Ok(transport) => Ok((context, transport)),
            Err(err) => {
                self.release_context(context);
                Err(err.into())
            }
        }
    }

    fn install(
        &mut self,
        context: ContextHandle,
        driver: Result<NetDriver, nettester_transport::TransportError>,
    ) -> Result<(), ClientError> {
        match driver {
            Ok(driver) => {
                if self.driver.is_some() {
                    tracing::debug!("Previous cycle ended, cleaning up before restart");
                    self.cleanup();
                }
                self.context = Some(context);
                self.driver = Some(driver);
                Ok(())
            }
            Err(err) => {
                self.release_context(context);
                Err(ClientError::Setup(err.to_string()))
            }
        }
    }

    fn release_context(&mut self, context: ContextHandle) {
        if let Err(err) = self.environment.destroy_context(context) {
            tracing::warn!("Failed to destroy context {:?}: {}", context, err);
        }
    }

    /// Advance the clock by `delta` and pump every connection:
    /// receive for all, then send for all, then reap closed peers.
    pub fn tick(&mut self, delta: Duration) {
        self.clock += delta;
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        driver.pump_receive(self.clock, &mut self.events, self.acceptor.as_ref());
        driver.pump_send(self.clock, &mut self.events);
        driver.reap_closed();
    }

    /// Send a text message and flush it.
    ///
    /// An outbound client writes to its connection; a listener broadcasts to
    /// every open connection. Returns the number of connections written to.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` if there is no connection to
    /// write to, or `ClientError::Channel` while the outbound handshake is
    /// still in progress.
    pub fn send_text(&mut self, text: &str) -> Result<usize, ClientError> {
        let driver = self.driver.as_mut().ok_or(ClientError::NotConnected)?;
        driver.send_text(text, self.clock, &mut self.events)
    }

    /// Send a raw message on the Control channel and flush it
    ///
    /// # Errors
    ///
    /// See [`MinimalClient::send_text`].
    pub fn send_control(&mut self, payload: &[u8]) -> Result<usize, ClientError> {
        self.send_on(CONTROL_CHANNEL, payload, true)
    }

    /// Send a payload on any registered channel and flush it
    ///
    /// # Errors
    ///
    /// See [`MinimalClient::send_text`]; oversized unreliable payloads fail
    /// with `ChannelError::PayloadTooLarge`.
    pub fn send_on(&mut self, channel: u16, payload: &[u8], reliable: bool) -> Result<usize, ClientError> {
        let driver = self.driver.as_mut().ok_or(ClientError::NotConnected)?;
        driver.send(channel, payload, reliable, self.clock, &mut self.events)
    }

    /// Register an extra channel on every live connection
    ///
    /// # Errors
    ///
    /// Returns `ClientError::NotConnected` without a live connection and
    /// `ClientError::Channel` if the index is already registered.
    pub fn open_channel(&mut self, index: u16, kind: ChannelKind) -> Result<usize, ClientError> {
        self.driver
            .as_mut()
            .ok_or(ClientError::NotConnected)?
            .open_channel(index, kind)
    }

    /// Raise every live connection's timeout and count now as activity
    pub fn reset_connection_timeout(&mut self, timeout: Duration) {
        if let Some(driver) = self.driver.as_mut() {
            driver.reset_timeouts(timeout, self.clock);
        }
    }

    /// Close every connection, release the transport and destroy the context.
    ///
    /// Safe to call at any time and any number of times.
    pub fn cleanup(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close_all(self.clock, &mut self.events);
            driver.shutdown();
            self.next_connection_id = driver.next_id();
            tracing::info!("Cleaned up {:?} cycle on {}", driver.role(), driver.local_addr());
        }
        if let Some(context) = self.context.take() {
            self.release_context(context);
        }
    }
}

impl Drop for MinimalClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for MinimalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinimalClient")
            .field("driver", &self.driver)
            .field("context", &self.context)
            .field("clock", &self.clock)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MemoryEnvironment;
    use crate::events::NetEvent;
    use nettester_transport::MemoryNetwork;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const TICK: Duration = Duration::from_millis(10);

    fn client(env: &MemoryEnvironment) -> (MinimalClient, UnboundedReceiver<NetEvent>) {
        let mut client =
            MinimalClient::new(Box::new(env.clone()), ClientConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        client.subscribe(Box::new(tx));
        (client, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<NetEvent>) -> Vec<NetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_cleanup_without_cycle_is_noop() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut client, mut rx) = client(&env);
        client.cleanup();
        client.cleanup();
        assert!(!client.is_active());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_send_without_cycle() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut client, _rx) = client(&env);
        assert!(matches!(
            client.send_text("x"),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_setup_failure_restores_state() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut client, _rx) = client(&env);

        env.set_available(false);
        assert!(matches!(
            client.listen(&Endpoint::new("127.0.0.1", 7777)),
            Err(ClientError::Setup(_))
        ));
        assert!(!client.is_active());
        assert_eq!(env.live_contexts(), 0);

        // Bind conflict: context is created then destroyed again
        env.set_available(true);
        let _squatter = env.network().bind("127.0.0.1:7777".parse().unwrap()).unwrap();
        assert!(client.listen(&Endpoint::new("127.0.0.1", 7777)).is_err());
        assert!(!client.is_active());
        assert_eq!(env.live_contexts(), 0);
    }

    #[test]
    fn test_listen_twice_is_setup_error() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut client, _rx) = client(&env);
        client.listen(&Endpoint::new("127.0.0.1", 7777)).unwrap();
        assert_eq!(client.role(), Some(Role::Listener));
        assert!(matches!(
            client.connect(&Endpoint::new("127.0.0.1", 7778)),
            Err(ClientError::Setup(_))
        ));
        assert_eq!(env.live_contexts(), 1);

        client.cleanup();
        assert_eq!(env.live_contexts(), 0);
        assert!(client.local_addr().is_none());
    }

    #[test]
    fn test_connect_and_exchange() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut server, mut server_rx) = client(&env);
        let (mut client, mut client_rx) = client(&env);

        server.listen(&Endpoint::new("0.0.0.0", 7777)).unwrap();
        client.connect(&Endpoint::new("127.0.0.1", 7777)).unwrap();
        assert_eq!(client.connections()[0].state, HandshakeState::VersionSent);

        for _ in 0..3 {
            server.tick(TICK);
            client.tick(TICK);
        }
        assert!(client.is_connected());
        assert!(server.is_connected());

        assert_eq!(client.send_text("ping").unwrap(), 1);
        server.tick(TICK);
        assert_eq!(server.send_text("pong").unwrap(), 1);
        client.tick(TICK);

        let client_events = drain(&mut client_rx);
        let server_events = drain(&mut server_rx);
        let client_id = client.connections()[0].id;
        let server_id = server.connections()[0].id;
        assert_eq!(
            client_events,
            vec![
                NetEvent::Connected(client_id),
                NetEvent::TextReceived {
                    connection: client_id,
                    text: "pong".to_string()
                }
            ]
        );
        assert_eq!(
            server_events,
            vec![
                NetEvent::Connected(server_id),
                NetEvent::TextReceived {
                    connection: server_id,
                    text: "ping".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_cleanup_reports_disconnect_once() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut server, _server_rx) = client(&env);
        let (mut client, mut client_rx) = client(&env);
        server.listen(&Endpoint::new("127.0.0.1", 7777)).unwrap();
        client.connect(&Endpoint::new("127.0.0.1", 7777)).unwrap();
        for _ in 0..3 {
            server.tick(TICK);
            client.tick(TICK);
        }
        drain(&mut client_rx);

        client.cleanup();
        client.cleanup();
        let events = drain(&mut client_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NetEvent::Disconnected(_)));
        assert_eq!(env.live_contexts(), 1);
    }

    #[test]
    fn test_connection_ids_are_sequential_across_cycles() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (mut client, _rx) = client(&env);

        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        assert_eq!(client.connections()[0].id, ConnectionId::new(1));
        client.cleanup();

        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        assert_eq!(client.connections()[0].id, ConnectionId::new(2));
    }

    #[test]
    fn test_finished_cycle_is_replaced() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let config = ClientConfig {
            connection: crate::config::ConnectionConfig {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
            ..ClientConfig::default()
        };
        let mut client = MinimalClient::new(Box::new(env.clone()), config).unwrap();

        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        client.tick(Duration::from_secs(1));
        client.tick(Duration::from_secs(1));
        assert!(client.is_active());
        assert!(!client.is_connected());

        // The timed-out cycle is cleaned up implicitly
        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        assert_eq!(env.live_contexts(), 1);
        assert_eq!(client.connections()[0].id, ConnectionId::new(2));
    }

    #[test]
    fn test_failed_restart_keeps_finished_cycle() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let config = ClientConfig {
            connection: crate::config::ConnectionConfig {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
            ..ClientConfig::default()
        };
        let mut client = MinimalClient::new(Box::new(env.clone()), config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(Box::new(tx));

        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        client.tick(Duration::from_secs(1));
        client.tick(Duration::from_secs(1));
        let finished = client.connections();
        drain(&mut rx);

        env.set_available(false);
        assert!(matches!(
            client.connect(&Endpoint::new("127.0.0.1", 9)),
            Err(ClientError::Setup(_))
        ));
        assert!(matches!(
            client.connect(&Endpoint::new("", 9)),
            Err(ClientError::Setup(_))
        ));

        // Nothing was torn down by the failed attempts
        assert!(client.is_active());
        assert_eq!(env.live_contexts(), 1);
        assert_eq!(client.connections()[0].id, finished[0].id);
        assert!(drain(&mut rx).is_empty());

        env.set_available(true);
        client.connect(&Endpoint::new("127.0.0.1", 9)).unwrap();
        assert_eq!(env.live_contexts(), 1);
        assert_eq!(client.connections()[0].id, ConnectionId::new(2));
    }

    #[test]
    fn test_accept_channel_policy() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let (client, _rx) = client(&env);
        assert!(client.accept_channel(ChannelKind::Text));
        assert!(!client.accept_channel(ChannelKind::Unknown(3)));

        let client = client.with_channel_acceptor(Box::new(|_: ChannelKind| true));
        assert!(client.accept_channel(ChannelKind::Unknown(3)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let config = ClientConfig {
            max_connections: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(
            MinimalClient::new(Box::new(env), config),
            Err(ClientError::InvalidConfig(_))
        ));
    }
}
