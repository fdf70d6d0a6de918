//! Execution environment providers.
//!
//! A [`MinimalClient`] never reaches for global state. It asks an injected
//! [`Environment`] for a context at `listen`/`connect`, binds its transport
//! through that context and destroys the context at `cleanup`.
//!
//! [`MinimalClient`]: crate::MinimalClient

use crate::error::EnvironmentError;
use nettester_transport::{MemoryNetwork, Transport, TransportConfig, UdpTransport};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Opaque handle to a context created by an [`Environment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// Get the raw `u64` value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Provider of execution contexts and transports
pub trait Environment: Send {
    /// Create a fresh context for one listen/connect cycle
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::ContextUnavailable` if no context can be created.
    fn create_context(&mut self) -> Result<ContextHandle, EnvironmentError>;

    /// Release a context and everything bound through it
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::UnknownContext` for a handle not currently live.
    fn destroy_context(&mut self, handle: ContextHandle) -> Result<(), EnvironmentError>;

    /// Bind a transport to a local address within a context
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError` if the context is unknown or the bind fails.
    fn bind(
        &mut self,
        handle: ContextHandle,
        addr: SocketAddr,
    ) -> Result<Box<dyn Transport>, EnvironmentError>;
}

/// Tracks live context handles
#[derive(Debug, Default)]
struct ContextRegistry {
    live: HashSet<ContextHandle>,
    next: u64,
}

impl ContextRegistry {
    fn create(&mut self) -> ContextHandle {
        self.next += 1;
        let handle = ContextHandle(self.next);
        self.live.insert(handle);
        handle
    }

    fn destroy(&mut self, handle: ContextHandle) -> Result<(), EnvironmentError> {
        if self.live.remove(&handle) {
            Ok(())
        } else {
            Err(EnvironmentError::UnknownContext(handle))
        }
    }

    fn check(&self, handle: ContextHandle) -> Result<(), EnvironmentError> {
        if self.live.contains(&handle) {
            Ok(())
        } else {
            Err(EnvironmentError::UnknownContext(handle))
        }
    }
}

/// Environment backed by OS UDP sockets
#[derive(Debug, Default)]
pub struct UdpEnvironment {
    config: TransportConfig,
    contexts: ContextRegistry,
}

impl UdpEnvironment {
    /// Create an environment binding sockets with the given settings
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            contexts: ContextRegistry::default(),
        }
    }

    /// Get the transport configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Environment for UdpEnvironment {
    fn create_context(&mut self) -> Result<ContextHandle, EnvironmentError> {
        Ok(self.contexts.create())
    }

    fn destroy_context(&mut self, handle: ContextHandle) -> Result<(), EnvironmentError> {
        self.contexts.destroy(handle)
    }

    fn bind(
        &mut self,
        handle: ContextHandle,
        addr: SocketAddr,
    ) -> Result<Box<dyn Transport>, EnvironmentError> {
        self.contexts.check(handle)?;
        let transport = UdpTransport::bind(addr, &self.config)?;
        Ok(Box::new(transport))
    }
}

#[derive(Debug)]
struct MemoryState {
    contexts: ContextRegistry,
    available: bool,
    default_timeout: Duration,
}

/// Environment backed by an in-process [`MemoryNetwork`].
///
/// Clones share state, so a test can keep a handle after moving one into a
/// client and then inspect live contexts or make context creation fail.
#[derive(Debug, Clone)]
pub struct MemoryEnvironment {
    network: MemoryNetwork,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEnvironment {
    /// Create an environment on a network
    #[must_use]
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            state: Arc::new(Mutex::new(MemoryState {
                contexts: ContextRegistry::default(),
                available: true,
                default_timeout: Duration::ZERO,
            })),
        }
    }

    /// Set the timeout floor reported by transports bound from now on
    #[must_use]
    pub fn with_default_timeout(self, timeout: Duration) -> Self {
        self.lock().default_timeout = timeout;
        self
    }

    /// Get the underlying network
    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Make `create_context` fail while `false`
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Number of contexts created and not yet destroyed
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.lock().contexts.live.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Environment for MemoryEnvironment {
    fn create_context(&mut self) -> Result<ContextHandle, EnvironmentError> {
        let mut state = self.lock();
        if !state.available {
            return Err(EnvironmentError::ContextUnavailable(
                "memory environment disabled".to_string(),
            ));
        }
        Ok(state.contexts.create())
    }

    fn destroy_context(&mut self, handle: ContextHandle) -> Result<(), EnvironmentError> {
        self.lock().contexts.destroy(handle)
    }

    fn bind(
        &mut self,
        handle: ContextHandle,
        addr: SocketAddr,
    ) -> Result<Box<dyn Transport>, EnvironmentError> {
        let timeout = {
            let state = self.lock();
            state.contexts.check(handle)?;
            state.default_timeout
        };
        let transport = self.network.bind(addr)?.with_default_timeout(timeout);
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_context_lifecycle() {
        let env = MemoryEnvironment::new(MemoryNetwork::new());
        let mut handle_env = env.clone();

        let ctx = handle_env.create_context().unwrap();
        assert_eq!(env.live_contexts(), 1);

        let transport = handle_env.bind(ctx, "127.0.0.1:7000".parse().unwrap()).unwrap();
        assert_eq!(
            transport.local_addr().unwrap(),
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );

        handle_env.destroy_context(ctx).unwrap();
        assert_eq!(env.live_contexts(), 0);
        assert!(matches!(
            handle_env.destroy_context(ctx),
            Err(EnvironmentError::UnknownContext(_))
        ));
    }

    #[test]
    fn test_memory_unavailable() {
        let mut env = MemoryEnvironment::new(MemoryNetwork::new());
        env.set_available(false);
        assert!(matches!(
            env.create_context(),
            Err(EnvironmentError::ContextUnavailable(_))
        ));

        env.set_available(true);
        assert!(env.create_context().is_ok());
    }

    #[test]
    fn test_bind_requires_live_context() {
        let mut env = MemoryEnvironment::new(MemoryNetwork::new());
        let ctx = env.create_context().unwrap();
        env.destroy_context(ctx).unwrap();
        assert!(env.bind(ctx, "127.0.0.1:0".parse().unwrap()).is_err());
    }

    #[test]
    fn test_memory_bind_conflict() {
        let mut env = MemoryEnvironment::new(MemoryNetwork::new());
        let ctx = env.create_context().unwrap();
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let _first = env.bind(ctx, addr).unwrap();
        assert!(matches!(
            env.bind(ctx, addr),
            Err(EnvironmentError::Transport(_))
        ));
    }

    #[test]
    fn test_memory_default_timeout() {
        let mut env = MemoryEnvironment::new(MemoryNetwork::new())
            .with_default_timeout(Duration::from_secs(30));
        let ctx = env.create_context().unwrap();
        let transport = env.bind(ctx, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(transport.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_udp_environment_binds_socket() {
        let mut env = UdpEnvironment::new(TransportConfig::default());
        let ctx = env.create_context().unwrap();
        let transport = env.bind(ctx, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(transport.local_addr().unwrap().port(), 0);
        assert_eq!(transport.default_timeout(), Duration::from_secs(30));
        env.destroy_context(ctx).unwrap();
    }
}
