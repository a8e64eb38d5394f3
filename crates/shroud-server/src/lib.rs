//! Shroud relay server.
//!
//! Production runtime wrapping the action-based [`ServerDriver`] with real
//! I/O: Quinn for QUIC transport, Tokio for the async runtime, system time
//! and OS RNG for the environment.
//!
//! # Architecture
//!
//! The driver is pure logic: events in, actions out. This crate feeds it
//! decoded wire messages and timer ticks, and executes the resulting
//! actions (stream writes, connection closes, log lines). Each client
//! connection carries one server-opened unidirectional stream for ordered
//! outbound delivery; clients send requests on bidirectional streams.
//!
//! # Components
//!
//! - [`ServerDriver`]: orchestrator (sessions, queues, ACKs, rotation, expiry)
//! - [`Server`]: production runtime that executes driver actions
//! - [`QuinnTransport`]: QUIC transport via Quinn
//! - [`SystemEnv`]: production environment (real time, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod directory;
mod driver;
mod error;
mod registry;
mod server_error;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

pub use directory::{IdentityDirectory, OpenDirectory, StaticDirectory};
pub use driver::{LogLevel, ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use registry::{BindOutcome, SessionInfo, SessionRegistry};
pub use server_error::DriverError;
use shroud_core::{Environment, EventStore};
use shroud_proto::{ClientMessage, frame_body_len};
pub use system_env::SystemEnv;
use tokio::sync::RwLock;
pub use transport::{QuinnConnection, QuinnTransport};

/// Interval between driver ticks (expiry schedule, rotation deadlines).
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state for all connections.
struct SharedState {
    /// Map of session ID to QUIC connection (for closing)
    connections: RwLock<HashMap<u64, QuinnConnection>>,
    /// Map of session ID to persistent outbound stream.
    /// All deliveries to a client go through this single stream, ensuring
    /// ordering.
    outbound_streams: RwLock<HashMap<u64, tokio::sync::Mutex<quinn::SendStream>>>,
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Driver configuration (limits, retention, rotation deadline)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            driver: DriverConfig::default(),
        }
    }
}

/// Production relay server, generic over the event store backend.
pub struct Server<S: EventStore> {
    /// The action-based server driver
    driver: ServerDriver<SystemEnv, S, OpenDirectory>,
    /// QUIC endpoint
    transport: QuinnTransport,
    /// Environment
    env: SystemEnv,
}

impl<S: EventStore> Server<S> {
    /// Create and bind a new server.
    ///
    /// Recovers committed group state from the store, so gating decisions
    /// after a restart reflect the last committed memberships.
    pub fn bind(config: ServerRuntimeConfig, store: S) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let driver =
            ServerDriver::recover(env.clone(), store, OpenDirectory, config.driver)?;

        let transport =
            QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;

        Ok(Self { driver, transport, env })
    }

    /// Run the server, accepting connections and processing messages.
    ///
    /// Runs until the server is shut down or an error occurs.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let env = self.env;
        let driver = Arc::new(tokio::sync::Mutex::new(self.driver));
        let shared = Arc::new(SharedState {
            connections: RwLock::new(HashMap::new()),
            outbound_streams: RwLock::new(HashMap::new()),
        });

        // Background tick: daily expiry sweeps and rotation ACK deadlines
        // both hang off this timer.
        {
            let driver = Arc::clone(&driver);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TICK_INTERVAL);
                loop {
                    interval.tick().await;
                    let result = {
                        let mut driver = driver.lock().await;
                        driver.process_event(ServerEvent::Tick)
                    };
                    match result {
                        Ok(actions) => {
                            if let Err(e) = execute_actions(actions, &shared).await {
                                tracing::error!("Tick action error: {}", e);
                            }
                        },
                        Err(e) => tracing::error!("Tick processing error: {}", e),
                    }
                }
            });
        }

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, driver, shared, env).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                },
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Handle a single QUIC connection.
async fn handle_connection<S: EventStore>(
    conn: QuinnConnection,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S, OpenDirectory>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let session_id = env.random_u64();

    tracing::debug!("New connection: {} from {}", session_id, conn.remote_addr());

    let outbound_stream = conn
        .open_uni()
        .await
        .map_err(|e| ServerError::Internal(format!("Failed to open outbound stream: {e}")))?;

    {
        let mut connections = shared.connections.write().await;
        connections.insert(session_id, conn.clone());
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.insert(session_id, tokio::sync::Mutex::new(outbound_stream));
    }

    // Actions are collected under the driver lock and executed after it is
    // released, so a slow stream write never stalls other sessions.
    let actions = {
        let mut driver = driver.lock().await;
        driver.process_event(ServerEvent::ConnectionAccepted { session_id })?
    };
    execute_actions(actions, &shared).await?;

    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let driver = Arc::clone(&driver);
                let shared = Arc::clone(&shared);

                tokio::spawn(async move {
                    if let Err(e) = handle_stream(session_id, send, recv, driver, &shared).await {
                        tracing::debug!("Stream error: {}", e);
                    }
                });
            },
            Err(e) => {
                tracing::debug!("Connection closed: {}", e);
                break;
            },
        }
    }

    {
        let mut connections = shared.connections.write().await;
        connections.remove(&session_id);
    }

    {
        let mut streams = shared.outbound_streams.write().await;
        streams.remove(&session_id);
    }

    let actions = {
        let mut driver = driver.lock().await;
        driver.process_event(ServerEvent::ConnectionClosed {
            session_id,
            reason: "connection closed".to_string(),
        })?
    };
    execute_actions(actions, &shared).await?;

    Ok(())
}

/// Handle a single bidirectional request stream.
///
/// Reads length-prefixed CBOR messages until the peer finishes the stream.
/// Responses go out on the connection's persistent unidirectional stream,
/// never on this one, so ordering with pushed deliveries is preserved.
async fn handle_stream<S: EventStore>(
    session_id: u64,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    driver: Arc<tokio::sync::Mutex<ServerDriver<SystemEnv, S, OpenDirectory>>>,
    shared: &Arc<SharedState>,
) -> Result<(), ServerError> {
    drop(send); // responses use the persistent outbound stream

    loop {
        let mut prefix = [0u8; 4];
        match recv.read_exact(&mut prefix).await {
            Ok(()) => {},
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break;
            },
        }

        let body_len = match frame_body_len(prefix) {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!("Invalid frame length: {}", e);
                break;
            },
        };

        let mut body = vec![0u8; body_len];
        if let Err(e) = recv.read_exact(&mut body).await {
            tracing::debug!("Body read error: {}", e);
            break;
        }

        let message = match shroud_proto::decode_message::<ClientMessage>(&body) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Message decode error: {}", e);
                break;
            },
        };

        let actions = {
            let mut driver = driver.lock().await;
            match driver.process_event(ServerEvent::MessageReceived { session_id, message }) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::warn!("Message processing error: {}", e);
                    continue;
                },
            }
        };

        execute_actions(actions, shared).await?;
    }

    Ok(())
}

/// Execute server actions.
async fn execute_actions(
    actions: Vec<ServerAction>,
    shared: &SharedState,
) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, message } => {
                let framed = shroud_proto::encode_message(&message)
                    .map_err(|e| ServerError::Protocol(e.to_string()))?;

                let streams = shared.outbound_streams.read().await;
                if let Some(stream_mutex) = streams.get(&session_id) {
                    let mut stream = stream_mutex.lock().await;
                    if let Err(e) = stream.write_all(&framed).await {
                        tracing::warn!("SendToSession write failed for {}: {}", session_id, e);
                    }
                } else {
                    tracing::debug!("SendToSession: session {} already gone", session_id);
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!("Closing connection {}: {}", session_id, reason);
                let mut connections = shared.connections.write().await;
                if let Some(conn) = connections.remove(&session_id) {
                    conn.close(0u32.into(), reason.as_bytes());
                }
            },

            ServerAction::NotifyDegradedGroup { group_id, key_version } => {
                // External notifier integration point. Until one is wired up
                // the warning from the driver's Log action is the record.
                tracing::warn!(%group_id, key_version, "degraded group notification");
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }

    Ok(())
}
