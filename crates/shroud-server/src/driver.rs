//! Server driver.
//!
//! Ties together the session registry, queue manager (ordering + gating),
//! ACK processor, rotation coordinator, and reaper. Pure logic: events in,
//! actions out, no I/O. The runtime (production or test) feeds it
//! [`ServerEvent`]s and executes the returned [`ServerAction`]s.
//!
//! Client-visible failures (validation, unknown recipient, sender mismatch)
//! are answered with a wire `Error` message and the session stays alive;
//! [`DriverError`] is reserved for faults of the server itself.

use std::collections::{BTreeMap, HashSet};

use shroud_core::{
    AckOutcome, AckProcessor, Environment, EventStore, QueueManager, Reaper, RotationAction,
    RotationConfig, RotationCoordinator, StoreError, queue::REPLAY_LIMIT,
    reaper::{DEFAULT_INTERVAL_MILLIS, DEFAULT_RETENTION_MILLIS},
};
use shroud_proto::{
    Ack, ClientMessage, ErrorCode, EventDraft, EventType, GroupId, Metadata, MetadataValue,
    ServerMessage, UserId, keys,
};

use crate::{
    directory::IdentityDirectory,
    registry::{BindOutcome, SessionRegistry},
    server_error::DriverError,
};

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Rotation tuning (ACK deadline).
    pub rotation: RotationConfig,
    /// How long undelivered events are retained.
    pub retention_millis: u64,
    /// How often the expiry sweep runs.
    pub sweep_interval_millis: u64,
    /// Maximum events replayed per connection.
    pub replay_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            rotation: RotationConfig::default(),
            retention_millis: DEFAULT_RETENTION_MILLIS,
            sweep_interval_millis: DEFAULT_INTERVAL_MILLIS,
            replay_limit: REPLAY_LIMIT,
        }
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (production or test).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted.
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime.
        session_id: u64,
    },

    /// A wire message was received from a connection.
    MessageReceived {
        /// Connection that sent the message.
        session_id: u64,
        /// The decoded message.
        message: ClientMessage,
    },

    /// Group membership changed; distribute a new key.
    ///
    /// Comes from the administrative surface, with wrapped keys produced by
    /// the external crypto service (one per member of the new membership).
    MembershipChanged {
        /// Group whose membership changed.
        group_id: GroupId,
        /// New full membership.
        members: Vec<UserId>,
        /// member → wrapped group key.
        wrapped_keys: BTreeMap<UserId, Vec<u8>>,
    },

    /// Out-of-band request to run the expiry sweep now.
    RunExpiry,

    /// Periodic tick for the expiry schedule and rotation deadlines.
    Tick,

    /// A connection was closed (by peer or error).
    ConnectionClosed {
        /// Connection that was closed.
        session_id: u64,
        /// Reason for closure.
        reason: String,
    },
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code.
#[derive(Debug, Clone)]
pub enum ServerAction {
    /// Send a message to a specific session.
    SendToSession {
        /// Target session ID.
        session_id: u64,
        /// Message to send.
        message: ServerMessage,
    },

    /// Close a connection.
    CloseConnection {
        /// Session to close.
        session_id: u64,
        /// Reason for closure.
        reason: String,
    },

    /// A group committed a rotation nobody confirmed; escalate to the
    /// external notifier.
    NotifyDegradedGroup {
        /// Degraded group.
        group_id: GroupId,
        /// Key version nobody holds.
        key_version: u64,
    },

    /// Log a message (for debugging/monitoring).
    Log {
        /// Log level.
        level: LogLevel,
        /// Message to log.
        message: String,
    },
}

/// Log levels for server actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational message.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// Action-based server driver.
///
/// Orchestrates sessions, queueing, acknowledgement, rotation, and expiry.
pub struct ServerDriver<E, S, D>
where
    E: Environment,
    S: EventStore,
    D: IdentityDirectory,
{
    /// Session registry (session ↔ user mapping).
    registry: SessionRegistry,
    /// Queue manager (ordering + gate table).
    queue: QueueManager<S>,
    /// Rotation coordinator.
    coordinator: RotationCoordinator,
    /// Expiry sweeper.
    reaper: Reaper,
    /// Identity lookup for recipients.
    directory: D,
    /// Environment (time, RNG).
    env: E,
    /// Driver configuration.
    config: ServerConfig,
}

impl<E, S, D> ServerDriver<E, S, D>
where
    E: Environment,
    S: EventStore,
    D: IdentityDirectory,
{
    /// Create a new server driver with no persisted group state loaded.
    pub fn new(env: E, store: S, directory: D, config: ServerConfig) -> Self {
        let coordinator = RotationCoordinator::new(config.rotation.clone());
        Self::with_coordinator(env, store, directory, config, coordinator)
    }

    /// Create a driver, recovering committed group state from the store.
    pub fn recover(
        env: E,
        store: S,
        directory: D,
        config: ServerConfig,
    ) -> Result<Self, DriverError> {
        let coordinator = RotationCoordinator::recover(config.rotation.clone(), &store)?;
        Ok(Self::with_coordinator(env, store, directory, config, coordinator))
    }

    fn with_coordinator(
        env: E,
        store: S,
        directory: D,
        config: ServerConfig,
        coordinator: RotationCoordinator,
    ) -> Self {
        let reaper = Reaper::new(config.retention_millis, config.sweep_interval_millis);
        Self {
            registry: SessionRegistry::new(),
            queue: QueueManager::new(store),
            coordinator,
            reaper,
            directory,
            env,
            config,
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        self.queue.store()
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id } => {
                self.handle_connection_accepted(session_id)
            },
            ServerEvent::MessageReceived { session_id, message } => {
                self.handle_message(session_id, message)
            },
            ServerEvent::MembershipChanged { group_id, members, wrapped_keys } => {
                self.handle_membership_changed(&group_id, members, wrapped_keys)
            },
            ServerEvent::RunExpiry => self.handle_run_expiry(),
            ServerEvent::Tick => self.handle_tick(),
            ServerEvent::ConnectionClosed { session_id, reason } => {
                self.handle_connection_closed(session_id, &reason)
            },
        }
    }

    fn handle_connection_accepted(
        &mut self,
        session_id: u64,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if self.registry.session_count() >= self.config.max_connections {
            return Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        self.registry.register_session(session_id);

        Ok(vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection accepted, session_id={session_id}"),
        }])
    }

    fn handle_message(
        &mut self,
        session_id: u64,
        message: ClientMessage,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.registry.has_session(session_id) {
            return Err(DriverError::SessionNotFound(session_id));
        }

        match message {
            ClientMessage::Connect { user_id } => self.handle_connect(session_id, user_id),
            ClientMessage::Submit(draft) => self.handle_submit(session_id, draft),
            ClientMessage::Ack(ack) => self.handle_ack(session_id, ack),
            ClientMessage::Ping => {
                Ok(vec![ServerAction::SendToSession { session_id, message: ServerMessage::Pong }])
            },
        }
    }

    /// Subscribe a session as a recipient and replay its pending events.
    fn handle_connect(
        &mut self,
        session_id: u64,
        user_id: UserId,
    ) -> Result<Vec<ServerAction>, DriverError> {
        if !self.directory.is_known_user(&user_id) {
            return Ok(vec![error_reply(session_id, ErrorCode::UnknownRecipient, "unknown user")]);
        }

        let mut actions = Vec::new();

        match self.registry.bind_user(session_id, user_id.clone()) {
            Some(BindOutcome::Evicted(old_session)) => {
                actions.push(ServerAction::CloseConnection {
                    session_id: old_session,
                    reason: "superseded by newer session".to_string(),
                });
            },
            Some(BindOutcome::Bound) => {},
            None => return Err(DriverError::SessionNotFound(session_id)),
        }

        // Replay everything currently deliverable, ascending by sequence.
        // Wire receipt is not processing: each event stays queued until the
        // client ACKs it.
        let replay = self.queue.deliverable(&user_id, self.config.replay_limit)?;
        let replayed = replay.len();
        for event in replay {
            actions.push(ServerAction::SendToSession {
                session_id,
                message: ServerMessage::Event(event),
            });
        }

        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!("user {user_id} connected on session {session_id}, replayed {replayed} events"),
        });

        Ok(actions)
    }

    /// Validate and enqueue a submission, pushing it live when the recipient
    /// is connected and not gated.
    fn handle_submit(
        &mut self,
        session_id: u64,
        draft: EventDraft,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let Some(user) = self.registry.user_for_session(session_id) else {
            return Ok(vec![error_reply(
                session_id,
                ErrorCode::NotConnected,
                "submit requires a connected session",
            )]);
        };

        if draft.sender_id.as_deref() != Some(user) {
            return Ok(vec![error_reply(
                session_id,
                ErrorCode::SenderMismatch,
                "sender_id does not match the authenticated user",
            )]);
        }

        if !self.directory.is_known_user(&draft.recipient_id) {
            return Ok(vec![error_reply(
                session_id,
                ErrorCode::UnknownRecipient,
                "recipient has no known identity",
            )]);
        }

        let event_id = draft.event_id;
        let event = match self.queue.enqueue(draft, self.env.now_millis()) {
            Ok(event) => event,
            Err(StoreError::Validation(e)) => {
                return Ok(vec![error_reply(session_id, ErrorCode::Validation, &e.to_string())]);
            },
            Err(e @ StoreError::DuplicateEventId(_)) => {
                return Ok(vec![error_reply(session_id, ErrorCode::Validation, &e.to_string())]);
            },
            // A storage fault is the server's problem, not the client's: the
            // session stays alive and the client may retry.
            Err(e) => {
                return Ok(vec![
                    ServerAction::Log {
                        level: LogLevel::Error,
                        message: format!("storing event {event_id} failed: {e}"),
                    },
                    error_reply(session_id, ErrorCode::Internal, "event could not be stored"),
                ]);
            },
        };

        let mut actions = Vec::new();

        let delivered = match self.registry.session_for_user(&event.recipient_id) {
            Some(target) if !self.queue.is_gated(&event) => {
                actions.push(ServerAction::SendToSession {
                    session_id: target,
                    message: ServerMessage::Event(event.clone()),
                });
                true
            },
            _ => false,
        };

        actions.push(ServerAction::SendToSession {
            session_id,
            message: ServerMessage::SubmitResult { event_id: event.event_id, delivered, queued: true },
        });

        Ok(actions)
    }

    /// Apply an acknowledgement, feeding key-update confirmations into the
    /// rotation coordinator.
    fn handle_ack(&mut self, session_id: u64, ack: Ack) -> Result<Vec<ServerAction>, DriverError> {
        let Some(user) = self.registry.user_for_session(session_id) else {
            return Ok(vec![error_reply(
                session_id,
                ErrorCode::NotConnected,
                "ack requires a connected session",
            )]);
        };

        if ack.recipient_id != user {
            return Ok(vec![error_reply(
                session_id,
                ErrorCode::SenderMismatch,
                "ack for another recipient's event",
            )]);
        }

        match AckProcessor::process(self.queue.store(), &ack)? {
            AckOutcome::Applied => Ok(Vec::new()),
            AckOutcome::KeyUpdateAcked { group_id, key_version } => {
                let rotation_actions =
                    self.coordinator.member_acked(&group_id, &ack.recipient_id, key_version);
                self.apply_rotation_actions(rotation_actions)
            },
        }
    }

    fn handle_membership_changed(
        &mut self,
        group_id: &str,
        members: Vec<UserId>,
        wrapped_keys: BTreeMap<UserId, Vec<u8>>,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let now = self.env.now_millis();
        let rotation_actions =
            self.coordinator.membership_changed(group_id, members, wrapped_keys, now)?;
        self.apply_rotation_actions(rotation_actions)
    }

    fn handle_run_expiry(&mut self) -> Result<Vec<ServerAction>, DriverError> {
        let expired = self.reaper.sweep(self.queue.store(), self.env.now_millis())?;
        Ok(vec![ServerAction::Log {
            level: LogLevel::Info,
            message: format!("expiry sweep removed {expired} events"),
        }])
    }

    fn handle_tick(&mut self) -> Result<Vec<ServerAction>, DriverError> {
        let now = self.env.now_millis();
        let mut actions = Vec::new();

        if self.reaper.due(now) {
            let expired = self.reaper.sweep(self.queue.store(), now)?;
            if expired > 0 {
                actions.push(ServerAction::Log {
                    level: LogLevel::Info,
                    message: format!("expiry sweep removed {expired} events"),
                });
            }
        }

        let rotation_actions = self.coordinator.tick(now);
        actions.extend(self.apply_rotation_actions(rotation_actions)?);

        Ok(actions)
    }

    fn handle_connection_closed(
        &mut self,
        session_id: u64,
        reason: &str,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let info = self.registry.unregister_session(session_id);

        Ok(vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!(
                "session {session_id} closed ({reason}), user={:?}",
                info.and_then(|i| i.user_id)
            ),
        }])
    }

    /// Execute coordinator side effects: enqueue key updates, mutate the
    /// gate table, persist committed groups, and surface degradations.
    ///
    /// When a gate clears for a member (or lifts at commit), the MESSAGEs it
    /// was withholding are pushed to connected members immediately; receipt
    /// is still not processing, so a lost push is covered by the next replay.
    fn apply_rotation_actions(
        &mut self,
        rotation_actions: Vec<RotationAction>,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let now = self.env.now_millis();
        let mut actions = Vec::new();
        // (user, group) pairs whose withheld messages may have been released.
        let mut released: HashSet<(UserId, GroupId)> = HashSet::new();

        for rotation_action in rotation_actions {
            match rotation_action {
                RotationAction::EnqueueKeyUpdate {
                    recipient,
                    group_id,
                    key_version,
                    wrapped_key,
                } => {
                    let mut metadata = Metadata::new();
                    metadata
                        .insert(keys::GROUP_ID.to_string(), MetadataValue::Str(group_id.clone()));
                    metadata.insert(
                        keys::KEY_VERSION.to_string(),
                        MetadataValue::Int(key_version as i64),
                    );
                    let draft = EventDraft {
                        event_id: self.env.random_event_id(),
                        recipient_id: recipient.clone(),
                        sender_id: None,
                        event_type: EventType::GroupKeyUpdate,
                        timestamp: 0,
                        metadata,
                        encrypted_payload: wrapped_key,
                    };
                    let event = self.queue.enqueue(draft, now)?;

                    if let Some(target) = self.registry.session_for_user(&recipient) {
                        actions.push(ServerAction::SendToSession {
                            session_id: target,
                            message: ServerMessage::Event(event),
                        });
                    }
                },
                RotationAction::Gate(update) => {
                    if let shroud_core::GateUpdate::MemberCleared { group_id, member } = &update {
                        released.insert((member.clone(), group_id.clone()));
                    }
                    self.queue.apply_gate_update(update);
                },
                RotationAction::PersistGroup(group) => {
                    for member in &group.members {
                        released.insert((member.clone(), group.group_id.clone()));
                    }
                    actions.push(ServerAction::Log {
                        level: LogLevel::Info,
                        message: format!(
                            "group {} committed at key version {} with {} members",
                            group.group_id,
                            group.key_version,
                            group.members.len()
                        ),
                    });
                    self.queue.store().store_group(&group)?;
                },
                RotationAction::NotifyDegraded { group_id, key_version } => {
                    actions.push(ServerAction::Log {
                        level: LogLevel::Warn,
                        message: format!(
                            "group {group_id} degraded: no member confirmed key version {key_version}"
                        ),
                    });
                    actions.push(ServerAction::NotifyDegradedGroup { group_id, key_version });
                },
            }
        }

        // Push messages that just became deliverable.
        for (user, group) in released {
            let Some(target) = self.registry.session_for_user(&user) else {
                continue;
            };
            for event in self.queue.deliverable(&user, self.config.replay_limit)? {
                if event.event_type == EventType::Message && event.group_id() == Some(&group) {
                    actions.push(ServerAction::SendToSession {
                        session_id: target,
                        message: ServerMessage::Event(event),
                    });
                }
            }
        }

        Ok(actions)
    }
}

fn error_reply(session_id: u64, code: ErrorCode, message: &str) -> ServerAction {
    ServerAction::SendToSession {
        session_id,
        message: ServerMessage::Error { code, message: message.to_string() },
    }
}
