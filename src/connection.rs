// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Management
//!
//! This module owns the broker connections. A [`ConnectionManager`] holds at
//! most one open connection for its role and retries forever, with a fixed
//! interval, until the broker accepts it. Once connected it watches the
//! connection: an unexpected close triggers a transparent reconnect, while a
//! close caused by cancellation (the process shutting down) does not.
//!
//! The transport is abstracted by the [`Connector`] trait; [`LapinConnector`]
//! is the production implementation.

use crate::{
    channel::{new_amqp_channel, AmqpChannel},
    config::ConnectionOptions,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::LongString,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    Connection, ConnectionProperties,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

/// The two roles a broker connection is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Consume,
    Publish,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Consume => write!(f, "consumer"),
            ConnectionRole::Publish => write!(f, "publisher"),
        }
    }
}

/// Lifecycle state of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Deliberate cancellation, for instance the process shutting down.
    Cancelled,
    /// Unexpected transport failure.
    Failure(String),
}

/// Invoked once when a connection closes.
pub type CloseCallback = Box<dyn FnOnce(CloseCause) + Send + 'static>;

/// Opens, watches and closes broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    /// Opens a connection. Connectivity failures are reported as
    /// [`AmqpError::ConnectionError`] and retried by the manager.
    async fn connect(&self, options: &ConnectionOptions, name: &str) -> Result<Self::Connection, AmqpError>;

    /// Registers `callback` to run when `connection` closes for any reason
    /// other than [`Connector::close`].
    fn on_close(&self, connection: &Self::Connection, callback: CloseCallback);

    async fn create_channel(&self, connection: &Self::Connection) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self, connection: &Self::Connection) -> Result<(), AmqpError>;
}

/// [`Connector`] backed by lapin, running on the tokio executor.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    type Connection = Arc<Connection>;

    async fn connect(&self, options: &ConnectionOptions, name: &str) -> Result<Self::Connection, AmqpError> {
        debug!("creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(format!("{} connection", name)))
            .with_executor(tokio_executor_trait::Tokio::current());

        let uri = connection_uri(options);
        let connected = match tls_config(options)? {
            Some(tls) => Connection::connect_uri_with_config(uri, properties, tls).await,
            None => Connection::connect_uri(uri, properties).await,
        };

        match connected {
            Ok(c) => {
                debug!("amqp connected");
                Ok(Arc::new(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }
    }

    fn on_close(&self, connection: &Self::Connection, callback: CloseCallback) {
        let mut callback = Some(callback);
        connection.on_error(move |err| {
            if let Some(callback) = callback.take() {
                callback(CloseCause::Failure(err.to_string()));
            }
        });
    }

    async fn create_channel(&self, connection: &Self::Connection) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel: Arc<dyn AmqpChannel> = new_amqp_channel(connection).await?;
        Ok(channel)
    }

    async fn close(&self, connection: &Self::Connection) -> Result<(), AmqpError> {
        match connection.close(200, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::ConnectionError)
            }
            _ => Ok(()),
        }
    }
}

/// The AMQP URI for `options`, with credentials and vhost unescaped.
pub fn connection_uri(options: &ConnectionOptions) -> AMQPUri {
    AMQPUri {
        scheme: if options.tls {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: options.login.clone(),
                password: options.password.clone(),
            },
            host: options.host.clone(),
            port: options.port,
        },
        vhost: options.vhost.clone(),
        query: Default::default(),
    }
}

fn tls_config(options: &ConnectionOptions) -> Result<Option<OwnedTLSConfig>, AmqpError> {
    let Some(tls) = options.tls_options.as_ref().filter(|_| options.tls) else {
        return Ok(None);
    };

    let cert_chain = match &tls.cert_chain {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|err| {
            AmqpError::ConfigurationError(format!("{}: {}", path.display(), err))
        })?),
        None => None,
    };

    let identity = match &tls.identity {
        Some(path) => Some(OwnedIdentity {
            der: std::fs::read(path).map_err(|err| {
                AmqpError::ConfigurationError(format!("{}: {}", path.display(), err))
            })?,
            password: tls.identity_password.clone(),
        }),
        None => None,
    };

    Ok(Some(OwnedTLSConfig {
        identity,
        cert_chain,
    }))
}

/// Owns the broker connection of one role.
pub struct ConnectionManager<C: Connector> {
    role: ConnectionRole,
    options: ConnectionOptions,
    connector: Arc<C>,
    retry_interval: Duration,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    attempts: AtomicUsize,
    current: Mutex<Option<C::Connection>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        role: ConnectionRole,
        options: ConnectionOptions,
        connector: Arc<C>,
        retry_interval: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        Arc::new(ConnectionManager {
            role,
            options,
            connector,
            retry_interval,
            state,
            closing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            current: Mutex::new(None),
        })
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of connection attempts made so far, reconnects included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The open connection.
    pub fn connection(&self) -> Result<C::Connection, AmqpError> {
        self.lock().clone().ok_or(AmqpError::NotInitialized)
    }

    /// Connects, retrying every `retry_interval` until the broker accepts.
    ///
    /// Only connectivity errors are retried; anything else is returned. Fails
    /// with [`AmqpError::AlreadyInitialized`] while a connection is open.
    pub async fn connect(self: &Arc<Self>) -> Result<C::Connection, AmqpError> {
        if self.lock().is_some() {
            return Err(AmqpError::AlreadyInitialized);
        }

        let name = self.role.to_string();
        loop {
            if self.closing.load(Ordering::SeqCst) {
                debug!(role = name.as_str(), "connection closed while connecting");
                return Err(AmqpError::ConnectionError);
            }

            self.state.send_replace(ConnectionState::Connecting);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            debug!("connection to broker {}...", name);

            match self.connector.connect(&self.options, &name).await {
                Ok(conn) => return self.opened(conn).await,
                Err(err) if err.is_connectivity() => {
                    error!(
                        host = self.options.host.as_str(),
                        "failed to connect to host, retrying"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => {
                    self.state.send_replace(ConnectionState::Closed);
                    return Err(err);
                }
            }
        }
    }

    async fn opened(self: &Arc<Self>, conn: C::Connection) -> Result<C::Connection, AmqpError> {
        if self.closing.load(Ordering::SeqCst) {
            self.connector.close(&conn).await?;
            self.state.send_replace(ConnectionState::Closed);
            return Err(AmqpError::ConnectionError);
        }

        *self.lock() = Some(conn.clone());
        self.state.send_replace(ConnectionState::Connected);

        let weak = Arc::downgrade(self);
        let handle = Handle::current();
        self.connector.on_close(
            &conn,
            Box::new(move |cause| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_connection_close(cause, &handle);
                }
            }),
        );

        info!(role = self.role.to_string(), "connected to broker");
        Ok(conn)
    }

    fn on_connection_close(self: Arc<Self>, cause: CloseCause, handle: &Handle) {
        debug!("executing on_connection_close callback");
        self.lock().take();
        self.state.send_replace(ConnectionState::Closed);

        if let CloseCause::Failure(reason) = cause {
            if !self.closing.load(Ordering::SeqCst) {
                warn!(
                    role = self.role.to_string(),
                    reason = reason.as_str(),
                    "connection lost, reconnecting"
                );
                handle.spawn(async move {
                    if let Err(err) = self.connect().await {
                        error!(error = err.to_string(), "failure to reconnect");
                    }
                });
                return;
            }
        }

        debug!("not trying to reconnect");
    }

    /// Deliberately closes the connection; no reconnect follows.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, Ordering::SeqCst);
        let conn = self.lock().take();
        self.state.send_replace(ConnectionState::Closed);

        match conn {
            Some(conn) => self.connector.close(&conn).await,
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<C::Connection>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connects the consume-role and publish-role managers concurrently.
///
/// Fails when either connection fails irrecoverably; whichever side did
/// connect is closed again in that case.
pub async fn connect_pair<C: Connector>(
    connector: Arc<C>,
    consume: ConnectionOptions,
    publish: ConnectionOptions,
    retry_interval: Duration,
) -> Result<(Arc<ConnectionManager<C>>, Arc<ConnectionManager<C>>), AmqpError> {
    let read = ConnectionManager::new(
        ConnectionRole::Consume,
        consume,
        connector.clone(),
        retry_interval,
    );
    let write = ConnectionManager::new(ConnectionRole::Publish, publish, connector, retry_interval);

    if let Err(err) = tokio::try_join!(read.connect(), write.connect()) {
        let _ = tokio::join!(read.close(), write.close());
        return Err(err);
    }

    Ok((read, write))
}
