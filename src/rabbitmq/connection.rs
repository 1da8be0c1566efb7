// src/rabbitmq/connection.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{
    BrokerChannel, BrokerLink, ConsumeOptions, Connector, DeliveryStream, ExchangeKind,
    PublishOptions,
};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

struct Session {
    link: Arc<dyn BrokerLink>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns the link to the broker and the single channel opened over it.
///
/// `connect` retries a bounded number of times. Once connected, a watcher
/// task waits for the link to drop and then reconnects without limit until it
/// succeeds or the manager is closed. Every declare/publish/consume call
/// fails fast with [`RabbitMQError::NotConnected`] while disconnected.
pub struct ConnectionManager {
    uri: String,
    connector: Arc<dyn Connector>,
    max_connect_attempts: u32,
    retry_delay: Duration,
    connected: AtomicBool,
    shutdown: AtomicBool,
    session: RwLock<Option<Session>>,
    generation: watch::Sender<u64>,
}

impl ConnectionManager {
    pub fn new(uri: &str, connector: Arc<dyn Connector>) -> Self {
        let (generation, _) = watch::channel(0);
        ConnectionManager {
            uri: uri.to_string(),
            connector,
            max_connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            session: RwLock::new(None),
            generation,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_connect_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Notified with the new generation after every successful (re)connect.
    pub fn subscribe_reconnects(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Establishes the link and channel, retrying up to the configured
    /// number of attempts with a fixed delay between them.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let link = self.establish_link().await?;

        let channel = match link.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to open a channel, closing connection");
                if let Err(close_err) = link.close().await {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(RabbitMQError::ConnectionError(format!(
                    "failed to open a channel: {}",
                    e
                )));
            }
        };

        // Shutdown is checked under the same lock close() takes.
        let stored = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            if self.is_shut_down() {
                false
            } else {
                *session = Some(Session {
                    link: Arc::clone(&link),
                    channel: Arc::clone(&channel),
                });
                self.connected.store(true, Ordering::SeqCst);
                true
            }
        };
        if !stored {
            info!("Connection manager closed while connecting, dropping new connection");
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close channel");
            }
            if let Err(e) = link.close().await {
                warn!(error = %e, "Failed to close connection");
            }
            return Err(RabbitMQError::ConnectionError(
                "connection manager was closed".to_string(),
            ));
        }
        self.generation.send_modify(|generation| *generation += 1);
        info!(uri = %self.uri, generation = self.generation(), "Successfully connected to RabbitMQ");

        self.spawn_watcher(link);
        Ok(())
    }

    async fn establish_link(&self) -> Result<Arc<dyn BrokerLink>> {
        let mut attempt = 0;
        loop {
            if self.is_shut_down() {
                return Err(RabbitMQError::ConnectionError(
                    "connection manager was closed".to_string(),
                ));
            }
            attempt += 1;
            info!("Attempting to connect to RabbitMQ at {}", self.uri);

            match self.connector.connect(&self.uri).await {
                Ok(link) => return Ok(link),
                Err(err) => {
                    warn!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempt, self.max_connect_attempts, err
                    );

                    if attempt >= self.max_connect_attempts {
                        error!("Max connection attempts reached. Giving up.");
                        return Err(RabbitMQError::ConnectionError(format!(
                            "failed to connect to RabbitMQ after {} attempts: {}",
                            attempt, err
                        )));
                    }

                    info!("Waiting {:?} before next connect attempt", self.retry_delay);
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn spawn_watcher(self: &Arc<Self>, link: Arc<dyn BrokerLink>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = link.closed().await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.connected.store(false, Ordering::SeqCst);

            if manager.is_shut_down() {
                info!("RabbitMQ connection closed after shutdown");
                return;
            }
            warn!(reason = %reason, "RabbitMQ connection lost. Attempting to reconnect...");

            // The nested connect spawns the next watcher.
            loop {
                match manager.connect().await {
                    Ok(()) => {
                        info!("Successfully reconnected to RabbitMQ");
                        return;
                    }
                    Err(_) if manager.is_shut_down() => {
                        info!("Connection manager closed, no longer reconnecting");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to reconnect to RabbitMQ. Retrying...");
                        sleep(manager.retry_delay).await;
                    }
                }
            }
        });
    }

    fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_connected() {
            return Err(RabbitMQError::NotConnected);
        }
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| Arc::clone(&session.channel))
            .ok_or(RabbitMQError::NotConnected)
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let channel = self.channel()?;
        debug!(exchange = %name, kind = %kind, durable, "Declaring exchange");
        channel.declare_exchange(name, kind, durable).await
    }

    /// Returns the declared queue's name.
    pub async fn declare_queue(&self, name: &str, durable: bool) -> Result<String> {
        self.channel()?.declare_queue(name, durable).await
    }

    pub async fn bind_queue(&self, queue: &str, key: &str, exchange: &str) -> Result<()> {
        self.channel()?.bind_queue(queue, key, exchange).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        self.channel()?
            .publish(exchange, routing_key, payload, options)
            .await
    }

    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.channel()?.consume(queue, consumer_tag, options).await
    }

    /// Closes the channel, then the link. Safe to call more than once. After
    /// it, the watcher stops reconnecting and `connect` fails, including a
    /// reconnect already in progress.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);

        let session = {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            self.connected.store(false, Ordering::SeqCst);
            session.take()
        };
        if let Some(session) = session {
            info!("Closing RabbitMQ connection");
            if let Err(e) = session.channel.close().await {
                warn!(error = %e, "Failed to close channel");
            }
            session.link.close().await?;
        }
        Ok(())
    }
}
