//! Topic fan-out over an external Redis broker.
//!
//! The bus owns one broker-side subscription per distinct channel and
//! demultiplexes to any number of local receivers through a per-channel
//! `broadcast` sender. Publishing is fire-and-forget: the envelope is
//! serialized to JSON and handed to a writer task, and broker failures are
//! counted, never surfaced to the audio path.
//!
//! The broker connection reconnects with exponential backoff (base 250 ms,
//! factor 2, cap 10 s, jitter ±20%). Channel registrations survive an outage
//! and are re-subscribed on reconnect; publishes during the outage are
//! dropped.
//!
//! An in-memory backend with the identical demux layer backs the test
//! suite; only the broker hop differs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PubSubConfig;
use crate::models::RelayMessage;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Buffered envelopes per channel before the slowest local receiver lags.
const CHANNEL_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("broker URL is invalid: {0}")]
    BadUrl(String),
}

enum ControlCmd {
    Subscribe(String),
    Unsubscribe(String),
}

struct ChannelEntry {
    tx: broadcast::Sender<RelayMessage>,
    refcount: usize,
}

enum Backend {
    /// Loopback delivery, no broker. Used by tests and local development.
    Memory,
    Redis {
        publish_tx: mpsc::UnboundedSender<(String, String)>,
        control_tx: mpsc::UnboundedSender<ControlCmd>,
    },
}

struct BusInner {
    channels: Mutex<HashMap<String, ChannelEntry>>,
    backend: Backend,
    broker_connected: AtomicBool,
    publishes_dropped: AtomicU64,
    shutdown: CancellationToken,
}

impl BusInner {
    fn deliver_local(&self, channel: &str, msg: RelayMessage) {
        let channels = self.channels.lock();
        if let Some(entry) = channels.get(channel) {
            // No receivers is fine; the envelope is simply unobserved.
            let _ = entry.tx.send(msg);
        }
    }
}

/// Handle to one channel registration. Dropping it releases the local
/// receiver and, when it was the last one, the broker-side subscription.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<RelayMessage>,
    inner: Arc<BusInner>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Result<RelayMessage, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self.inner.channels.lock();
        let last = match channels.get_mut(&self.channel) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount == 0
            }
            None => false,
        };
        if last {
            channels.remove(&self.channel);
            if let Backend::Redis { control_tx, .. } = &self.inner.backend {
                let _ = control_tx.send(ControlCmd::Unsubscribe(self.channel.clone()));
            }
        }
    }
}

pub struct PubSubBus {
    inner: Arc<BusInner>,
}

impl PubSubBus {
    /// Connects to the Redis broker. The initial connection is attempted in
    /// the background; a broker that is down at boot only degrades health,
    /// it does not prevent startup.
    pub fn connect(cfg: &PubSubConfig) -> Result<Self, PubSubError> {
        let url = broker_url(cfg)?;
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(BusInner {
            channels: Mutex::new(HashMap::new()),
            backend: Backend::Redis {
                publish_tx,
                control_tx,
            },
            broker_connected: AtomicBool::new(false),
            publishes_dropped: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(publisher_task(inner.clone(), url.clone(), publish_rx));
        tokio::spawn(listener_task(inner.clone(), url, control_rx));

        Ok(Self { inner })
    }

    /// Broker-less bus: publishes loop straight back to local subscribers.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: Mutex::new(HashMap::new()),
                backend: Backend::Memory,
                broker_connected: AtomicBool::new(true),
                publishes_dropped: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Fire-and-forget publish. Never blocks and never fails the caller;
    /// envelopes that cannot reach the broker are counted and dropped.
    pub fn publish(&self, channel: &str, msg: &RelayMessage) {
        match &self.inner.backend {
            Backend::Memory => self.inner.deliver_local(channel, msg.clone()),
            Backend::Redis { publish_tx, .. } => {
                let payload = match serde_json::to_string(msg) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel, error = %e, "failed to serialize envelope");
                        return;
                    }
                };
                if publish_tx.send((channel.to_string(), payload)).is_err() {
                    self.count_dropped(channel);
                }
            }
        }
    }

    /// Registers a local receiver for `channel`, creating the broker-side
    /// subscription when it is the first one.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let rx = {
            let mut channels = self.inner.channels.lock();
            let entry = channels.entry(channel.to_string()).or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_BUFFER);
                debug!(channel, "created local fan-out channel");
                ChannelEntry { tx, refcount: 0 }
            });
            entry.refcount += 1;
            let first = entry.refcount == 1;
            let rx = entry.tx.subscribe();
            if first {
                if let Backend::Redis { control_tx, .. } = &self.inner.backend {
                    let _ = control_tx.send(ControlCmd::Subscribe(channel.to_string()));
                }
            }
            rx
        };

        Subscription {
            channel: channel.to_string(),
            rx,
            inner: self.inner.clone(),
        }
    }

    /// True when the broker connection is up (always true for the memory
    /// backend).
    pub fn is_connected(&self) -> bool {
        self.inner.broker_connected.load(Ordering::Relaxed)
    }

    pub fn publishes_dropped(&self) -> u64 {
        self.inner.publishes_dropped.load(Ordering::Relaxed)
    }

    /// Terminates the listener and writer tasks and drops all channel state.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.channels.lock().clear();
    }

    fn count_dropped(&self, channel: &str) {
        self.inner.publishes_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_publish_dropped_total", 1);
        warn!(channel, "publish dropped, broker unavailable");
    }
}

fn broker_url(cfg: &PubSubConfig) -> Result<String, PubSubError> {
    let mut url =
        url::Url::parse(&cfg.url).map_err(|e| PubSubError::BadUrl(e.to_string()))?;
    if let Some(password) = &cfg.password {
        if url.password().is_none() {
            url.set_password(Some(password))
                .map_err(|()| PubSubError::BadUrl("cannot set password".to_string()))?;
        }
    }
    Ok(url.to_string())
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

async fn publisher_task(
    inner: Arc<BusInner>,
    url: String,
    mut rx: mpsc::UnboundedReceiver<(String, String)>,
) {
    let client = match redis::Client::open(url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "broker URL rejected, all publishes will drop");
            while rx.recv().await.is_some() {
                inner.publishes_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
    };

    let mut conn: Option<redis::aio::ConnectionManager> = None;
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = inner.shutdown.cancelled() => return,
        };
        let Some((channel, payload)) = item else {
            return;
        };

        if conn.is_none() {
            conn = redis::aio::ConnectionManager::new(client.clone()).await.ok();
        }

        let mut delivered = false;
        if let Some(c) = conn.as_mut() {
            let res: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&payload)
                .query_async(c)
                .await;
            match res {
                Ok(_) => delivered = true,
                Err(e) => warn!(channel, error = %e, "broker publish failed"),
            }
        }
        if !delivered {
            inner.publishes_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relay_publish_dropped_total", 1);
        }
    }
}

enum LoopExit {
    Shutdown,
    Disconnected,
}

async fn listener_task(
    inner: Arc<BusInner>,
    url: String,
    mut control_rx: mpsc::UnboundedReceiver<ControlCmd>,
) {
    let mut backoff = BACKOFF_BASE;
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        match connect_pubsub(&url, &inner).await {
            Ok(mut pubsub) => {
                inner.broker_connected.store(true, Ordering::Relaxed);
                backoff = BACKOFF_BASE;
                info!("broker subscription connection established");

                let exit = pump_messages(&inner, &mut pubsub, &mut control_rx).await;
                inner.broker_connected.store(false, Ordering::Relaxed);
                match exit {
                    LoopExit::Shutdown => return,
                    LoopExit::Disconnected => {
                        warn!("broker subscription connection lost, reconnecting");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "broker connect failed");
            }
        }

        tokio::select! {
            _ = sleep(jittered(backoff)) => {}
            _ = inner.shutdown.cancelled() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn connect_pubsub(
    url: &str,
    inner: &Arc<BusInner>,
) -> redis::RedisResult<redis::aio::PubSub> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;

    // Re-establish every channel registered before (or during) the outage.
    let channels: Vec<String> = inner.channels.lock().keys().cloned().collect();
    for channel in &channels {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

async fn pump_messages(
    inner: &Arc<BusInner>,
    pubsub: &mut redis::aio::PubSub,
    control_rx: &mut mpsc::UnboundedReceiver<ControlCmd>,
) -> LoopExit {
    enum Event {
        Msg(Option<redis::Msg>),
        Cmd(Option<ControlCmd>),
        Shutdown,
    }

    loop {
        let event = {
            let mut stream = pubsub.on_message();
            tokio::select! {
                msg = stream.next() => Event::Msg(msg),
                cmd = control_rx.recv() => Event::Cmd(cmd),
                _ = inner.shutdown.cancelled() => Event::Shutdown,
            }
        };

        match event {
            Event::Msg(Some(msg)) => {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel, error = %e, "non-text broker payload dropped");
                        continue;
                    }
                };
                match serde_json::from_str::<RelayMessage>(&payload) {
                    Ok(envelope) => inner.deliver_local(&channel, envelope),
                    Err(e) => warn!(channel, error = %e, "undecodable envelope dropped"),
                }
            }
            Event::Msg(None) => return LoopExit::Disconnected,
            Event::Cmd(Some(ControlCmd::Subscribe(channel))) => {
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(channel, error = %e, "broker subscribe failed");
                    return LoopExit::Disconnected;
                }
            }
            Event::Cmd(Some(ControlCmd::Unsubscribe(channel))) => {
                if let Err(e) = pubsub.unsubscribe(&channel).await {
                    warn!(channel, error = %e, "broker unsubscribe failed");
                    return LoopExit::Disconnected;
                }
            }
            Event::Cmd(None) | Event::Shutdown => return LoopExit::Shutdown,
        }
    }
}
