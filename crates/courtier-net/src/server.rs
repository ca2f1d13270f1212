//! The server side of the networked execution backend.
//!
//! A [`NetworkedConsumer`] accepts remote worker connections, hands each one
//! raw items pulled from the broker and awaits the processed result within a
//! per-task deadline. A client that disconnects mid-task leaves its item in
//! the routing index; the broker's stale sweeper is the only safety net,
//! which is why this consumer does not promise full return.

use crate::codec::{self, TaskRequest, WireError};
use courtier::{
    serialization, Broker, BrokerError, ConcurrencyEstimate, Consumer, Processable, PutError,
    SerializationMode, WorkItem,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Tuning for the networked consumer.
#[derive(Debug, Clone)]
pub struct NetConsumerConfig {
    /// Address to listen on. Port 0 picks a free port; see
    /// [`NetworkedConsumer::local_addr`].
    pub bind_addr: SocketAddr,
    /// Wire format for payloads.
    pub serialization: SerializationMode,
    /// How long a client may work on one item before the connection is
    /// considered dead.
    pub task_deadline: Duration,
    /// Deadline of each broker pull; bounds shutdown latency.
    pub get_timeout: Duration,
}

impl Default for NetConsumerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10_000)),
            serialization: SerializationMode::Binary,
            task_deadline: Duration::from_secs(60),
            get_timeout: Duration::from_millis(200),
        }
    }
}

/// A consumer whose workers are external client processes reached over TCP.
pub struct NetworkedConsumer<T> {
    broker: Broker<T>,
    config: NetConsumerConfig,
    listener: Option<std::net::TcpListener>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    runtime_thread: Option<JoinHandle<()>>,
}

impl<T> NetworkedConsumer<T>
where
    T: Processable + Serialize + DeserializeOwned,
{
    /// Binds the listening socket. Binding happens here, not at start, so a
    /// bad address is a startup error and `local_addr` is known immediately.
    pub fn new(broker: Broker<T>, config: NetConsumerConfig) -> Result<Self, WireError> {
        let listener = std::net::TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            broker,
            config,
            listener: Some(listener),
            local_addr,
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            runtime_thread: None,
        })
    }

    /// The actually bound address (relevant with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<T> Consumer<T> for NetworkedConsumer<T>
where
    T: Processable + Serialize + DeserializeOwned,
{
    fn async_start_processing(&mut self) {
        let Some(listener) = self.listener.take() else {
            warn!("networked consumer started twice");
            return;
        };
        if let Err(e) = listener.set_nonblocking(true) {
            error!(error = %e, "cannot prepare listener for the async runtime");
            return;
        }
        let broker = self.broker.clone();
        let config = self.config.clone();
        let stop = Arc::clone(&self.stop);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("courtier-net".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .expect("failed to build the networked consumer runtime");
                runtime.block_on(serve(listener, broker, config, stop, shutdown));
            })
            .expect("failed to spawn networked consumer thread");
        self.runtime_thread = Some(handle);
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        // notify_one leaves a permit even if the accept loop has not
        // registered yet.
        self.shutdown.notify_one();
        if let Some(handle) = self.runtime_thread.take() {
            let _ = handle.join();
        }
        debug!("networked consumer shut down");
    }

    fn capable_of_full_return(&self) -> bool {
        false
    }

    fn concurrency_estimate(&self) -> ConcurrencyEstimate {
        // Clients come and go; we cannot know.
        ConcurrencyEstimate {
            units: 0,
            exact: false,
        }
    }

    fn name(&self) -> &str {
        "NetworkedConsumer"
    }

    fn mnemonic(&self) -> &str {
        "nc"
    }

    fn needs_client(&self) -> bool {
        true
    }
}

async fn serve<T>(
    listener: std::net::TcpListener,
    broker: Broker<T>,
    config: NetConsumerConfig,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) where
    T: Processable + Serialize + DeserializeOwned,
{
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "cannot register listener with the runtime");
            return;
        }
    };
    let mut connections: JoinSet<()> = JoinSet::new();
    let shutdown_fut = shutdown.notified();
    tokio::pin!(shutdown_fut);

    loop {
        tokio::select! {
            () = &mut shutdown_fut => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        broker.clone(),
                        config.clone(),
                        Arc::clone(&stop),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }

    connections.shutdown().await;
    debug!("networked consumer accept loop exited");
}

async fn handle_connection<T>(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Broker<T>,
    config: NetConsumerConfig,
    stop: Arc<AtomicBool>,
) where
    T: Processable + Serialize + DeserializeOwned,
{
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "cannot disable Nagle");
    }
    let (mut reader, mut writer) = stream.into_split();

    let mnemonic = match codec::read_hello_async(&mut reader).await {
        Ok(mnemonic) => mnemonic,
        Err(e) => {
            warn!(%peer, error = %e, "handshake failed; closing connection");
            return;
        }
    };
    debug!(%peer, mnemonic, "remote worker connected");

    while !stop.load(Ordering::Acquire) {
        // Pull the next raw item on the blocking pool; broker calls must not
        // run on the reactor threads.
        let pull = {
            let broker = broker.clone();
            let timeout = config.get_timeout;
            tokio::task::spawn_blocking(move || broker.get(timeout)).await
        };
        let item = match pull {
            Ok(Ok(item)) => item,
            Ok(Err(BrokerError::Timeout)) => continue,
            Ok(Err(BrokerError::ShutDown)) => break,
            Err(e) => {
                error!(error = %e, "blocking pull task failed");
                break;
            }
        };

        let Some(fingerprint) = item.fingerprint() else {
            warn!(%peer, "checked out an unstamped item; abandoning it");
            broker.discard(item);
            continue;
        };

        let payload_bytes = match serialization::to_bytes(item.payload(), config.serialization) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%fingerprint, error = %e, "payload refused to serialize; returning it unevaluated");
                let mut item = item;
                item.set_evaluated(false);
                return_item(&broker, item, &stop).await;
                continue;
            }
        };

        let frame = codec::encode_request(&TaskRequest {
            command: item.command(),
            fingerprint,
            payload: payload_bytes,
        });
        if let Err(e) = writer.write_all(&frame).await {
            warn!(%peer, %fingerprint, error = %e,
                "connection lost before dispatch; item orphaned until the sweeper runs");
            return;
        }

        let reply = match tokio::time::timeout(
            config.task_deadline,
            codec::read_reply_async(&mut reader),
        )
        .await
        {
            Err(_) => {
                warn!(%peer, %fingerprint, "task deadline exceeded; orphaning item and closing connection");
                return;
            }
            Ok(Err(e)) => {
                warn!(%peer, %fingerprint, error = %e,
                    "connection lost mid-task; item orphaned until the sweeper runs");
                return;
            }
            Ok(Ok(reply)) => reply,
        };

        if reply.fingerprint != fingerprint {
            warn!(%peer, expected = %fingerprint, received = %reply.fingerprint,
                "protocol violation: fingerprint mismatch; closing connection");
            return;
        }

        let mut item = item;
        match serialization::from_bytes::<T>(&reply.payload, config.serialization) {
            Ok(payload) => {
                *item.payload_mut() = payload;
                item.set_evaluated(reply.evaluated);
            }
            Err(e) => {
                warn!(%fingerprint, error = %e,
                    "reply payload refused to deserialize; returning item unevaluated");
                item.set_evaluated(false);
            }
        }
        return_item(&broker, item, &stop).await;
    }
}

/// Returns one item on the blocking pool, retrying full-buffer timeouts
/// until asked to stop.
async fn return_item<T: Processable>(broker: &Broker<T>, item: WorkItem<T>, stop: &Arc<AtomicBool>) {
    let broker = broker.clone();
    let stop = Arc::clone(stop);
    let result = tokio::task::spawn_blocking(move || {
        let mut pending = item;
        loop {
            match broker.put(pending, Duration::from_millis(200)) {
                Ok(()) => return,
                Err(PutError::Timeout(item)) => {
                    if stop.load(Ordering::Acquire) {
                        broker.discard(item);
                        return;
                    }
                    pending = item;
                }
                Err(PutError::ShutDown(_)) => return,
            }
        }
    })
    .await;
    if let Err(e) = result {
        error!(error = %e, "blocking return task failed");
    }
}
