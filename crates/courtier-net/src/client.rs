//! The remote worker loop.
//!
//! A client process connects to a [`NetworkedConsumer`](crate::NetworkedConsumer),
//! declares its mnemonic and then loops: receive a raw item, deserialize,
//! process, serialize, send it back. The loop is stateless per task, so
//! idempotent re-delivery of a work item (after a resubmission on the
//! producer side) is naturally tolerated. The server closing the connection
//! is the normal end of a session.

use crate::codec::{self, TaskReply, TaskRequest, WireError};
use courtier::{serialization, Processable, SerializationMode, WorkItem};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use tracing::{info, warn};

/// Connection settings of a remote worker.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the consumer server.
    pub addr: String,
    /// Mnemonic declared in the hello frame.
    pub mnemonic: String,
    /// Wire format; must match the server.
    pub serialization: SerializationMode,
}

/// Tallies of one client session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Tasks answered (evaluated or not).
    pub processed: u64,
    /// Tasks that failed to deserialize, process or serialize.
    pub failed: u64,
}

/// Runs the worker loop until the server closes the connection.
pub fn run_client<T>(config: &ClientConfig) -> Result<ClientStats, WireError>
where
    T: Processable + Serialize + DeserializeOwned,
{
    let stream = TcpStream::connect(&config.addr)?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "cannot disable Nagle");
    }
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    writer.write_all(&codec::encode_hello(&config.mnemonic)?)?;
    writer.flush()?;
    info!(addr = %config.addr, mnemonic = %config.mnemonic, "connected; entering work loop");

    let mut stats = ClientStats::default();
    loop {
        let request = match codec::read_request(&mut reader) {
            Ok(request) => request,
            Err(WireError::Closed) => break,
            Err(e) => return Err(e),
        };

        let (evaluated, payload) = run_task::<T>(&request, config.serialization, &mut stats);
        let reply = TaskReply {
            fingerprint: request.fingerprint,
            evaluated,
            payload,
        };
        writer.write_all(&codec::encode_reply(&reply))?;
        writer.flush()?;
        stats.processed += 1;
    }

    info!(
        processed = stats.processed,
        failed = stats.failed,
        "server closed the connection"
    );
    Ok(stats)
}

/// Executes one task. A payload that cannot be deserialized (or serialized
/// back) is echoed unevaluated; the producer decides what to do with it.
fn run_task<T>(
    request: &TaskRequest,
    mode: SerializationMode,
    stats: &mut ClientStats,
) -> (bool, Vec<u8>)
where
    T: Processable + Serialize + DeserializeOwned,
{
    let payload = match serialization::from_bytes::<T>(&request.payload, mode) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(fingerprint = %request.fingerprint, error = %e,
                "cannot deserialize payload; returning it unevaluated");
            stats.failed += 1;
            return (false, request.payload.clone());
        }
    };

    let mut item = WorkItem::new(payload, request.command);
    if let Err(e) = item.process() {
        warn!(fingerprint = %request.fingerprint, error = %e, "task processing failed");
        stats.failed += 1;
    }

    match serialization::to_bytes(item.payload(), mode) {
        Ok(bytes) => (item.is_evaluated(), bytes),
        Err(e) => {
            warn!(fingerprint = %request.fingerprint, error = %e,
                "cannot serialize result; echoing the original payload unevaluated");
            stats.failed += 1;
            (false, request.payload.clone())
        }
    }
}
