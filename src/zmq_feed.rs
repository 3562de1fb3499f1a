//! The node's pub/sub feed.
//!
//! Subscribes to the `rawtx` and `hashblock` topics over ZMQ and turns
//! multi-part messages into [`FeedEvent`]s for the pipeline task. The
//! socket is polled with a 100 ms timeout on a dedicated thread; any
//! socket error tears the socket down and rebuilds it at the same URL.
//! Missed events are not buffered; the block pipeline reprocesses its
//! confirmation window on restart.

use std::time::Duration;

use bitcoin::{consensus, Transaction};
use tokio::sync::{mpsc, watch};
use tracing::*;

/// Poll timeout of the feed loop.
const POLL_INTERVAL_MS: i64 = 100;

/// Delay before rebuilding a socket that failed to connect.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// One decoded message off the feed.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// A transaction entered the node's mempool.
    RawTx(Transaction),
    /// A new block was announced; the pipeline should re-read the tip.
    NewBlock,
}

/// Decodes one multi-part message into an event.
///
/// Messages are `[topic, payload, sequence]`; the 4-byte little-endian
/// sequence part is ignored. Unknown topics and undecodable payloads
/// yield `None`.
pub fn event_from_parts(topic: &[u8], payload: &[u8]) -> Option<FeedEvent> {
    match topic {
        b"rawtx" => {
            let tx: Transaction = consensus::encode::deserialize(payload).ok()?;
            Some(FeedEvent::RawTx(tx))
        }
        b"hashblock" => Some(FeedEvent::NewBlock),
        _ => None,
    }
}

/// Runs the feed on a dedicated OS thread until `shutdown` flips or the
/// receiving side goes away.
pub fn spawn(
    url: String,
    events: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("zmq-feed".to_string())
        .spawn(move || feed_loop(&url, events, shutdown))
        .expect("spawning the zmq feed thread")
}

fn feed_loop(url: &str, events: mpsc::Sender<FeedEvent>, shutdown: watch::Receiver<bool>) {
    let context = zmq::Context::new();

    'rebuild: while !*shutdown.borrow() {
        let socket = match subscribe(&context, url) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%err, %url, "zmq connect failed");
                std::thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        info!(%url, "zmq feed connected");

        loop {
            if *shutdown.borrow() {
                let _ = socket.set_linger(0);
                break 'rebuild;
            }

            let mut items = [socket.as_poll_item(zmq::POLLIN)];
            match zmq::poll(&mut items, POLL_INTERVAL_MS) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "zmq poll failed, rebuilding socket");
                    let _ = socket.set_linger(0);
                    continue 'rebuild;
                }
            }
            if !items[0].is_readable() {
                continue;
            }

            let parts = match socket.recv_multipart(0) {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(%err, "zmq receive failed, rebuilding socket");
                    let _ = socket.set_linger(0);
                    continue 'rebuild;
                }
            };
            if parts.len() < 2 {
                continue;
            }
            if let Some(event) = event_from_parts(&parts[0], &parts[1]) {
                if events.blocking_send(event).is_err() {
                    break 'rebuild;
                }
            }
        }
    }
    info!("zmq feed stopped");
}

fn subscribe(context: &zmq::Context, url: &str) -> zmq::Result<zmq::Socket> {
    let socket = context.socket(zmq::SUB)?;
    socket.set_subscribe(b"rawtx")?;
    socket.set_subscribe(b"hashblock")?;
    socket.connect(url)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::encode::serialize;

    use super::*;

    #[test]
    fn decodes_rawtx() {
        let tx = bitcoin::Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: vec![],
        };
        let event = event_from_parts(b"rawtx", &serialize(&tx));
        assert_eq!(event, Some(FeedEvent::RawTx(tx)));
    }

    #[test]
    fn decodes_hashblock() {
        assert_eq!(
            event_from_parts(b"hashblock", &[0u8; 32]),
            Some(FeedEvent::NewBlock)
        );
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(event_from_parts(b"rawtx", b"not a tx"), None);
        assert_eq!(event_from_parts(b"hashtx", &[0u8; 32]), None);
    }
}
