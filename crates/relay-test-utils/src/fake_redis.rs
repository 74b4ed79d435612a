//! In-process RESP2 server speaking just enough Redis for the broker.
//!
//! Handles the connection setup commands, `SUBSCRIBE`, `UNSUBSCRIBE` and
//! `PUBLISH`, and lets a test shape the wire traffic:
//! - Write a burst of deliveries in a single TCP write
//! - Put a delivery on the wire ahead of the next subscribe acknowledgement
//! - Drop every connection, and refuse new ones while "down"
//!
//! # Example
//!
//! ```rust,ignore
//! let redis = FakeRedis::start().await;
//! let (broker, events) = RedisBroker::connect(&redis.url(), backoff, token).await?;
//! broker.subscribe("room1").await?;
//! redis.burst("room1", &["a", "b", "c"]);
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fake Redis server bound to an ephemeral localhost port.
pub struct FakeRedis {
    addr: SocketAddr,
    state: Arc<Mutex<FakeRedisState>>,
    cancel_token: CancellationToken,
}

#[derive(Default)]
struct FakeRedisState {
    next_id: u64,
    connections: HashMap<u64, Peer>,
    /// When set, new connections are closed right after accept
    refusing: bool,
    /// Every `PUBLISH` received, in order
    published: Vec<(String, Vec<u8>)>,
    /// Frames written ahead of the next subscribe acknowledgement
    ahead_of_next_ack: Vec<u8>,
}

struct Peer {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    channels: HashSet<String>,
    kill: CancellationToken,
}

impl FakeRedis {
    /// Bind and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake redis");
        let addr = listener.local_addr().expect("fake redis address");
        let state = Arc::new(Mutex::new(FakeRedisState::default()));
        let cancel_token = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            cancel_token.clone(),
        ));

        Self {
            addr,
            state,
            cancel_token,
        }
    }

    /// `redis://` URL of this server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Write one `message` frame per payload to every subscriber of
    /// `channel`, all in a single write. Returns the number of subscribers.
    pub fn burst(&self, channel: &str, payloads: &[&str]) -> usize {
        let mut frames = Vec::new();
        for payload in payloads {
            frames.extend(message_frame(channel, payload.as_bytes()));
        }
        let state = self.lock();
        let mut receivers = 0;
        for peer in state.connections.values() {
            if peer.channels.contains(channel) && peer.outbound.send(frames.clone()).is_ok() {
                receivers += 1;
            }
        }
        receivers
    }

    /// Put a `message` frame for `channel` on the wire immediately before
    /// the next subscribe acknowledgement, in the same write.
    pub fn deliver_ahead_of_next_ack(&self, channel: &str, payload: &str) {
        self.lock()
            .ahead_of_next_ack
            .extend(message_frame(channel, payload.as_bytes()));
    }

    /// Close every open connection.
    pub fn disconnect_all(&self) {
        for peer in self.lock().connections.values() {
            peer.kill.cancel();
        }
    }

    /// Close new connections right after accepting them.
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    /// Channels subscribed on any open connection, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.lock();
        let mut channels: Vec<String> = state
            .connections
            .values()
            .flat_map(|peer| peer.channels.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        channels.sort();
        channels
    }

    /// Every `PUBLISH` received, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeRedisState> {
        lock(&self.state)
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn lock(state: &Mutex<FakeRedisState>) -> MutexGuard<'_, FakeRedisState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<FakeRedisState>>,
    cancel_token: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            () = cancel_token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        };

        let (id, kill, outbound) = {
            let mut state = lock(&state);
            if state.refusing {
                drop(stream);
                continue;
            }
            state.next_id += 1;
            let id = state.next_id;
            let kill = cancel_token.child_token();
            let (tx, rx) = mpsc::unbounded_channel();
            state.connections.insert(
                id,
                Peer {
                    outbound: tx,
                    channels: HashSet::new(),
                    kill: kill.clone(),
                },
            );
            (id, kill, rx)
        };

        tokio::spawn(serve_connection(stream, id, Arc::clone(&state), kill, outbound));
    }
}

async fn serve_connection(
    stream: TcpStream,
    id: u64,
    state: Arc<Mutex<FakeRedisState>>,
    kill: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    'conn: loop {
        tokio::select! {
            () = kill.cancelled() => break,
            frames = outbound.recv() => match frames {
                Some(frames) => {
                    if writer.write_all(&frames).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while let Some(command) = parse_command(&mut buf) {
                        let reply = handle_command(&state, id, &command);
                        if writer.write_all(&reply).await.is_err() {
                            break 'conn;
                        }
                    }
                }
            },
        }
    }

    lock(&state).connections.remove(&id);
}

fn handle_command(state: &Mutex<FakeRedisState>, id: u64, command: &[Vec<u8>]) -> Vec<u8> {
    let Some((name, args)) = command.split_first() else {
        return b"-ERR empty command\r\n".to_vec();
    };
    let mut state = lock(state);

    match name.to_ascii_uppercase().as_slice() {
        b"CLIENT" | b"SELECT" | b"AUTH" => b"+OK\r\n".to_vec(),
        b"PING" => b"+PONG\r\n".to_vec(),
        b"SUBSCRIBE" => {
            let mut reply = std::mem::take(&mut state.ahead_of_next_ack);
            if let Some(peer) = state.connections.get_mut(&id) {
                for channel in args {
                    let channel = String::from_utf8_lossy(channel).into_owned();
                    peer.channels.insert(channel.clone());
                    reply.extend(ack_frame("subscribe", &channel, peer.channels.len()));
                }
            }
            reply
        }
        b"UNSUBSCRIBE" => {
            let mut reply = Vec::new();
            if let Some(peer) = state.connections.get_mut(&id) {
                for channel in args {
                    let channel = String::from_utf8_lossy(channel).into_owned();
                    peer.channels.remove(&channel);
                    reply.extend(ack_frame("unsubscribe", &channel, peer.channels.len()));
                }
            }
            reply
        }
        b"PUBLISH" => {
            let (Some(channel), Some(payload)) = (args.first(), args.get(1)) else {
                return b"-ERR wrong number of arguments for 'publish'\r\n".to_vec();
            };
            let channel = String::from_utf8_lossy(channel).into_owned();
            state.published.push((channel.clone(), payload.clone()));
            let frame = message_frame(&channel, payload);
            let receivers = state
                .connections
                .values()
                .filter(|peer| peer.channels.contains(&channel))
                .filter(|peer| peer.outbound.send(frame.clone()).is_ok())
                .count();
            format!(":{receivers}\r\n").into_bytes()
        }
        _ => b"-ERR unknown command\r\n".to_vec(),
    }
}

/// Pop one complete command (an array of bulk strings) off `buf`.
fn parse_command(buf: &mut BytesMut) -> Option<Vec<Vec<u8>>> {
    let (args, consumed) = parse_array(buf)?;
    buf.advance(consumed);
    Some(args)
}

fn parse_array(data: &[u8]) -> Option<(Vec<Vec<u8>>, usize)> {
    let (line, mut pos) = read_line(data, 0)?;
    let count = parse_len(line.strip_prefix(b"*")?)?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let (line, start) = read_line(data, pos)?;
        let len = parse_len(line.strip_prefix(b"$")?)?;
        let end = start + len;
        args.push(data.get(start..end)?.to_vec());
        data.get(end..end + 2)?;
        pos = end + 2;
    }
    Some((args, pos))
}

fn read_line(data: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(from..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((rest.get(..end)?, from + end + 2))
}

fn parse_len(digits: &[u8]) -> Option<usize> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.extend(format!("${}\r\n", data.len()).into_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn message_frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = b"*3\r\n".to_vec();
    bulk(&mut frame, b"message");
    bulk(&mut frame, channel.as_bytes());
    bulk(&mut frame, payload);
    frame
}

fn ack_frame(kind: &str, channel: &str, count: usize) -> Vec<u8> {
    let mut frame = b"*3\r\n".to_vec();
    bulk(&mut frame, kind.as_bytes());
    bulk(&mut frame, channel.as_bytes());
    frame.extend(format!(":{count}\r\n").into_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_waits_for_complete_frame() {
        let mut buf = BytesMut::from(&b"*2\r\n$9\r\nSUBSCRIBE\r\n$5\r\nro"[..]);
        assert!(parse_command(&mut buf).is_none());

        buf.extend_from_slice(b"om1\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(
            parse_command(&mut buf),
            Some(vec![b"SUBSCRIBE".to_vec(), b"room1".to_vec()])
        );
        assert_eq!(parse_command(&mut buf), Some(vec![b"PING".to_vec()]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_frame_layout() {
        assert_eq!(
            message_frame("r", b"hi"),
            b"*3\r\n$7\r\nmessage\r\n$1\r\nr\r\n$2\r\nhi\r\n".to_vec()
        );
    }
}
