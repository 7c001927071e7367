//! Multiplexed sessions.
//!
//! One TCP connection per peer carries many short-lived logical streams.
//! The framing is yamux: a 12-byte header (version, type, flags, stream id,
//! length) in front of data, window-update, ping and go-away frames.
//! Clients open odd stream ids, servers even, so both sides can initiate
//! without collisions.
//!
//! Ownership follows the actor pattern: a [`SessionActor`] task owns the
//! socket and every per-stream state; [`Session`] is a cheap clonable
//! handle speaking to it over a command channel. A separate reader task
//! turns the socket into parsed frames so the actor can select over frames,
//! commands and the keepalive timer without cancellation hazards.
//!
//! Flow control is credit based. Each stream starts with a 256 KiB send
//! window; data beyond the window queues in the actor until the peer
//! replenishes it. The receive side replenishes eagerly, as soon as a data
//! frame has been handed to the stream's reader.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Result, ZifError};

/// Per-stream send credit granted to a fresh stream.
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Largest data frame we emit; bigger writes are chunked.
const MAX_DATA_FRAME: usize = 16 * 1024;

/// Largest data frame we accept. Bounds allocation per frame.
const MAX_ACCEPTED_FRAME: u32 = INITIAL_WINDOW;

/// Transport keepalive ping period.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound data chunks buffered per stream before the session stalls.
const STREAM_BUFFER: usize = 64;

/// Streams a peer may leave unaccepted before new opens are refused.
const ACCEPT_BACKLOG: usize = 32;

const TYPE_DATA: u8 = 0x0;
const TYPE_WINDOW_UPDATE: u8 = 0x1;
const TYPE_PING: u8 = 0x2;
const TYPE_GO_AWAY: u8 = 0x3;

const FLAG_SYN: u16 = 0x1;
const FLAG_ACK: u16 = 0x2;
const FLAG_FIN: u16 = 0x4;
const FLAG_RST: u16 = 0x8;

/// Which side of the connection this session is. Exactly one role per
/// session; the role fixes the stream id parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

#[derive(Debug)]
struct Frame {
    frame_type: u8,
    flags: u16,
    stream_id: u32,
    length: u32,
    data: Vec<u8>,
}

impl Frame {
    fn header_bytes(frame_type: u8, flags: u16, stream_id: u32, length: u32) -> [u8; 12] {
        let mut header = [0u8; 12];
        header[0] = 0; // version
        header[1] = frame_type;
        header[2..4].copy_from_slice(&flags.to_be_bytes());
        header[4..8].copy_from_slice(&stream_id.to_be_bytes());
        header[8..12].copy_from_slice(&length.to_be_bytes());
        header
    }
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 12];
    reader.read_exact(&mut header).await?;

    let version = header[0];
    if version != 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported mux version {version}"),
        ));
    }

    let frame_type = header[1];
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

    let data = if frame_type == TYPE_DATA {
        if length > MAX_ACCEPTED_FRAME {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("data frame of {length} bytes exceeds window"),
            ));
        }
        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data).await?;
        data
    } else {
        Vec::new()
    };

    Ok(Frame {
        frame_type,
        flags,
        stream_id,
        length,
        data,
    })
}

enum Command {
    Open {
        reply: oneshot::Sender<std::io::Result<MuxStream>>,
    },
    Write {
        id: u32,
        data: Vec<u8>,
        ack: oneshot::Sender<std::io::Result<()>>,
    },
    /// Half-close the stream (FIN).
    CloseStream {
        id: u32,
    },
    Ping {
        reply: oneshot::Sender<std::io::Result<Duration>>,
    },
    Close,
}

struct StreamState {
    data_tx: Option<mpsc::Sender<Vec<u8>>>,
    send_window: u32,
    pending_writes: VecDeque<(Vec<u8>, oneshot::Sender<std::io::Result<()>>)>,
    local_closed: bool,
    remote_closed: bool,
}

impl StreamState {
    fn new(data_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            data_tx: Some(data_tx),
            send_window: INITIAL_WINDOW,
            pending_writes: VecDeque::new(),
            local_closed: false,
            remote_closed: false,
        }
    }

    fn finished(&self) -> bool {
        self.local_closed && self.remote_closed && self.pending_writes.is_empty()
    }
}

/// Handle onto a multiplexed session. Cloning is cheap; all clones speak to
/// the same actor.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    incoming: Arc<Mutex<mpsc::Receiver<MuxStream>>>,
    closed: watch::Receiver<bool>,
}

impl Session {
    /// Attach a multiplexer to an established (and already handshaken)
    /// connection. The session takes ownership of the socket.
    pub fn attach<T>(io: T, mode: Mode) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(read_loop(read_half, frame_tx));

        let actor = SessionActor {
            mode,
            write: write_half,
            next_stream_id: if mode == Mode::Client { 1 } else { 2 },
            next_ping_id: 0,
            streams: HashMap::new(),
            pending_pings: HashMap::new(),
            incoming_tx,
            cmd_tx: cmd_tx.clone(),
            closed_tx,
        };
        tokio::spawn(actor.run(cmd_rx, frame_rx));

        Session {
            cmd_tx,
            incoming: Arc::new(Mutex::new(incoming_rx)),
            closed: closed_rx,
        }
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open { reply: reply_tx })
            .await
            .map_err(|_| ZifError::PeerDisconnected)?;
        reply_rx
            .await
            .map_err(|_| ZifError::PeerDisconnected)?
            .map_err(|_| ZifError::PeerDisconnected)
    }

    /// Wait for the peer to open a stream towards us.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(ZifError::PeerDisconnected)
    }

    /// Transport-level ping. Returns the round-trip time, or
    /// `PeerUnreachable` when the deadline passes first.
    pub async fn ping(&self, deadline: Duration) -> Result<Duration> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ping { reply: reply_tx })
            .await
            .map_err(|_| ZifError::PeerDisconnected)?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(Ok(rtt))) => Ok(rtt),
            Ok(Ok(Err(_))) | Ok(Err(_)) => Err(ZifError::PeerDisconnected),
            Err(_) => Err(ZifError::PeerUnreachable),
        }
    }

    /// Terminate the session and the transport under it.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves when the session dies, however that happens.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn read_loop<T>(mut reader: ReadHalf<T>, frame_tx: mpsc::Sender<Frame>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if frame_tx.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                trace!(error = %e, "session read loop ended");
                return;
            }
        }
    }
}

struct SessionActor<T> {
    mode: Mode,
    write: WriteHalf<T>,
    next_stream_id: u32,
    next_ping_id: u32,
    streams: HashMap<u32, StreamState>,
    pending_pings: HashMap<u32, (Instant, Option<oneshot::Sender<std::io::Result<Duration>>>)>,
    incoming_tx: mpsc::Sender<MuxStream>,
    cmd_tx: mpsc::Sender<Command>,
    closed_tx: watch::Sender<bool>,
}

impl<T> SessionActor<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut frame_rx: mpsc::Receiver<Frame>,
    ) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // immediate first tick

        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if self.handle_frame(frame).await.is_err() {
                                break;
                            }
                        }
                        // Transport closed underneath us
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Open { reply }) => {
                            let result = self.open_stream().await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Write { id, data, ack }) => {
                            if self.handle_write(id, data, ack).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::CloseStream { id }) => {
                            let _ = self.close_stream(id).await;
                        }
                        Some(Command::Ping { reply }) => {
                            if self.send_ping(Some(reply)).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Close) | None => {
                            let _ = self
                                .write_frame(TYPE_GO_AWAY, 0, 0, 0, &[])
                                .await;
                            break;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if self.send_ping(None).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        for (_, mut state) in self.streams.drain() {
            state.data_tx.take();
            for (_, ack) in state.pending_writes.drain(..) {
                let _ = ack.send(Err(std::io::ErrorKind::ConnectionReset.into()));
            }
        }
        for (_, (_, reply)) in self.pending_pings.drain() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(std::io::ErrorKind::ConnectionReset.into()));
            }
        }
        let _ = self.write.shutdown().await;
        let _ = self.closed_tx.send(true);
        debug!("session closed");
    }

    async fn write_frame(
        &mut self,
        frame_type: u8,
        flags: u16,
        stream_id: u32,
        length: u32,
        data: &[u8],
    ) -> std::io::Result<()> {
        let header = Frame::header_bytes(frame_type, flags, stream_id, length);
        self.write.write_all(&header).await?;
        if !data.is_empty() {
            self.write.write_all(data).await?;
        }
        self.write.flush().await
    }

    async fn open_stream(&mut self) -> std::io::Result<MuxStream> {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(2);

        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.insert(id, StreamState::new(data_tx));

        self.write_frame(TYPE_WINDOW_UPDATE, FLAG_SYN, id, 0, &[]).await?;

        trace!(stream = id, "opened stream");
        Ok(MuxStream::new(id, self.cmd_tx.clone(), data_rx))
    }

    async fn handle_write(
        &mut self,
        id: u32,
        data: Vec<u8>,
        ack: oneshot::Sender<std::io::Result<()>>,
    ) -> std::io::Result<()> {
        let Some(state) = self.streams.get_mut(&id) else {
            let _ = ack.send(Err(std::io::ErrorKind::BrokenPipe.into()));
            return Ok(());
        };
        if state.local_closed {
            let _ = ack.send(Err(std::io::ErrorKind::BrokenPipe.into()));
            return Ok(());
        }

        state.pending_writes.push_back((data, ack));
        self.flush_stream(id).await
    }

    /// Push queued data out while the stream has window credit.
    async fn flush_stream(&mut self, id: u32) -> std::io::Result<()> {
        loop {
            let Some(state) = self.streams.get_mut(&id) else {
                return Ok(());
            };

            let Some((data, ack)) = state.pending_writes.pop_front() else {
                return Ok(());
            };

            let window = state.send_window as usize;
            if window == 0 {
                state.pending_writes.push_front((data, ack));
                return Ok(());
            }

            let chunk_len = data.len().min(window).min(MAX_DATA_FRAME);
            let (chunk, rest) = data.split_at(chunk_len);

            // Borrow of state ends here; write the frame, then re-borrow.
            let chunk = chunk.to_vec();
            let rest = rest.to_vec();

            self.write_frame(TYPE_DATA, 0, id, chunk.len() as u32, &chunk)
                .await?;

            let state = self.streams.get_mut(&id).expect("stream present");
            state.send_window -= chunk.len() as u32;

            if rest.is_empty() {
                let _ = ack.send(Ok(()));
            } else {
                state.pending_writes.push_front((rest, ack));
            }
        }
    }

    async fn close_stream(&mut self, id: u32) -> std::io::Result<()> {
        let Some(state) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if state.local_closed {
            return Ok(());
        }
        state.local_closed = true;
        self.write_frame(TYPE_DATA, FLAG_FIN, id, 0, &[]).await?;

        if self.streams.get(&id).map(|s| s.finished()).unwrap_or(false) {
            self.streams.remove(&id);
        }
        Ok(())
    }

    async fn send_ping(
        &mut self,
        reply: Option<oneshot::Sender<std::io::Result<Duration>>>,
    ) -> std::io::Result<()> {
        let id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_pings.insert(id, (Instant::now(), reply));
        self.write_frame(TYPE_PING, FLAG_SYN, 0, id, &[]).await
    }

    async fn handle_frame(&mut self, frame: Frame) -> std::io::Result<()> {
        match frame.frame_type {
            TYPE_DATA | TYPE_WINDOW_UPDATE => self.handle_stream_frame(frame).await,
            TYPE_PING => {
                if frame.flags & FLAG_SYN != 0 {
                    self.write_frame(TYPE_PING, FLAG_ACK, 0, frame.length, &[])
                        .await
                } else {
                    if let Some((sent, reply)) = self.pending_pings.remove(&frame.length) {
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(sent.elapsed()));
                        }
                    }
                    Ok(())
                }
            }
            TYPE_GO_AWAY => {
                debug!("peer sent go-away");
                Err(std::io::ErrorKind::ConnectionReset.into())
            }
            other => {
                warn!(frame_type = other, "unknown frame type");
                Err(std::io::ErrorKind::InvalidData.into())
            }
        }
    }

    async fn handle_stream_frame(&mut self, frame: Frame) -> std::io::Result<()> {
        let id = frame.stream_id;

        if frame.flags & FLAG_SYN != 0 && !self.streams.contains_key(&id) {
            self.accept_inbound(id).await?;
        }

        if frame.flags & FLAG_RST != 0 {
            if let Some(mut state) = self.streams.remove(&id) {
                state.data_tx.take();
                for (_, ack) in state.pending_writes.drain(..) {
                    let _ = ack.send(Err(std::io::ErrorKind::ConnectionReset.into()));
                }
            }
            return Ok(());
        }

        if frame.frame_type == TYPE_WINDOW_UPDATE && frame.length > 0 {
            if let Some(state) = self.streams.get_mut(&id) {
                state.send_window = state.send_window.saturating_add(frame.length);
            }
            self.flush_stream(id).await?;
        }

        if frame.frame_type == TYPE_DATA && !frame.data.is_empty() {
            let len = frame.data.len() as u32;
            let delivered = match self.streams.get_mut(&id) {
                Some(state) => match &state.data_tx {
                    Some(tx) => tx.send(frame.data).await.is_ok(),
                    None => false,
                },
                None => false,
            };

            if delivered {
                // Replenish the peer's send window for what we consumed.
                self.write_frame(TYPE_WINDOW_UPDATE, 0, id, len, &[]).await?;
            } else {
                trace!(stream = id, "dropping data for dead stream");
            }
        }

        if frame.flags & FLAG_FIN != 0 {
            if let Some(state) = self.streams.get_mut(&id) {
                state.remote_closed = true;
                state.data_tx.take();
                if state.finished() {
                    self.streams.remove(&id);
                }
            }
        }

        Ok(())
    }

    async fn accept_inbound(&mut self, id: u32) -> std::io::Result<()> {
        // Stream id parity is fixed by role; a peer opening with our parity
        // is confused or malicious.
        let expect_odd = self.mode == Mode::Server;
        if (id % 2 == 1) != expect_odd {
            warn!(stream = id, "inbound stream with wrong id parity, resetting");
            return self.write_frame(TYPE_DATA, FLAG_RST, id, 0, &[]).await;
        }

        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.insert(id, StreamState::new(data_tx));

        let stream = MuxStream::new(id, self.cmd_tx.clone(), data_rx);
        if self.incoming_tx.try_send(stream).is_err() {
            warn!(stream = id, "accept backlog full, resetting stream");
            self.streams.remove(&id);
            return self.write_frame(TYPE_DATA, FLAG_RST, id, 0, &[]).await;
        }

        self.write_frame(TYPE_WINDOW_UPDATE, FLAG_ACK, id, 0, &[]).await
    }
}

type WriteFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// One logical stream. Reads and writes like a socket; dropping it
/// half-closes the stream.
pub struct MuxStream {
    id: u32,
    cmd_tx: mpsc::Sender<Command>,
    data_rx: mpsc::Receiver<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    in_flight: Option<(usize, WriteFuture)>,
    shutdown_fut: Option<WriteFuture>,
    closed: bool,
}

impl MuxStream {
    fn new(id: u32, cmd_tx: mpsc::Sender<Command>, data_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            id,
            cmd_tx,
            data_rx,
            read_buf: Vec::new(),
            read_pos: 0,
            in_flight: None,
            shutdown_fut: None,
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if self.read_pos < self.read_buf.len() {
                let available = self.read_buf.len() - self.read_pos;
                let n = available.min(buf.remaining());
                let start = self.read_pos;
                buf.put_slice(&self.read_buf[start..start + n]);
                self.read_pos += n;
                if self.read_pos == self.read_buf.len() {
                    self.read_buf.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.read_buf = chunk;
                    self.read_pos = 0;
                }
                // Peer half-closed: clean EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            if let Some((len, fut)) = self.in_flight.as_mut() {
                let len = *len;
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(())) => {
                        self.in_flight = None;
                        Poll::Ready(Ok(len))
                    }
                    Poll::Ready(Err(e)) => {
                        self.in_flight = None;
                        Poll::Ready(Err(e))
                    }
                    Poll::Pending => Poll::Pending,
                };
            }

            if self.closed {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }

            let id = self.id;
            let data = buf.to_vec();
            let cmd_tx = self.cmd_tx.clone();
            self.in_flight = Some((
                buf.len(),
                Box::pin(async move {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    cmd_tx
                        .send(Command::Write {
                            id,
                            data,
                            ack: ack_tx,
                        })
                        .await
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
                    ack_rx
                        .await
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?
                }),
            ));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Writes are acknowledged once the actor has flushed them.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        if self.shutdown_fut.is_none() {
            let id = self.id;
            let cmd_tx = self.cmd_tx.clone();
            self.shutdown_fut = Some(Box::pin(async move {
                let _ = cmd_tx.send(Command::CloseStream { id }).await;
                Ok(())
            }));
        }

        let fut = self.shutdown_fut.as_mut().expect("just set");
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.shutdown_fut = None;
                self.closed = true;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(Command::CloseStream { id: self.id });
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (Session, Session) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (
            Session::attach(a, Mode::Client),
            Session::attach(b, Mode::Server),
        )
    }

    #[tokio::test]
    async fn open_write_accept_read() {
        let (client, server) = session_pair();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"hello mux").await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 9];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello mux");
    }

    #[tokio::test]
    async fn both_directions_on_one_stream() {
        let (client, server) = session_pair();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"ping?").await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        inbound.write_all(b"pong!").await.unwrap();

        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");
    }

    #[tokio::test]
    async fn server_can_open_streams_too() {
        let (client, server) = session_pair();

        let mut from_server = server.open_stream().await.unwrap();
        from_server.write_all(b"reverse").await.unwrap();

        let mut at_client = client.accept_stream().await.unwrap();
        let mut buf = [0u8; 7];
        at_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reverse");
    }

    #[tokio::test]
    async fn concurrent_streams_do_not_interleave() {
        let (client, server) = session_pair();

        let mut s1 = client.open_stream().await.unwrap();
        let mut s2 = client.open_stream().await.unwrap();
        assert_ne!(s1.id(), s2.id());

        s1.write_all(b"first").await.unwrap();
        s2.write_all(b"second").await.unwrap();

        let mut in1 = server.accept_stream().await.unwrap();
        let mut in2 = server.accept_stream().await.unwrap();

        let mut buf1 = [0u8; 5];
        let mut buf2 = [0u8; 6];
        in1.read_exact(&mut buf1).await.unwrap();
        in2.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf1, b"first");
        assert_eq!(&buf2, b"second");
    }

    #[tokio::test]
    async fn transfer_larger_than_initial_window() {
        let (client, server) = session_pair();

        let payload = vec![0xEEu8; (INITIAL_WINDOW as usize) * 2 + 12345];
        let expected = payload.clone();

        let mut outbound = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        let mut inbound = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();

        writer.await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn shutdown_gives_clean_eof() {
        let (client, server) = session_pair();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"bye").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn ping_measures_rtt() {
        let (client, _server) = session_pair();
        let rtt = client.ping(Duration::from_secs(5)).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn ping_after_close_fails() {
        let (client, server) = session_pair();
        server.close().await;
        client.wait_closed().await;
        assert!(client.ping(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn close_propagates_to_peer() {
        let (client, server) = session_pair();
        client.close().await;
        server.wait_closed().await;
        assert!(server.is_closed());
        assert!(server.open_stream().await.is_err());
    }
}
