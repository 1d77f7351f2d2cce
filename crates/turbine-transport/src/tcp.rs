//! TCP links
//!
//! Every frame on the wire is a big-endian `u32` length followed by that many
//! bytes. Each stream is driven by two tasks: a writer draining the sender's
//! queue and a reader turning frames into [`TransportEvent`]s. Closing either
//! half stops both and tells the local receiver.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    Connection, Connector, TransportEvent, TransportReceiver, TransportSender, TransportServer,
};

/// Bytes in a frame header
const HEADER_LEN: usize = 4;

/// Frames queued per direction before senders wait
const QUEUE_DEPTH: usize = 256;

/// TCP link settings
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Largest frame accepted or sent
    pub max_frame_size: usize,
    /// Initial read buffer per link
    pub read_buffer_size: usize,
    /// Idle time before TCP keepalive probes start; `None` leaves keepalive off
    pub keepalive: Option<Duration>,
    /// Disable Nagle's algorithm; control messages are small and latency bound
    pub nodelay: bool,
    /// How long dialling may take
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            read_buffer_size: 8 * 1024,
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Dials other routers over TCP
#[derive(Clone, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Open a link to `addr` (`host:port`)
    pub async fn connect(&self, addr: &str) -> Result<(TcpSender, TcpReceiver)> {
        debug!("Dialling {}", addr);

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        info!("Connected to {}", addr);
        Ok(open_link(stream, &self.config))
    }
}

#[async_trait]
impl Connector for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Connection> {
        let (sender, receiver) = TcpTransport::connect(self, addr).await?;
        Ok((Arc::new(sender), Box::new(receiver)))
    }
}

fn tune(stream: &TcpStream, config: &TcpConfig) {
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }
    if let Some(idle) = config.keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("Could not enable TCP keepalive: {}", e);
        }
    }
}

/// Shared between a link's sender and its two tasks
struct LinkState {
    connected: AtomicBool,
    /// Flipped to true once, when the link closes for any reason
    closing: watch::Sender<bool>,
}

impl LinkState {
    fn shut(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.closing.send_replace(true);
        was_connected
    }
}

fn open_link(stream: TcpStream, config: &TcpConfig) -> (TcpSender, TcpReceiver) {
    tune(&stream, config);

    let (closing, _) = watch::channel(false);
    let state = Arc::new(LinkState {
        connected: AtomicBool::new(true),
        closing,
    });
    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(QUEUE_DEPTH);
    let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(QUEUE_DEPTH);

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_frames(write_half, frames_rx, state.clone(), events_tx.clone()));
    tokio::spawn(read_frames(
        read_half,
        FrameDecoder::new(config.max_frame_size),
        config.read_buffer_size,
        state.clone(),
        events_tx,
    ));

    let sender = TcpSender {
        frames: frames_tx,
        state,
        max_frame_size: config.max_frame_size,
    };
    (sender, TcpReceiver { events: events_rx })
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Bytes>,
    state: Arc<LinkState>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut closing = state.closing.subscribe();
    let mut out = BytesMut::new();

    loop {
        let data = tokio::select! {
            _ = closing.wait_for(|closed| *closed) => break,
            data = frames.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        out.clear();
        out.reserve(HEADER_LEN + data.len());
        out.put_u32(data.len() as u32);
        out.extend_from_slice(&data);

        if let Err(e) = writer.write_all(&out).await {
            warn!("TCP write failed: {}", e);
            if state.shut() {
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
            }
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    decoder: FrameDecoder,
    buffer_size: usize,
    state: Arc<LinkState>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut closing = state.closing.subscribe();
    let mut buf = BytesMut::with_capacity(buffer_size);

    let last = 'read: loop {
        let read = tokio::select! {
            _ = closing.wait_for(|closed| *closed) => break 'read None,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                break Some(TransportEvent::Disconnected {
                    reason: Some("closed by peer".into()),
                })
            }
            Ok(_) => loop {
                match decoder.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if events.send(TransportEvent::Data(frame)).await.is_err() {
                            break 'read None;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Dropping TCP link: {}", e);
                        break 'read Some(TransportEvent::Disconnected {
                            reason: Some(e.to_string()),
                        });
                    }
                }
            },
            Err(e) => break Some(TransportEvent::Error(e.to_string())),
        }
    };

    let event = last.unwrap_or(TransportEvent::Disconnected { reason: None });
    state.shut();
    let _ = events.send(event).await;
}

/// Splits a byte stream into length-prefixed frames
struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Take the next complete frame off the front of `buf`
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let size = (&buf[..HEADER_LEN]).get_u32() as usize;
        if size > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        if buf.len() < HEADER_LEN + size {
            buf.reserve(HEADER_LEN + size - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        Ok(Some(buf.split_to(size).freeze()))
    }
}

/// Queues frames for a link's writer task
pub struct TcpSender {
    frames: mpsc::Sender<Bytes>,
    state: Arc<LinkState>,
    max_frame_size: usize,
}

#[async_trait]
impl TransportSender for TcpSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if data.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        self.frames
            .send(data)
            .await
            .map_err(|_| TransportError::SendFailed("writer stopped".into()))
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.state.shut() {
            debug!("Closing TCP link");
        }
        Ok(())
    }
}

/// Events read off a TCP link
pub struct TcpReceiver {
    events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Accepts TCP links from other routers
pub struct TcpServer {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, TcpConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, config: TcpConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
        info!("Listening for routers on {}", addr);
        Ok(Self { listener, config })
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    type Sender = TcpSender;
    type Receiver = TcpReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, String)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;

        debug!("Accepted TCP link from {}", peer);
        let (sender, receiver) = open_link(stream, &self.config);
        Ok((sender, receiver, peer.to_string()))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
