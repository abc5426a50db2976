//! Network server.
//!
//! Tokio tasks own the sockets: one accept loop, a reader and a writer per TCP
//! connection, and one UDP task that receives `SwapRequest`s and sends frames. All GL
//! work happens on a single dispatcher thread fed by an event channel, so contexts never
//! move between threads and streams of different clients never interleave.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use sgl_protocol::packets::Packet;
use sgl_protocol::{
    split_frame, ClientId, Connect, FifoReassembler, FifoUpload, RegisterFile, RegisterMirror,
    SwapRequest, SwapResult, Sync as SyncPacket, SCHEMA_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backend::{GlBackend, ReadbackRequest};
use crate::dispatcher::{DispatchSink, Dispatcher, StreamOutcome};
use crate::error::{DispatchError, ServerError};

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// TCP and UDP both bind this address.
    pub listen: SocketAddr,
    pub gl_version: (u32, u32),
    /// Advertised in `Connect`; clients flush their staging buffer at this size.
    pub fifo_size: u32,
    /// Advertised in `Connect`.
    pub fb_size: u32,
}

/// Bytes queued for one client's TCP stream.
#[derive(Debug)]
enum Outbound {
    Packet(Vec<u8>),
    /// Written like a packet; `ack` fires once the bytes are on the wire.
    Sync {
        bytes: Vec<u8>,
        ack: oneshot::Sender<()>,
    },
    Close,
}

#[derive(Debug)]
enum Event {
    Connected {
        id: ClientId,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Stream {
        id: ClientId,
        words: Vec<u32>,
    },
    Disconnected {
        id: ClientId,
    },
    Swap {
        request: SwapRequest,
        peer: SocketAddr,
    },
    Shutdown,
}

/// A frame ready to leave through the UDP socket.
#[derive(Debug)]
struct OutgoingFrame {
    peer: SocketAddr,
    datagrams: Vec<SwapResult>,
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    events: mpsc::UnboundedSender<Event>,
    tasks: Vec<JoinHandle<()>>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        self.signal();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(thread) = self.dispatcher.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }

    fn signal(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.events.send(Event::Shutdown);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.signal();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Binds TCP and UDP on `cfg.listen` and starts serving.
///
/// `make_backend` runs on the dispatcher thread, so the backend itself never has to be
/// `Send`.
pub async fn start_server<B, F>(
    cfg: NetConfig,
    make_backend: F,
) -> Result<ServerHandle, ServerError>
where
    B: GlBackend + 'static,
    F: FnOnce() -> B + Send + 'static,
{
    let listener = TcpListener::bind(cfg.listen).await?;
    let addr = listener.local_addr()?;
    let udp = Arc::new(UdpSocket::bind(addr).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    let gl_version = cfg.gl_version;
    let frame_limit = cfg.fb_size as usize;
    let dispatcher = std::thread::Builder::new()
        .name("sgl-dispatch".into())
        .spawn(move || {
            let dispatcher =
                Dispatcher::new(make_backend(), gl_version).with_frame_limit(frame_limit);
            dispatch_loop(dispatcher, events_rx, frames_tx);
        })?;

    let greeting = Greeting {
        fifo_size: cfg.fifo_size,
        fb_size: cfg.fb_size,
        gl_version,
    };
    let tasks = vec![
        tokio::spawn(accept_loop(
            listener,
            greeting,
            events_tx.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(udp_loop(udp, events_tx.clone(), frames_rx, shutdown_rx)),
    ];

    tracing::info!(%addr, "listening for SGL clients");
    Ok(ServerHandle {
        addr,
        shutdown_tx,
        events: events_tx,
        tasks,
        dispatcher: Some(dispatcher),
    })
}

#[derive(Debug, Clone, Copy)]
struct Greeting {
    fifo_size: u32,
    fb_size: u32,
    gl_version: (u32, u32),
}

async fn accept_loop(
    listener: TcpListener,
    greeting: Greeting,
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id: u32 = 1;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            },
        };
        let id = ClientId(next_id);
        next_id = next_id.wrapping_add(1).max(1);
        tracing::debug!(client = %id, %peer, "accepted connection");
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(client = %id, %err, "failed to disable Nagle");
        }
        if !open_link(stream, id, greeting, &events, shutdown.clone()) {
            break;
        }
    }
}

/// Wires up one accepted stream. Returns `false` once the dispatcher is gone.
fn open_link(
    stream: TcpStream,
    id: ClientId,
    greeting: Greeting,
    events: &mpsc::UnboundedSender<Event>,
    shutdown: watch::Receiver<bool>,
) -> bool {
    let (read, write) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let connect = Connect {
        client_id: id.0,
        fb_size: greeting.fb_size,
        fifo_size: greeting.fifo_size,
        gl_major: greeting.gl_version.0,
        gl_minor: greeting.gl_version.1,
        schema_version: SCHEMA_VERSION,
    };
    // Queued before anything the dispatcher can send, so it is always first.
    let _ = outbound_tx.send(Outbound::Packet(connect.encode()));

    let connected = Event::Connected {
        id,
        outbound: outbound_tx,
    };
    if events.send(connected).is_err() {
        return false;
    }
    tokio::spawn(write_loop(write, id, outbound_rx));
    tokio::spawn(read_loop(read, id, events.clone(), shutdown));
    true
}

async fn read_loop(
    mut read: OwnedReadHalf,
    id: ClientId,
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reassembler = FifoReassembler::new(id.0);
    let mut buf = vec![0u8; FifoUpload::SIZE];
    loop {
        let res = tokio::select! {
            _ = shutdown.changed() => break,
            res = read.read_exact(&mut buf) => res,
        };
        if let Err(err) = res {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                tracing::debug!(client = %id, %err, "read failed");
            }
            break;
        }
        let chunk = match FifoUpload::decode(&buf) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(client = %id, %err, "malformed upload");
                break;
            }
        };
        match reassembler.accept(chunk) {
            Ok(None) => {}
            Ok(Some(words)) => {
                if events.send(Event::Stream { id, words }).is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(client = %id, %err, "dropping client after bad chunk");
                break;
            }
        }
    }
    let _ = events.send(Event::Disconnected { id });
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    id: ClientId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(msg) = outbound.recv().await {
        let res = match msg {
            Outbound::Packet(bytes) => write.write_all(&bytes).await,
            Outbound::Sync { bytes, ack } => {
                let res = write.write_all(&bytes).await;
                let _ = ack.send(());
                res
            }
            Outbound::Close => break,
        };
        if let Err(err) = res {
            tracing::debug!(client = %id, %err, "write failed");
            break;
        }
    }
    let _ = write.shutdown().await;
}

async fn udp_loop(
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<Event>,
    mut frames: mpsc::UnboundedReceiver<OutgoingFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; SwapRequest::SIZE + 1];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = udp.recv_from(&mut buf) => match res {
                Ok((len, peer)) => match SwapRequest::decode(&buf[..len]) {
                    Ok(request) => {
                        if events.send(Event::Swap { request, peer }).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::debug!(%peer, %err, "ignoring datagram"),
                },
                Err(err) => tracing::debug!(%err, "UDP receive failed"),
            },
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let mut out = Vec::with_capacity(SwapResult::SIZE);
                for datagram in &frame.datagrams {
                    out.clear();
                    datagram.encode_into(&mut out);
                    if let Err(err) = udp.send_to(&out, frame.peer).await {
                        tracing::debug!(peer = %frame.peer, %err, "swap datagram lost");
                    }
                }
            }
        }
    }
}

/// One client's register mirror plus its last `RequestFramebuffer` result.
#[derive(Debug, Default)]
struct LinkSink {
    regs: RegisterMirror,
    frame: Vec<u8>,
}

/// A connected client as the dispatcher thread sees it.
#[derive(Debug)]
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    sink: LinkSink,
}

impl Link {
    fn close(self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl DispatchSink for LinkSink {
    fn registers(&mut self) -> &mut dyn RegisterFile {
        &mut self.regs
    }

    fn write_framebuffer(&mut self, pixels: &[u8]) -> Result<(), DispatchError> {
        self.frame.clear();
        self.frame.extend_from_slice(pixels);
        Ok(())
    }
}

fn dispatch_loop<B: GlBackend>(
    mut dispatcher: Dispatcher<B>,
    mut events: mpsc::UnboundedReceiver<Event>,
    frames: mpsc::UnboundedSender<OutgoingFrame>,
) {
    let mut links: BTreeMap<ClientId, Link> = BTreeMap::new();
    let mut swaps: u32 = 0;

    while let Some(event) = events.blocking_recv() {
        match event {
            Event::Connected { id, outbound } => match dispatcher.connect(id) {
                Ok(()) => {
                    let link = Link {
                        outbound,
                        sink: LinkSink::default(),
                    };
                    if let Some(stale) = links.insert(id, link) {
                        stale.close();
                    }
                }
                Err(err) => {
                    tracing::warn!(client = %id, %err, "failed to set up connection");
                    let _ = outbound.send(Outbound::Close);
                }
            },
            Event::Stream { id, words } => {
                let Some(link) = links.get_mut(&id) else {
                    tracing::debug!(client = %id, "stream from a dropped client");
                    continue;
                };
                let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
                match dispatcher.execute_stream(id, &bytes, &mut link.sink) {
                    Ok(StreamOutcome::Completed(_)) => reply(link, id),
                    Ok(StreamOutcome::Goodbye(target)) => {
                        if let Some(link) = links.remove(&target) {
                            link.close();
                        }
                        // Someone else's goodbye still answers the issuer.
                        if let Some(link) = links.get(&id) {
                            reply(link, id);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(client = %id, %err, "rejecting command stream");
                        dispatcher.disconnect(id);
                        if let Some(link) = links.remove(&id) {
                            link.close();
                        }
                    }
                }
            }
            Event::Disconnected { id } => {
                links.remove(&id);
                dispatcher.disconnect(id);
            }
            Event::Swap { request, peer } => {
                swaps = swaps.wrapping_add(1);
                if let Some(frame) = swap(&mut dispatcher, &links, request, peer, swaps) {
                    if frames.send(frame).is_err() {
                        break;
                    }
                }
            }
            Event::Shutdown => break,
        }
    }

    for (_, link) in std::mem::take(&mut links) {
        link.close();
    }
    dispatcher.shutdown();
    tracing::debug!("dispatcher stopped");
}

fn reply(link: &Link, id: ClientId) {
    match link.sink.regs.retval() {
        Ok(retval) => {
            let _ = link.outbound.send(Outbound::Packet(retval.encode()));
        }
        Err(err) => tracing::warn!(client = %id, %err, "cannot read return registers"),
    }
}

/// Reads the frame, releases the client's `Sync` barrier and slices the pixels.
fn swap<B: GlBackend>(
    dispatcher: &mut Dispatcher<B>,
    links: &BTreeMap<ClientId, Link>,
    request: SwapRequest,
    peer: SocketAddr,
    sync: u32,
) -> Option<OutgoingFrame> {
    let id = ClientId(request.client_id);
    let Some(link) = links.get(&id) else {
        tracing::debug!(client = %id, %peer, "swap request for unknown client");
        return None;
    };

    let readback = ReadbackRequest {
        width: request.width,
        height: request.height,
        vflip: request.vflip != 0,
        format: request.format,
    };
    // The barrier is released even without pixels so the client never waits it out.
    let pixels = match dispatcher.read_frame(id, readback) {
        Ok(pixels) => pixels,
        Err(err) => {
            tracing::warn!(client = %id, %err, "swap readback failed");
            Vec::new()
        }
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let barrier = Outbound::Sync {
        bytes: SyncPacket { sync }.encode(),
        ack: ack_tx,
    };
    if link.outbound.send(barrier).is_err() || ack_rx.blocking_recv().is_err() {
        return None;
    }

    Some(OutgoingFrame {
        peer,
        datagrams: split_frame(id.0, &pixels),
    })
}
