//! Network transport.
//!
//! TCP carries the command stream as [`FifoUpload`] chunks and brings back [`Retval`]
//! and [`Sync`] packets. UDP carries [`SwapRequest`] to the server and the frame back
//! as [`SwapResult`] datagrams. Both sockets use the server's port number.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use sgl_protocol::packets::Packet;
use sgl_protocol::{
    split_fifo, swap_chunk_count, ClientId, Connect, FrameAssembler, PushBuffer, Register,
    RegisterFile, RegisterMirror, Retval, SwapRequest, SwapResult, Sync, SCHEMA_VERSION,
    SWAP_RESULT_OVERPROVISION,
};

use crate::error::TransportError;
use crate::transport::{SwapParams, Transport};

#[derive(Debug)]
pub struct NetTransport {
    tcp: TcpStream,
    udp: UdpSocket,
    server_udp: SocketAddr,
    connect: Connect,
    mirror: RegisterMirror,
    frame: FrameAssembler,
    timeout: Duration,
    closed: bool,
}

impl NetTransport {
    /// Connects to `addr`, reads the server's [`Connect`] packet and checks its schema.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, TransportError> {
        let mut last_err = None;
        let mut tcp = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let mut tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(err)) => return Err(TransportError::from_io(err, "TCP connect", timeout)),
            (None, None) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                )))
            }
        };
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let connect: Connect = read_packet(&mut tcp, "the Connect packet", timeout)?;
        if connect.schema_version != SCHEMA_VERSION {
            return Err(TransportError::SchemaMismatch {
                server: connect.schema_version,
                client: SCHEMA_VERSION,
            });
        }

        let server_udp = tcp.peer_addr()?;
        let bind: SocketAddr = match server_udp {
            SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let udp = UdpSocket::bind(bind)?;
        udp.set_read_timeout(Some(timeout))?;

        let mut mirror = RegisterMirror::new();
        mirror.write(Register::GlMajor, connect.gl_major)?;
        mirror.write(Register::GlMinor, connect.gl_minor)?;

        let id = ClientId(connect.client_id);
        tracing::debug!(client = %id, server = %server_udp, "connected over the network");
        Ok(Self {
            tcp,
            udp,
            server_udp,
            connect,
            mirror,
            frame: FrameAssembler::new(id.0),
            timeout,
            closed: false,
        })
    }

    /// The packet the server greeted this client with.
    pub fn server_info(&self) -> &Connect {
        &self.connect
    }

    /// Closes the transport after a failed exchange. A reply may still be in flight,
    /// so the TCP stream can no longer be trusted to line up with our requests.
    fn fail(&mut self, err: TransportError) -> TransportError {
        if !matches!(err, TransportError::Closed) {
            tracing::warn!(client = self.connect.client_id, %err, "closing the connection");
            self.close();
        }
        err
    }

    fn close(&mut self) {
        self.closed = true;
        if let Err(err) = self.tcp.shutdown(std::net::Shutdown::Both) {
            tracing::debug!(client = self.connect.client_id, %err, "TCP shutdown failed");
        }
    }

    fn send_stream(&mut self, stream: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let words: Vec<u32> = stream
            .chunks(4)
            .map(|c| {
                let mut w = [0u8; 4];
                w[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(w)
            })
            .collect();
        let mut out = Vec::new();
        for chunk in split_fifo(self.connect.client_id, &words) {
            out.clear();
            chunk.encode_into(&mut out);
            self.tcp
                .write_all(&out)
                .map_err(|e| TransportError::from_io(e, "the command upload", self.timeout))?;
        }
        Ok(())
    }

    fn receive_frame(&mut self, params: SwapParams) -> Result<(), TransportError> {
        self.frame.begin(params.width, params.height);
        let attempts = swap_chunk_count(params.width, params.height) * SWAP_RESULT_OVERPROVISION;
        let mut datagram = vec![0u8; SwapResult::SIZE];

        for _ in 0..attempts {
            if self.frame.is_complete() {
                break;
            }
            let (len, _) = match self.udp.recv_from(&mut datagram) {
                Ok(v) => v,
                Err(err) => match TransportError::from_io(err, "swap results", self.timeout) {
                    TransportError::Timeout { .. } => break,
                    other => return Err(other),
                },
            };
            match SwapResult::decode(&datagram[..len]) {
                Ok(pkt) => {
                    self.frame.accept(&pkt);
                }
                Err(err) => tracing::debug!(%err, "dropping malformed swap datagram"),
            }
        }

        if !self.frame.is_complete() {
            tracing::debug!(
                client = self.connect.client_id,
                missing = self.frame.missing(),
                expected = self.frame.expected(),
                "frame incomplete, keeping stale regions"
            );
        }
        Ok(())
    }
}

fn read_packet<P: Packet>(
    tcp: &mut TcpStream,
    what: &'static str,
    timeout: Duration,
) -> Result<P, TransportError> {
    let mut buf = vec![0u8; P::SIZE];
    tcp.read_exact(&mut buf)
        .map_err(|e| TransportError::from_io(e, what, timeout))?;
    Ok(P::decode(&buf)?)
}

impl Transport for NetTransport {
    fn client_id(&self) -> ClientId {
        ClientId(self.connect.client_id)
    }

    fn gl_version(&self) -> (u32, u32) {
        (self.connect.gl_major, self.connect.gl_minor)
    }

    fn capacity(&self) -> usize {
        self.connect.fifo_size as usize
    }

    fn submit(&mut self, stream: &[u8]) -> Result<Retval, TransportError> {
        if let Err(err) = self.send_stream(stream) {
            return Err(self.fail(err));
        }
        let retval: Retval = match read_packet(&mut self.tcp, "the Retval packet", self.timeout) {
            Ok(r) => r,
            Err(TransportError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                // The server closes the stream when it rejects what we sent.
                self.close();
                return Err(TransportError::Rejected);
            }
            Err(err) => return Err(self.fail(err)),
        };
        self.mirror.load_retval(&retval);
        Ok(retval)
    }

    fn goodbye(&mut self, stream: &[u8]) -> Result<(), TransportError> {
        let res = self.send_stream(stream);
        self.close();
        res
    }

    fn swap_buffers(
        &mut self,
        pending: &mut PushBuffer,
        params: SwapParams,
    ) -> Result<(), TransportError> {
        if !pending.is_empty() {
            pending.finish();
            let res = self.submit(pending.as_bytes());
            pending.reset();
            res?;
        }
        if self.closed {
            return Err(TransportError::Closed);
        }

        let request = SwapRequest {
            client_id: self.connect.client_id,
            width: params.width,
            height: params.height,
            vflip: params.vflip as u32,
            format: params.format,
        };
        if let Err(err) = self.udp.send_to(&request.encode(), self.server_udp) {
            return Err(self.fail(err.into()));
        }
        let sync: Sync = match read_packet(&mut self.tcp, "the swap Sync barrier", self.timeout) {
            Ok(sync) => sync,
            Err(err) => return Err(self.fail(err)),
        };
        self.mirror.write(Register::SwapSync, sync.sync)?;

        self.receive_frame(params)
    }

    fn framebuffer(&mut self) -> &[u8] {
        self.frame.frame()
    }

    fn framebuffer_address(&self) -> *const u8 {
        self.frame.frame().as_ptr()
    }

    fn registers(&self) -> &dyn RegisterFile {
        &self.mirror
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
