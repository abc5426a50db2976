#![cfg(not(target_arch = "wasm32"))]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use sgl_client::{Client, NetTransport, Transport, TransportError};
use sgl_protocol::packets::Packet;
use sgl_protocol::{Command, Connect, FifoUpload, Retval, SCHEMA_VERSION};
use sgl_server::{gl, start_server, NetConfig, ServerHandle, SoftwareBackend};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn server() -> ServerHandle {
    let cfg = NetConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        gl_version: (3, 3),
        fifo_size: 64 * 1024,
        fb_size: 4 * 1024 * 1024,
    };
    start_server(cfg, SoftwareBackend::new).await.unwrap()
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

fn connect(addr: SocketAddr) -> Client<NetTransport> {
    Client::new(NetTransport::connect(addr, TIMEOUT).unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn greets_with_connect() {
    let server = server().await;
    let addr = server.local_addr();

    let (first, second) = blocking(move || {
        let a = connect(addr);
        let b = connect(addr);
        (*a.transport().server_info(), *b.transport().server_info())
    })
    .await;

    assert_eq!(first.client_id, 1);
    assert_eq!(second.client_id, 2);
    assert_eq!(first.schema_version, SCHEMA_VERSION);
    assert_eq!((first.gl_major, first.gl_minor), (3, 3));
    assert_eq!(first.fifo_size, 64 * 1024);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_replies_and_swap() {
    let server = server().await;
    let addr = server.local_addr();

    let frame = blocking(move || {
        let mut client = connect(addr);

        let version = client
            .call_for_retval(&Command::GetString { name: gl::VERSION })
            .unwrap();
        assert_eq!(version.string(), "3.3 sgl");

        client.report_dimensions(16, 16).unwrap();
        client
            .call(&Command::ClearColor { r: 1.0, g: 0.0, b: 0.0, a: 1.0 })
            .unwrap();
        client.call(&Command::Clear { mask: gl::COLOR_BUFFER_BIT }).unwrap();
        client.swap_buffers(16, 16, true, gl::BGRA).unwrap();
        let frame = client.framebuffer().to_vec();

        client.goodbye().unwrap();
        assert!(client.transport().is_closed());
        frame
    })
    .await;

    assert_eq!(frame.len(), 16 * 16 * 4);
    assert!(frame.chunks_exact(4).all(|px| px == [0, 0, 255, 255]));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn long_streams_span_several_chunks() {
    let server = server().await;
    let addr = server.local_addr();

    let retval = blocking(move || {
        let mut client = connect(addr);
        // 400 five-word commands: four FifoUpload chunks.
        for i in 0..400 {
            client
                .call(&Command::Viewport { x: 0, y: 0, width: i, height: i })
                .unwrap();
        }
        client
            .call_for_retval(&Command::GetIntegerv { pname: gl::VIEWPORT })
            .unwrap()
    })
    .await;

    assert_eq!(&retval.vector[..4], &[0, 0, 399, 399]);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_streams_close_the_connection() {
    let server = server().await;
    let addr = server.local_addr();

    blocking(move || {
        let mut client = connect(addr);
        let err = client
            .transport_mut()
            .submit(&[0xEE, 0xEE, 0, 0])
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected));

        // Others are unaffected.
        let mut other = connect(addr);
        other.call_for_retval(&Command::GetError {}).unwrap();
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_chunks_drop_the_client() {
    let server = server().await;
    let addr = server.local_addr();

    blocking(move || {
        let mut tcp = TcpStream::connect(addr).unwrap();
        tcp.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut greeting = vec![0u8; Connect::SIZE];
        tcp.read_exact(&mut greeting).unwrap();
        let connect = Connect::decode(&greeting).unwrap();

        let mut chunk = FifoUpload {
            client_id: connect.client_id + 7,
            index: 0,
            expected_chunks: 1,
            commands: vec![0],
        };
        tcp.write_all(&chunk.encode()).unwrap();

        let mut reply = vec![0u8; Retval::SIZE];
        let err = tcp.read_exact(&mut reply).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        chunk.client_id = connect.client_id;
        // The stream is gone for good.
        let _ = tcp.write_all(&chunk.encode());
    })
    .await;

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn return_registers_are_per_client() {
    let server = server().await;
    let addr = server.local_addr();

    let (first, second) = blocking(move || {
        let mut a = connect(addr);
        let mut b = connect(addr);
        let first = a
            .call_for_retval(&Command::GetString { name: gl::RENDERER })
            .unwrap();
        let second = b.call_for_retval(&Command::Flush {}).unwrap();
        a.goodbye().unwrap();
        b.goodbye().unwrap();
        (first, second)
    })
    .await;

    assert_eq!(first.string(), "sgl software rasterizer");
    assert_eq!(second, Retval::default());
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_swap_format_keeps_the_client() {
    let server = server().await;
    let addr = server.local_addr();

    blocking(move || {
        let transport = NetTransport::connect(addr, Duration::from_millis(300)).unwrap();
        let mut client = Client::new(transport);
        client.report_dimensions(8, 8).unwrap();
        client.swap_buffers(8, 8, false, 0x1907).unwrap();
        assert!(!client.transport().is_closed());

        let version = client
            .call_for_retval(&Command::GetIntegerv { pname: gl::MAJOR_VERSION })
            .unwrap();
        assert_eq!(version.value, 3);
        client.goodbye().unwrap();
    })
    .await;

    server.shutdown().await;
}
