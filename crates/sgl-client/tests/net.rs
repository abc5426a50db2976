#![cfg(not(target_arch = "wasm32"))]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use sgl_client::{NetTransport, Transport, TransportError};
use sgl_protocol::{Command, Connect, FifoUpload, Packet, PushBuffer, Retval, SCHEMA_VERSION};

fn stream(cmd: &Command) -> Vec<u8> {
    let mut buf = PushBuffer::new();
    buf.push_command(cmd);
    buf.finish();
    buf.as_bytes().to_vec()
}

#[test]
fn late_reply_closes_the_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut tcp, _) = listener.accept().unwrap();
        let connect = Connect {
            client_id: 1,
            fb_size: 4096,
            fifo_size: 4096,
            gl_major: 3,
            gl_minor: 3,
            schema_version: SCHEMA_VERSION,
        };
        tcp.write_all(&connect.encode()).unwrap();

        let mut chunk = vec![0u8; FifoUpload::SIZE];
        tcp.read_exact(&mut chunk).unwrap();
        thread::sleep(Duration::from_millis(300));
        // Arrives after the client stopped waiting.
        let _ = tcp.write_all(&Retval::scalar(111).encode());

        // Anything further means the client reused the stream.
        let mut rest = Vec::new();
        let _ = tcp.read_to_end(&mut rest);
        rest.len()
    });

    let mut transport = NetTransport::connect(addr, Duration::from_millis(100)).unwrap();
    let err = transport.submit(&stream(&Command::GetError {})).unwrap_err();
    assert!(err.is_timeout());
    assert!(transport.is_closed());

    assert!(matches!(
        transport.submit(&stream(&Command::Finish {})),
        Err(TransportError::Closed)
    ));
    drop(transport);
    assert_eq!(server.join().unwrap(), 0);
}

#[test]
fn closed_connection_reports_a_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut tcp, _) = listener.accept().unwrap();
        let connect = Connect {
            client_id: 4,
            fb_size: 4096,
            fifo_size: 4096,
            gl_major: 3,
            gl_minor: 3,
            schema_version: SCHEMA_VERSION,
        };
        tcp.write_all(&connect.encode()).unwrap();
        let mut chunk = vec![0u8; FifoUpload::SIZE];
        tcp.read_exact(&mut chunk).unwrap();
    });

    let mut transport = NetTransport::connect(addr, Duration::from_secs(5)).unwrap();
    assert_eq!(transport.client_id().0, 4);
    let err = transport.submit(&stream(&Command::GetError {})).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, TransportError::Rejected));
    assert!(transport.is_closed());
}
