use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use sgl_client::{Client, ClientError, ShmTransport, Transport, TransportError};
use sgl_protocol::registers::{offset, submit_state, COMMAND_START};
use sgl_protocol::Command;
use sgl_server::{gl, ShmServer, SoftwareBackend};
use sgl_shm::{SharedRegion, ShmLayout};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    region: Arc<SharedRegion>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<u64>>,
}

impl Running {
    fn start() -> Self {
        let layout = ShmLayout::new(0x20_0000, 0x1_0000).unwrap();
        let region = Arc::new(SharedRegion::heap(layout.memsize()));
        let stop = Arc::new(AtomicBool::new(false));

        let mut server =
            ShmServer::new(region.clone(), layout, SoftwareBackend::new(), (3, 3)).unwrap();
        let thread = {
            let stop = stop.clone();
            thread::spawn(move || {
                server.run(&stop).unwrap();
                assert_eq!(server.dispatcher().backend().live_contexts(), 0);
                server.dispatcher().backend().contexts_created()
            })
        };
        Self {
            region,
            stop,
            thread: Some(thread),
        }
    }

    fn client(&self) -> Client<ShmTransport> {
        Client::new(ShmTransport::attach(self.region.clone(), TIMEOUT).unwrap())
    }

    /// Stops the server and returns how many contexts it created.
    fn stop(mut self) -> u64 {
        self.stop.store(true, Ordering::Release);
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[test]
fn clear_and_read_back_a_frame() {
    let server = Running::start();
    let mut client = server.client();
    assert_eq!(client.transport().gl_version(), (3, 3));

    client.report_dimensions(8, 4).unwrap();
    client
        .call(&Command::ClearColor { r: 0.0, g: 0.0, b: 1.0, a: 1.0 })
        .unwrap();
    client.call(&Command::Clear { mask: 0x4100 }).unwrap();
    client.swap_buffers(8, 4, false, gl::RGBA).unwrap();

    let frame = client.framebuffer().to_vec();
    assert_eq!(frame.len(), 8 * 4 * 4);
    assert!(frame.chunks_exact(4).all(|px| px == [0, 0, 255, 255]));

    client.goodbye().unwrap();
    assert!(client.transport().is_closed());
    assert_eq!(server.stop(), 1);
}

#[test]
fn queries_come_back_through_retval() {
    let server = Running::start();
    let mut client = server.client();

    let retval = client
        .call_for_retval(&Command::GetString { name: gl::RENDERER })
        .unwrap();
    assert_eq!(retval.string(), "sgl software rasterizer");

    let names = client
        .call_for_retval(&Command::GenTextures { count: 3 })
        .unwrap();
    assert_eq!(&names.vector[..3], &[1, 2, 3]);

    let mut create = |kind| {
        client
            .call_for_retval(&Command::CreateShader { kind })
            .unwrap()
            .value as u32
    };
    let vs = create(gl::VERTEX_SHADER);
    let fs = create(gl::FRAGMENT_SHADER);
    client
        .call_with_upload(b"void main() {}", &Command::ShaderSource { shader: vs })
        .unwrap();
    client
        .call_with_upload(
            b"uniform vec4 tint;\nvoid main() {}",
            &Command::ShaderSource { shader: fs },
        )
        .unwrap();
    client.call(&Command::CompileShader { shader: vs }).unwrap();
    client.call(&Command::CompileShader { shader: fs }).unwrap();
    let program = client
        .call_for_retval(&Command::CreateProgram {})
        .unwrap()
        .value as u32;
    for shader in [vs, fs] {
        client
            .call(&Command::AttachShader { program, shader })
            .unwrap();
    }
    client.call(&Command::LinkProgram { program }).unwrap();
    client.call(&Command::UseProgram { program }).unwrap();
    client
        .call_with_upload(b"tint", &Command::GetUniformLocation { program })
        .unwrap();
    assert_eq!(client.submit().unwrap().value, 0);

    client.goodbye().unwrap();
}

#[test]
fn two_clients_get_distinct_ids() {
    let server = Running::start();
    let mut a = server.client();
    let mut b = server.client();
    assert_ne!(a.transport().client_id(), b.transport().client_id());

    a.call(&Command::Enable { cap: gl::SCISSOR_TEST }).unwrap();
    a.submit().unwrap();
    let on = b
        .call_for_retval(&Command::GetIntegerv { pname: gl::SCISSOR_TEST })
        .unwrap();
    // Contexts are per client.
    assert_eq!(on.value, 0);

    a.goodbye().unwrap();
    b.goodbye().unwrap();
    assert_eq!(server.stop(), 2);
}

#[test]
fn undecodable_streams_are_rejected() {
    let server = Running::start();
    let mut client = server.client();

    let err = client
        .transport_mut()
        .submit(&[0xEE, 0xEE, 0, 0])
        .unwrap_err();
    assert!(matches!(err, TransportError::Rejected));
    assert!(client.transport().is_closed());
    assert_eq!(
        server.region.atomic_u32(offset::SUBMIT).load(Ordering::Acquire),
        submit_state::IDLE
    );

    let err = client.submit().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Closed)
    ));

    // The server keeps serving others.
    let mut other = server.client();
    other.call_for_retval(&Command::GetError {}).unwrap();
    other.goodbye().unwrap();
    assert_eq!(server.stop(), 2);
}

#[test]
fn gl_level_failures_keep_the_connection() {
    let server = Running::start();
    let mut client = server.client();

    // Unsupported readback format, then a drawable beyond the size limit.
    client.swap_buffers(4, 4, false, 0x1907).unwrap();
    client.report_dimensions(5000, 2000).unwrap();
    client.submit().unwrap();
    // Larger than the framebuffer area.
    client.swap_buffers(65535, 65535, false, gl::RGBA).unwrap();
    assert!(!client.transport().is_closed());

    let viewport = client
        .call_for_retval(&Command::GetIntegerv { pname: gl::VIEWPORT })
        .unwrap();
    assert_eq!(&viewport.vector[..4], &[0, 0, 640, 480]);

    client.goodbye().unwrap();
    assert_eq!(server.stop(), 1);
}

#[test]
fn concurrent_submitters_each_get_their_own_replies() {
    let server = Running::start();
    let workers: Vec<_> = (1..=4i32)
        .map(|n| {
            let mut client = server.client();
            thread::spawn(move || {
                for round in 0..50 {
                    let size = n * 100 + round;
                    client
                        .call(&Command::Viewport { x: 0, y: 0, width: size, height: n })
                        .unwrap();
                    client.submit().unwrap();
                    let viewport = client
                        .call_for_retval(&Command::GetIntegerv { pname: gl::VIEWPORT })
                        .unwrap();
                    assert_eq!(&viewport.vector[..4], &[0, 0, size as u32, n as u32]);
                }
                client.goodbye().unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(server.stop(), 4);
}

#[test]
fn goodbye_clears_the_fifo() {
    let server = Running::start();
    let mut client = server.client();
    client
        .call_with_upload(&[0x5A; 256], &Command::ShaderSource { shader: 1 })
        .unwrap();
    client.submit().unwrap();

    let mut fifo = [0xFFu8; 512];
    server.region.read_bytes(COMMAND_START, &mut fifo).unwrap();
    assert!(fifo.iter().any(|b| *b == 0x5A));

    client.goodbye().unwrap();
    server.region.read_bytes(COMMAND_START, &mut fifo).unwrap();
    assert!(fifo.iter().all(|b| *b == 0));
    assert_eq!(server.stop(), 1);
}
