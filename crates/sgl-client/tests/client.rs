use pretty_assertions::assert_eq;
use sgl_client::{Client, ClientError, SwapParams, Transport, TransportError};
use sgl_protocol::{
    ClientId, Command, CommandReader, Payload, PushBuffer, RegisterFile, RegisterMirror, Retval,
};

/// Records every stream instead of sending it anywhere.
#[derive(Default)]
struct Recorder {
    capacity: usize,
    streams: Vec<Vec<Command>>,
    goodbyes: usize,
    fail_next: bool,
    mirror: RegisterMirror,
    frame: Vec<u8>,
}

impl Recorder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    fn record(&mut self, stream: &[u8]) {
        assert_eq!(stream.len() % 4, 0);
        assert!(stream.len() <= self.capacity, "stream over capacity");
        let cmds = CommandReader::new(stream).collect_commands().unwrap();
        self.streams.push(cmds);
    }
}

impl Transport for Recorder {
    fn client_id(&self) -> ClientId {
        ClientId(3)
    }

    fn gl_version(&self) -> (u32, u32) {
        (3, 3)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn submit(&mut self, stream: &[u8]) -> Result<Retval, TransportError> {
        if std::mem::take(&mut self.fail_next) {
            return Err(TransportError::Rejected);
        }
        self.record(stream);
        Ok(Retval::scalar(self.streams.len() as u64))
    }

    fn goodbye(&mut self, stream: &[u8]) -> Result<(), TransportError> {
        self.record(stream);
        self.goodbyes += 1;
        Ok(())
    }

    fn swap_buffers(
        &mut self,
        pending: &mut PushBuffer,
        params: SwapParams,
    ) -> Result<(), TransportError> {
        pending.push_command(&Command::RequestFramebuffer {
            width: params.width,
            height: params.height,
            vflip: params.vflip as u32,
            format: params.format,
        });
        pending.finish();
        self.record(pending.as_bytes());
        pending.reset();
        self.frame = vec![0xAB; (params.width * params.height * 4) as usize];
        Ok(())
    }

    fn framebuffer(&mut self) -> &[u8] {
        &self.frame
    }

    fn framebuffer_address(&self) -> *const u8 {
        self.frame.as_ptr()
    }

    fn registers(&self) -> &dyn RegisterFile {
        &self.mirror
    }

    fn is_closed(&self) -> bool {
        self.goodbyes > 0
    }
}

#[test]
fn commands_accumulate_until_a_reply_is_needed() {
    let mut client = Client::new(Recorder::with_capacity(4096));
    client.call(&Command::Clear { mask: 0x4100 }).unwrap();
    client
        .call(&Command::Viewport {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        })
        .unwrap();
    assert!(client.transport().streams.is_empty());

    let retval = client.call_for_retval(&Command::GetError {}).unwrap();
    assert_eq!(retval.value, 1);
    assert_eq!(client.pending_bytes(), 0);
    assert_eq!(
        client.transport().streams,
        vec![vec![
            Command::Clear { mask: 0x4100 },
            Command::Viewport {
                x: 0,
                y: 0,
                width: 640,
                height: 480
            },
            Command::GetError {},
        ]]
    );
}

#[test]
fn full_buffer_flushes_before_appending() {
    // Each Clear is 8 bytes; 4 of them plus the sentinel fill 36 bytes.
    let mut client = Client::new(Recorder::with_capacity(36));
    for mask in 0..5 {
        client.call(&Command::Clear { mask }).unwrap();
    }
    assert_eq!(client.transport().streams.len(), 1);
    assert_eq!(client.transport().streams[0].len(), 4);
    assert_eq!(client.pending_bytes(), 8);

    client.submit().unwrap();
    assert_eq!(
        client.transport().streams[1],
        vec![Command::Clear { mask: 4 }]
    );
}

#[test]
fn oversized_command_is_refused() {
    let mut client = Client::new(Recorder::with_capacity(64));
    let err = client
        .call_with_upload(&[0u8; 100], &Command::ShaderSource { shader: 1 })
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::CommandTooLarge { capacity: 64, .. }
    ));
    assert_eq!(client.pending_bytes(), 0);
}

#[test]
fn upload_travels_with_its_consumer() {
    // Three clears fill 24 bytes; the upload pair needs 32 more plus the sentinel.
    let mut client = Client::new(Recorder::with_capacity(48));
    client.call(&Command::Clear { mask: 1 }).unwrap();
    client.call(&Command::Clear { mask: 2 }).unwrap();
    client.call(&Command::Clear { mask: 3 }).unwrap();
    client
        .call_with_upload(b"void main(){}", &Command::ShaderSource { shader: 9 })
        .unwrap();
    client.submit().unwrap();

    let streams = &client.transport().streams;
    assert_eq!(streams.len(), 2);
    assert_eq!(
        streams[1],
        vec![
            Command::Upload {
                data: Payload(b"void main(){}".to_vec())
            },
            Command::ShaderSource { shader: 9 },
        ]
    );
}

#[test]
fn failed_submit_still_resets_the_buffer() {
    let mut client = Client::new(Recorder::with_capacity(256));
    client.call(&Command::Flush {}).unwrap();
    client.transport_mut().fail_next = true;
    assert!(matches!(
        client.submit(),
        Err(ClientError::Transport(TransportError::Rejected))
    ));
    assert_eq!(client.pending_bytes(), 0);
}

#[test]
fn goodbye_carries_own_id_and_swap_requests_framebuffer() {
    let mut client = Client::new(Recorder::with_capacity(256));
    client.call(&Command::Finish {}).unwrap();
    client.swap_buffers(2, 2, true, 0x1908).unwrap();
    assert_eq!(client.framebuffer(), &[0xAB; 16][..]);

    client.goodbye().unwrap();
    let streams = &client.transport().streams;
    assert_eq!(
        streams[0],
        vec![
            Command::Finish {},
            Command::RequestFramebuffer {
                width: 2,
                height: 2,
                vflip: 1,
                format: 0x1908
            },
        ]
    );
    assert_eq!(streams[1], vec![Command::Goodbye { client_id: 3 }]);
    assert!(client.transport().is_closed());
}
