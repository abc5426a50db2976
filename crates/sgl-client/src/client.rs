use sgl_protocol::{Command, Payload, PushBuffer, Retval};

use crate::error::ClientError;
use crate::transport::{SwapParams, Transport};

/// Sentinel word appended by [`PushBuffer::finish`].
const SENTINEL_BYTES: usize = 4;

/// Per-process client state: the push buffer and the transport that drains it.
///
/// API shims record calls with [`Client::call`] and friends; commands accumulate until
/// a call needs a reply, the buffer would overflow the server's FIFO, or the frame is
/// swapped.
#[derive(Debug)]
pub struct Client<T: Transport> {
    transport: T,
    buf: PushBuffer,
    scratch: PushBuffer,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        let capacity = transport.capacity();
        Self {
            transport,
            buf: PushBuffer::with_capacity(capacity.min(1 << 20)),
            scratch: PushBuffer::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Bytes recorded since the last submit.
    pub fn pending_bytes(&self) -> usize {
        self.buf.size()
    }

    /// Records one command.
    pub fn call(&mut self, cmd: &Command) -> Result<(), ClientError> {
        self.scratch.reset();
        self.scratch.push_command(cmd);
        self.append_scratch()
    }

    /// Records an upload of `data` immediately followed by `cmd`, which consumes it.
    pub fn call_with_upload(&mut self, data: &[u8], cmd: &Command) -> Result<(), ClientError> {
        self.scratch.reset();
        self.scratch.push_command(&Command::Upload {
            data: Payload(data.to_vec()),
        });
        self.scratch.push_command(cmd);
        self.append_scratch()
    }

    /// Records `cmd` and submits, returning the values it produced.
    pub fn call_for_retval(&mut self, cmd: &Command) -> Result<Retval, ClientError> {
        self.call(cmd)?;
        self.submit()
    }

    /// Convenience for the usual "tell the server the window size" call.
    pub fn report_dimensions(&mut self, width: u32, height: u32) -> Result<(), ClientError> {
        self.call(&Command::ReportDimensions { width, height })
    }

    /// Terminates the pending stream and hands it to the transport. The buffer is empty
    /// afterwards whether or not delivery succeeded.
    pub fn submit(&mut self) -> Result<Retval, ClientError> {
        self.buf.finish();
        let res = self.transport.submit(self.buf.as_bytes());
        self.buf.reset();
        Ok(res?)
    }

    /// Tells the server to destroy this client's context. The transport is closed
    /// afterwards.
    pub fn goodbye(&mut self) -> Result<(), ClientError> {
        let client_id = self.transport.client_id().0;
        self.buf.push_command(&Command::Goodbye { client_id });
        self.buf.finish();
        let res = self.transport.goodbye(self.buf.as_bytes());
        self.buf.reset();
        tracing::debug!(client = client_id, "said goodbye");
        Ok(res?)
    }

    pub fn swap_buffers(
        &mut self,
        width: u32,
        height: u32,
        vflip: bool,
        format: u32,
    ) -> Result<(), ClientError> {
        let params = SwapParams {
            width,
            height,
            vflip,
            format,
        };
        Ok(self.transport.swap_buffers(&mut self.buf, params)?)
    }

    /// Pixels of the last swapped frame.
    pub fn framebuffer(&mut self) -> &[u8] {
        self.transport.framebuffer()
    }

    pub fn framebuffer_address(&self) -> *const u8 {
        self.transport.framebuffer_address()
    }

    fn append_scratch(&mut self) -> Result<(), ClientError> {
        let capacity = self.transport.capacity();
        let size = self.scratch.size();
        if size + SENTINEL_BYTES > capacity {
            return Err(ClientError::CommandTooLarge { size, capacity });
        }
        if self.buf.size() + size + SENTINEL_BYTES > capacity {
            tracing::trace!(pending = self.buf.size(), "push buffer full, flushing");
            self.submit()?;
        }
        self.buf.push_bytes(self.scratch.as_bytes());
        Ok(())
    }
}
