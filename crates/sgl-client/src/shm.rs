//! Shared-memory transport.
//!
//! Handshake, all under the `LOCK` register:
//! - attach: `id = CLAIM_ID + 1`, publish it in `CLAIM_ID` and `CONNECT`, wait for the
//!   server to clear `CONNECT`.
//! - submit: `READY_HINT = id`, copy the stream into the FIFO, `SUBMIT = 1`, wait for
//!   `SUBMIT` to leave 1, snapshot `RETVAL`/`RETVAL_V`.
//!
//! The lock is held for the whole submit so streams of different clients never share
//! the FIFO.

use std::sync::Arc;
use std::time::Duration;

use sgl_protocol::chunking::frame_bytes;
use sgl_protocol::registers::{submit_state, COMMAND_START};
use sgl_protocol::{ClientId, Command, PushBuffer, Register, RegisterFile, Retval};
use sgl_shm::{wait_until, SharedRegion, ShmError, ShmLayout, ShmRegisters, SpinGuard};

use crate::error::TransportError;
use crate::transport::{SwapParams, Transport};

#[derive(Debug)]
pub struct ShmTransport {
    regs: ShmRegisters,
    layout: ShmLayout,
    id: ClientId,
    gl_version: (u32, u32),
    timeout: Duration,
    frame: Vec<u8>,
    closed: bool,
}

impl ShmTransport {
    /// Opens the named region and attaches to the server behind it.
    pub fn open(name: &str, timeout: Duration) -> Result<Self, TransportError> {
        let region = SharedRegion::open(name)?;
        Self::attach(Arc::new(region), timeout)
    }

    pub fn attach(region: Arc<SharedRegion>, timeout: Duration) -> Result<Self, TransportError> {
        let layout = ShmLayout::discover(&region)?;
        let regs = ShmRegisters::new(region);

        let id = {
            let _guard = lock(&regs, timeout, "the shared memory lock")?;
            let id = regs.load(Register::ClaimId).wrapping_add(1).max(1);
            regs.store(Register::ClaimId, id);
            regs.store(Register::Connect, id);

            let acked = wait_until(Some(timeout), || regs.load(Register::Connect) == 0);
            if !acked {
                regs.store(Register::Connect, 0);
                return Err(ShmError::Timeout {
                    what: "the server to accept the connection",
                    waited: timeout,
                }
                .into());
            }
            ClientId(id)
        };

        let gl_version = (regs.load(Register::GlMajor), regs.load(Register::GlMinor));
        tracing::debug!(client = %id, ?gl_version, "attached over shared memory");
        Ok(Self {
            regs,
            layout,
            id,
            gl_version,
            timeout,
            frame: Vec::new(),
            closed: false,
        })
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.layout
    }

    fn deliver(&mut self, stream: &[u8]) -> Result<Retval, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if stream.len() > self.layout.fifo_size() {
            return Err(TransportError::FifoOverflow {
                len: stream.len(),
                capacity: self.layout.fifo_size(),
            });
        }

        let lock_regs = self.regs.clone();
        let _guard = lock(&lock_regs, self.timeout, "the shared memory lock")?;
        let regs = &self.regs;
        // A stream abandoned by an earlier submitter may still occupy the FIFO.
        if !wait_until(Some(self.timeout), || {
            !submit_state::in_flight(regs.load(Register::Submit))
        }) {
            return Err(ShmError::Timeout {
                what: "the server to release the FIFO",
                waited: self.timeout,
            }
            .into());
        }

        self.regs.store(Register::ReadyHint, self.id.0);
        self.regs.region().write_bytes(COMMAND_START, stream)?;
        self.regs.store(Register::Submit, submit_state::PENDING);

        let regs = &self.regs;
        let done = wait_until(Some(self.timeout), || {
            !matches!(
                regs.load(Register::Submit),
                submit_state::PENDING | submit_state::RUNNING
            )
        });
        if !done && self.abandon() {
            return Err(ShmError::Timeout {
                what: "the server to execute the command stream",
                waited: self.timeout,
            }
            .into());
        }

        if self.regs.load(Register::Submit) == submit_state::REJECTED {
            self.regs.store(Register::Submit, submit_state::IDLE);
            self.closed = true;
            return Err(TransportError::Rejected);
        }
        Ok(self.regs.retval()?)
    }
}

impl ShmTransport {
    /// Marks the in-flight stream abandoned and closes the transport. Returns false if
    /// the server finished the stream in the meantime.
    fn abandon(&mut self) -> bool {
        let marked = self
            .regs
            .fetch_update(Register::Submit, |state| {
                matches!(state, submit_state::PENDING | submit_state::RUNNING)
                    .then_some(submit_state::ABANDONED)
            })
            .is_ok();
        if marked {
            tracing::warn!(client = %self.id, "gave up waiting for the server; closing");
            self.closed = true;
        }
        marked
    }
}

fn lock<'a>(
    regs: &'a ShmRegisters,
    timeout: Duration,
    what: &'static str,
) -> Result<SpinGuard<'a>, ShmError> {
    regs.lock()
        .try_lock_for(timeout)
        .ok_or(ShmError::Timeout {
            what,
            waited: timeout,
        })
}

impl Transport for ShmTransport {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn gl_version(&self) -> (u32, u32) {
        self.gl_version
    }

    fn capacity(&self) -> usize {
        self.layout.fifo_size()
    }

    fn submit(&mut self, stream: &[u8]) -> Result<Retval, TransportError> {
        self.deliver(stream)
    }

    fn goodbye(&mut self, stream: &[u8]) -> Result<(), TransportError> {
        let res = self.deliver(stream).map(drop);
        self.closed = true;
        res
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
        let res = self.deliver(pending.as_bytes());
        pending.reset();
        res?;

        let len = frame_bytes(params.width, params.height).min(self.layout.framebuffer_size());
        self.frame.resize(len, 0);
        self.regs
            .region()
            .read_bytes(self.layout.framebuffer_start(), &mut self.frame)?;
        Ok(())
    }

    fn framebuffer(&mut self) -> &[u8] {
        &self.frame
    }

    fn framebuffer_address(&self) -> *const u8 {
        self.regs
            .region()
            .address_of(self.layout.framebuffer_start())
            .unwrap_or(core::ptr::null())
    }

    fn registers(&self) -> &dyn RegisterFile {
        &self.regs
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
