//! Shared-memory server loop.
//!
//! Polls `CONNECT` and `SUBMIT` on every iteration. A non-zero `CONNECT` creates the
//! connection and is cleared as the acknowledgement. A pending `SUBMIT` is claimed
//! (`RUNNING`), the FIFO runs for the client named by `READY_HINT`, then `SUBMIT` becomes
//! `IDLE` (done) or `REJECTED` (stream rejected, connection dropped). A submitter that
//! gave up marks the stream `ABANDONED`; its connection is dropped and the FIFO cleared
//! before anyone else may use it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sgl_protocol::registers::submit_state;
use sgl_protocol::{ClientId, Register, RegisterFile};
use sgl_shm::{Backoff, SharedRegion, ShmLayout, ShmRegisters};

use crate::backend::GlBackend;
use crate::dispatcher::{DispatchSink, Dispatcher, StreamOutcome};
use crate::error::{DispatchError, ServerError};

/// Register file and framebuffer area of the region.
#[derive(Debug)]
struct RegionSink {
    regs: ShmRegisters,
    layout: ShmLayout,
}

impl DispatchSink for RegionSink {
    fn registers(&mut self) -> &mut dyn RegisterFile {
        &mut self.regs
    }

    fn write_framebuffer(&mut self, pixels: &[u8]) -> Result<(), DispatchError> {
        let capacity = self.layout.framebuffer_size();
        if pixels.len() > capacity {
            return Err(DispatchError::FramebufferOverflow {
                len: pixels.len(),
                capacity,
            });
        }
        self.regs
            .region()
            .write_bytes(self.layout.framebuffer_start(), pixels)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct ShmServer<B: GlBackend> {
    sink: RegionSink,
    dispatcher: Dispatcher<B>,
    stream: Vec<u8>,
}

impl<B: GlBackend> ShmServer<B> {
    /// Initializes `region` with `layout` and serves it.
    pub fn new(
        region: Arc<SharedRegion>,
        layout: ShmLayout,
        backend: B,
        gl_version: (u32, u32),
    ) -> Result<Self, ServerError> {
        layout.initialize(&region, gl_version.0, gl_version.1)?;
        tracing::info!(
            memsize = layout.memsize(),
            fifo_size = layout.fifo_size(),
            framebuffer_size = layout.framebuffer_size(),
            "shared memory region ready"
        );
        Ok(Self {
            sink: RegionSink {
                regs: ShmRegisters::new(region),
                layout,
            },
            dispatcher: Dispatcher::new(backend, gl_version)
                .with_frame_limit(layout.framebuffer_size()),
            stream: Vec::with_capacity(layout.fifo_size()),
        })
    }

    /// Creates the named POSIX region and serves it. The object is unlinked when the
    /// server is dropped.
    pub fn create(
        name: &str,
        layout: ShmLayout,
        backend: B,
        gl_version: (u32, u32),
    ) -> Result<Self, ServerError> {
        let region = SharedRegion::create(name, layout.memsize())?;
        tracing::info!(name, "created shared memory object");
        Self::new(Arc::new(region), layout, backend, gl_version)
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        self.sink.regs.region()
    }

    pub fn layout(&self) -> &ShmLayout {
        &self.sink.layout
    }

    pub fn dispatcher(&self) -> &Dispatcher<B> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<B> {
        &mut self.dispatcher
    }

    /// Handles a pending connect and a pending submit. Returns whether there was work.
    pub fn poll_once(&mut self) -> Result<bool, ServerError> {
        let mut worked = false;

        let connect = self.sink.regs.load(Register::Connect);
        if connect != 0 {
            let id = ClientId(connect);
            if let Err(err) = self.dispatcher.connect(id) {
                tracing::warn!(client = %id, %err, "failed to set up connection");
            }
            self.sink.regs.store(Register::Connect, 0);
            worked = true;
        }

        match self.sink.regs.load(Register::Submit) {
            submit_state::PENDING => {
                let claimed = self
                    .sink
                    .regs
                    .compare_exchange(Register::Submit, submit_state::PENDING, submit_state::RUNNING)
                    .is_ok();
                if claimed {
                    let id = ClientId(self.sink.regs.load(Register::ReadyHint));
                    let state = self.serve(id)?;
                    let published = self
                        .sink
                        .regs
                        .compare_exchange(Register::Submit, submit_state::RUNNING, state)
                        .is_ok();
                    if !published {
                        self.discard_abandoned(id)?;
                    }
                }
                worked = true;
            }
            submit_state::ABANDONED => {
                let id = ClientId(self.sink.regs.load(Register::ReadyHint));
                self.discard_abandoned(id)?;
                worked = true;
            }
            _ => {}
        }

        Ok(worked)
    }

    /// Serves until `stop` is set, then destroys every connection.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ServerError> {
        let mut backoff = Backoff::new();
        while !stop.load(Ordering::Acquire) {
            if self.poll_once()? {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        tracing::info!(clients = self.dispatcher.registry().len(), "shutting down");
        self.dispatcher.shutdown();
        Ok(())
    }

    /// Runs the FIFO for `id` and returns the value to store in `SUBMIT`.
    fn serve(&mut self, id: ClientId) -> Result<u32, ServerError> {
        let fifo = self.sink.layout.fifo();
        self.stream.resize(fifo.len(), 0);
        self.sink
            .regs
            .region()
            .read_bytes(fifo.start, &mut self.stream)?;

        match self
            .dispatcher
            .execute_stream(id, &self.stream, &mut self.sink)
        {
            Ok(StreamOutcome::Completed(_)) => Ok(submit_state::IDLE),
            Ok(StreamOutcome::Goodbye(target)) => {
                tracing::debug!(client = %id, %target, "goodbye");
                self.zero_fifo()?;
                Ok(submit_state::IDLE)
            }
            Err(err) => {
                tracing::warn!(client = %id, %err, "rejecting command stream");
                self.dispatcher.disconnect(id);
                self.zero_fifo()?;
                Ok(submit_state::REJECTED)
            }
        }
    }

    fn discard_abandoned(&mut self, id: ClientId) -> Result<(), ServerError> {
        tracing::warn!(client = %id, "submitter gave up on its stream; dropping the connection");
        self.dispatcher.disconnect(id);
        self.zero_fifo()?;
        self.sink.regs.store(Register::Submit, submit_state::IDLE);
        Ok(())
    }

    fn zero_fifo(&self) -> Result<(), ServerError> {
        let fifo = self.sink.layout.fifo();
        self.sink.regs.region().fill(fifo.start, fifo.len(), 0)?;
        Ok(())
    }
}
