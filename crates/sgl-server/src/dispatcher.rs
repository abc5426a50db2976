//! Command dispatcher.
//!
//! Decodes one client's submitted stream and executes it against that client's
//! context. Bookkeeping opcodes (context management, uploads, framebuffer requests)
//! are handled here; everything else goes to the [`GlBackend`].

use core::fmt;

use sgl_protocol::registers::RETVAL_V_WORDS;
use sgl_protocol::{ClientId, Command, CommandReader, Opcode, Register, RegisterFile, Retval};

use crate::backend::{GlBackend, ReadbackRequest, Reply};
use crate::error::DispatchError;
use crate::gl;
use crate::registry::{Connection, ConnectionRegistry};

/// Where a stream's side effects land: the register file and the framebuffer area.
pub trait DispatchSink {
    fn registers(&mut self) -> &mut dyn RegisterFile;

    /// Stores pixels produced by `RequestFramebuffer`.
    fn write_framebuffer(&mut self, pixels: &[u8]) -> Result<(), DispatchError>;
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Reached the sentinel. Carries the last scalar/vector reply of the stream.
    Completed(Retval),
    /// A `Goodbye` destroyed this connection; the rest of the stream was skipped.
    Goodbye(ClientId),
}

pub struct Dispatcher<B: GlBackend> {
    backend: B,
    registry: ConnectionRegistry<B::Context>,
    gl_version: (u32, u32),
    frame_limit: usize,
}

impl<B: GlBackend> fmt::Debug for Dispatcher<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("gl_version", &self.gl_version)
            .field("frame_limit", &self.frame_limit)
            .field("clients", &self.registry.ids().collect::<Vec<_>>())
            .field("active", &self.registry.active())
            .finish_non_exhaustive()
    }
}

impl<B: GlBackend> Dispatcher<B> {
    /// `gl_version` is the version requested for every context this dispatcher creates.
    pub fn new(backend: B, gl_version: (u32, u32)) -> Self {
        Self {
            backend,
            registry: ConnectionRegistry::new(),
            gl_version,
            frame_limit: usize::MAX,
        }
    }

    /// Caps the bytes a single readback may produce. Larger requests read nothing.
    pub fn with_frame_limit(mut self, bytes: usize) -> Self {
        self.frame_limit = bytes;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn registry(&self) -> &ConnectionRegistry<B::Context> {
        &self.registry
    }

    pub fn gl_version(&self) -> (u32, u32) {
        self.gl_version
    }

    /// Creates the connection of `id`.
    pub fn connect(&mut self, id: ClientId) -> Result<(), DispatchError> {
        self.registry.add(&mut self.backend, id, self.gl_version)?;
        tracing::info!(client = %id, clients = self.registry.len(), "client connected");
        Ok(())
    }

    /// Destroys the connection of `id`; unknown ids are ignored.
    pub fn disconnect(&mut self, id: ClientId) -> bool {
        let removed = self.registry.remove(&mut self.backend, id);
        if removed {
            tracing::info!(client = %id, clients = self.registry.len(), "client disconnected");
        }
        removed
    }

    /// Executes `stream` on behalf of `id` up to its sentinel.
    ///
    /// Replies are written to `sink`'s registers as they are produced. A decode error
    /// aborts the stream; the caller decides what happens to the connection.
    pub fn execute_stream(
        &mut self,
        id: ClientId,
        stream: &[u8],
        sink: &mut dyn DispatchSink,
    ) -> Result<StreamOutcome, DispatchError> {
        if self.registry.current(&mut self.backend, id)?.is_none() {
            return Err(DispatchError::UnknownClient(id));
        }

        let mut reader = CommandReader::new(stream);
        let mut retval = Retval::default();
        let mut in_begin = false;

        loop {
            let offset = reader.position();
            let cmd = reader
                .next_command()
                .map_err(|source| DispatchError::Decode { client: id, source })?;
            let Some(cmd) = cmd else {
                break;
            };
            tracing::trace!(client = %id, offset, opcode = cmd.opcode().name(), "execute");

            match cmd {
                Command::Goodbye { client_id } => {
                    let target = ClientId(client_id);
                    self.disconnect(target);
                    return Ok(StreamOutcome::Goodbye(target));
                }
                Command::CreateContext {} => {
                    self.registry
                        .replace_context(&mut self.backend, id, self.gl_version)?;
                }
                Command::ReportDimensions { width, height } => {
                    let conn = connection(&mut self.registry, id)?;
                    conn.dimensions = Some((width, height));
                    self.backend.resize(&mut conn.context, width, height)?;
                    self.check_gl_error(id, cmd.opcode())?;
                }
                Command::RequestFramebuffer {
                    width,
                    height,
                    vflip,
                    format,
                } => {
                    let request = ReadbackRequest {
                        width,
                        height,
                        vflip: vflip != 0,
                        format,
                    };
                    let pixels = self.read_frame(id, request)?;
                    sink.write_framebuffer(&pixels)?;
                }
                Command::Upload { data } => {
                    let conn = connection(&mut self.registry, id)?;
                    conn.upload.stage(Some(data.into_inner()), false);
                }
                Command::UploadStay { data } => {
                    let conn = connection(&mut self.registry, id)?;
                    conn.upload.stage(Some(data.into_inner()), true);
                }
                Command::UploadNull {} => {
                    let conn = connection(&mut self.registry, id)?;
                    conn.upload.stage(None, false);
                }
                cmd => {
                    match cmd {
                        Command::Begin { .. } => in_begin = true,
                        Command::End {} => in_begin = false,
                        _ => {}
                    }
                    let reply = self.execute_gl(id, &cmd)?;
                    match reply {
                        Reply::None => {}
                        Reply::Scalar(value) => {
                            sink.registers().write64(Register::Retval, value)?;
                            retval.value = value;
                        }
                        Reply::Vector(words) => {
                            retval.vector = [0; RETVAL_V_WORDS];
                            for (slot, word) in retval.vector.iter_mut().zip(&words) {
                                *slot = *word;
                            }
                            sink.registers().write_vector(&retval.vector)?;
                        }
                    }
                    if !in_begin {
                        self.check_gl_error(id, cmd.opcode())?;
                    }
                }
            }
        }

        let conn = connection(&mut self.registry, id)?;
        self.backend.finish(&mut conn.context)?;
        Ok(StreamOutcome::Completed(retval))
    }

    /// Reads the current frame of `id`.
    pub fn read_frame(
        &mut self,
        id: ClientId,
        request: ReadbackRequest,
    ) -> Result<Vec<u8>, DispatchError> {
        let conn = self
            .registry
            .current(&mut self.backend, id)?
            .ok_or(DispatchError::UnknownClient(id))?;
        let bytes = u64::from(request.width) * u64::from(request.height) * 4;
        if bytes > self.frame_limit as u64 {
            tracing::warn!(
                client = %id,
                width = request.width,
                height = request.height,
                limit = self.frame_limit,
                "readback larger than the framebuffer area, skipped"
            );
            return Ok(Vec::new());
        }
        self.backend.finish(&mut conn.context)?;
        let pixels = self.backend.read_pixels(&mut conn.context, request)?;
        self.check_gl_error(id, Opcode::RequestFramebuffer)?;
        Ok(pixels)
    }

    /// Destroys every connection.
    pub fn shutdown(&mut self) {
        self.registry.clear(&mut self.backend);
    }

    fn execute_gl(&mut self, id: ClientId, cmd: &Command) -> Result<Reply, DispatchError> {
        let conn = connection(&mut self.registry, id)?;
        if !cmd.consumes_upload() {
            return Ok(self.backend.execute(&mut conn.context, cmd, None)?);
        }
        let upload = conn.upload.take();
        let reply = self
            .backend
            .execute(&mut conn.context, cmd, upload.as_deref());
        conn.upload.settle(upload);
        Ok(reply?)
    }

    fn check_gl_error(&mut self, id: ClientId, opcode: Opcode) -> Result<(), DispatchError> {
        let conn = connection(&mut self.registry, id)?;
        let error = self.backend.get_error(&mut conn.context);
        if error != gl::NO_ERROR {
            let code = format!("{error:#06x}");
            tracing::warn!(
                client = %id,
                opcode = opcode.name(),
                error = %code,
                "GL error"
            );
        }
        Ok(())
    }
}

fn connection<C>(
    registry: &mut ConnectionRegistry<C>,
    id: ClientId,
) -> Result<&mut Connection<C>, DispatchError> {
    registry.get_mut(id).ok_or(DispatchError::UnknownClient(id))
}

impl<B: GlBackend> Drop for Dispatcher<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
