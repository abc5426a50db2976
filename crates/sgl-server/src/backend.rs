//! The seam between the dispatcher and a real GL implementation.

use sgl_protocol::Command;

use crate::error::BackendError;

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reply {
    #[default]
    None,
    /// Written to `RETVAL`.
    Scalar(u64),
    /// Written to `RETVAL_V`, at most 64 words.
    Vector(Vec<u32>),
}

/// Pixel layout requested by `RequestFramebuffer` / `SwapRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackRequest {
    pub width: u32,
    pub height: u32,
    /// Flip rows so the first row in memory is the top of the image.
    pub vflip: bool,
    /// GL pixel format (`GL_RGBA` or `GL_BGRA`).
    pub format: u32,
}

/// A GL driver plus whatever window system provides its contexts.
///
/// All methods are called from one thread. Implementations own every context they
/// hand out; the dispatcher only passes them back.
pub trait GlBackend {
    type Context;

    fn create_context(&mut self, version: (u32, u32)) -> Result<Self::Context, BackendError>;

    fn destroy_context(&mut self, ctx: Self::Context);

    /// Binds `ctx` to the calling thread, or unbinds when `None`.
    fn make_current(&mut self, ctx: Option<&mut Self::Context>) -> Result<(), BackendError>;

    /// Executes one GL command. `upload` is the pending blob for commands that consume
    /// one; `None` stands for a null pointer.
    fn execute(
        &mut self,
        ctx: &mut Self::Context,
        cmd: &Command,
        upload: Option<&[u8]>,
    ) -> Result<Reply, BackendError>;

    /// Resizes the drawable behind `ctx`.
    fn resize(&mut self, ctx: &mut Self::Context, width: u32, height: u32)
        -> Result<(), BackendError>;

    /// Reads the current frame: `width * height * 4` bytes.
    fn read_pixels(
        &mut self,
        ctx: &mut Self::Context,
        request: ReadbackRequest,
    ) -> Result<Vec<u8>, BackendError>;

    /// Blocks until all issued GL work for `ctx` completed.
    fn finish(&mut self, ctx: &mut Self::Context) -> Result<(), BackendError>;

    /// Returns and clears the GL error flag (`glGetError`).
    fn get_error(&mut self, ctx: &mut Self::Context) -> u32;
}
