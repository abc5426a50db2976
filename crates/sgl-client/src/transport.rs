use sgl_protocol::{ClientId, PushBuffer, RegisterFile, Retval};

use crate::error::TransportError;

/// Parameters of one `swap_buffers` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapParams {
    pub width: u32,
    pub height: u32,
    pub vflip: bool,
    pub format: u32,
}

/// Moves a finished command stream to the server and brings results back.
///
/// Every blocking step is bounded by the transport's timeout.
pub trait Transport {
    fn client_id(&self) -> ClientId;

    /// GL version the server's contexts provide.
    fn gl_version(&self) -> (u32, u32);

    /// Largest stream, sentinel included, one submit can carry.
    fn capacity(&self) -> usize;

    /// Delivers `stream` (terminated by the sentinel) and waits for its return values.
    fn submit(&mut self, stream: &[u8]) -> Result<Retval, TransportError>;

    /// Delivers a stream ending in a goodbye. No reply is awaited and the transport is
    /// closed afterwards.
    fn goodbye(&mut self, stream: &[u8]) -> Result<(), TransportError>;

    /// Flushes `pending` and brings the current frame into [`Transport::framebuffer`].
    /// `pending` is empty afterwards.
    fn swap_buffers(
        &mut self,
        pending: &mut PushBuffer,
        params: SwapParams,
    ) -> Result<(), TransportError>;

    /// Bytes of the last frame, bottom-up rows, 4 bytes per pixel.
    fn framebuffer(&mut self) -> &[u8];

    /// Address of the framebuffer for a presentation layer. Valid until the next call
    /// on this transport.
    fn framebuffer_address(&self) -> *const u8;

    fn registers(&self) -> &dyn RegisterFile;

    fn is_closed(&self) -> bool;
}
