//! Command schema.
//!
//! Every command is declared once in the [`command_schema!`] table below: its opcode,
//! its operands in wire order, and whether it consumes the pending upload. The
//! [`Opcode`] and [`Command`] types, the encoder ([`Command::encode`]) and the decoder
//! ([`crate::CommandReader::next_command`]) are all generated from that table, so the
//! two directions cannot drift apart.
//!
//! Wire form: one opcode word followed by the operand words. There is no per-command
//! length; the opcode determines the layout. Opcode `0` is the stream sentinel.

use crate::decode::{CommandReader, DecodeError};
use crate::push_buffer::PushBuffer;

/// A value that can appear as a command operand.
pub trait Operand: Sized {
    fn encode(&self, buf: &mut PushBuffer);
    fn decode(reader: &mut CommandReader<'_>) -> Result<Self, DecodeError>;
}

impl Operand for u32 {
    fn encode(&self, buf: &mut PushBuffer) {
        buf.push_word(*self);
    }

    fn decode(reader: &mut CommandReader<'_>) -> Result<Self, DecodeError> {
        reader.read_word()
    }
}

impl Operand for i32 {
    fn encode(&self, buf: &mut PushBuffer) {
        buf.push_word(*self as u32);
    }

    fn decode(reader: &mut CommandReader<'_>) -> Result<Self, DecodeError> {
        Ok(reader.read_word()? as i32)
    }
}

impl Operand for f32 {
    fn encode(&self, buf: &mut PushBuffer) {
        buf.push_float(*self);
    }

    fn decode(reader: &mut CommandReader<'_>) -> Result<Self, DecodeError> {
        reader.read_float()
    }
}

/// Length-prefixed bulk bytes carried by the upload commands.
///
/// Wire form: byte length word, the bytes, zero padding to the next word.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload(value.to_vec())
    }
}

impl Operand for Payload {
    fn encode(&self, buf: &mut PushBuffer) {
        buf.push_word(self.0.len() as u32);
        buf.push_bytes(&self.0);
        buf.realign();
    }

    fn decode(reader: &mut CommandReader<'_>) -> Result<Self, DecodeError> {
        let len = reader.read_word()? as usize;
        Ok(Payload(reader.read_padded(len)?.to_vec()))
    }
}

macro_rules! command_schema {
    (@upload upload) => { true };
    (@upload) => { false };
    (
        $(
            $(#[$meta:meta])*
            $opcode:literal => $name:ident { $( $field:ident : $ty:ty ),* $(,)? } $( [$upload:ident] )? ;
        )*
    ) => {
        /// Every opcode the protocol knows, including the stream sentinel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            /// End of the submitted stream.
            Sentinel = 0,
            $( $name = $opcode, )*
        }

        impl Opcode {
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    0 => Some(Opcode::Sentinel),
                    $( $opcode => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Whether executing this opcode takes the pending upload.
            pub const fn consumes_upload(self) -> bool {
                match self {
                    Opcode::Sentinel => false,
                    $( Opcode::$name => command_schema!(@upload $($upload)?), )*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    Opcode::Sentinel => "Sentinel",
                    $( Opcode::$name => stringify!($name), )*
                }
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum Command {
            $(
                $(#[$meta])*
                $name { $( $field: $ty ),* },
            )*
        }

        impl Command {
            pub fn opcode(&self) -> Opcode {
                match self {
                    $( Command::$name { .. } => Opcode::$name, )*
                }
            }

            /// Appends the opcode word and operands to `buf`.
            pub fn encode(&self, buf: &mut PushBuffer) {
                match self {
                    $(
                        Command::$name { $( $field ),* } => {
                            buf.push_word(Opcode::$name as u32);
                            $( Operand::encode($field, buf); )*
                        }
                    )*
                }
            }

            /// Decodes the operands that follow `opcode`. Returns `None` for the sentinel.
            pub(crate) fn decode_operands(
                opcode: Opcode,
                reader: &mut CommandReader<'_>,
            ) -> Result<Option<Self>, DecodeError> {
                let cmd = match opcode {
                    Opcode::Sentinel => return Ok(None),
                    $(
                        Opcode::$name => Command::$name {
                            $( $field: <$ty as Operand>::decode(reader)? ),*
                        },
                    )*
                };
                Ok(Some(cmd))
            }
        }
    };
}

command_schema! {
    /// Replace the issuing client's context with a fresh one.
    1 => CreateContext {};
    /// Destroy the connection of `client_id`. Nothing after it in the stream runs.
    2 => Goodbye { client_id: u32 };
    /// Client drawable size; the server resizes the context's framebuffer.
    3 => ReportDimensions { width: u32, height: u32 };
    /// Read the current frame into the shared framebuffer area.
    4 => RequestFramebuffer { width: u32, height: u32, vflip: u32, format: u32 };
    /// Stage a blob for the next upload-consuming command.
    5 => Upload { data: Payload };
    /// Stage a blob that stays pending for every following consumer.
    6 => UploadStay { data: Payload };
    7 => Clear { mask: u32 };
    /// Stage an explicit null pointer.
    8 => UploadNull {};
    9 => ClearColor { r: f32, g: f32, b: f32, a: f32 };
    10 => ClearDepth { depth: f32 };
    11 => Viewport { x: i32, y: i32, width: i32, height: i32 };
    12 => Scissor { x: i32, y: i32, width: i32, height: i32 };
    13 => Enable { cap: u32 };
    14 => Disable { cap: u32 };
    15 => Flush {};
    16 => Finish {};
    17 => GetError {};
    18 => GetIntegerv { pname: u32 };
    19 => GetString { name: u32 };
    20 => GenBuffers { count: u32 };
    /// Names come from the upload, one `u32` each.
    21 => DeleteBuffers { count: u32 } [upload];
    22 => BindBuffer { target: u32, buffer: u32 };
    23 => BufferData { target: u32, size: u32, usage: u32 } [upload];
    24 => BufferSubData { target: u32, offset: u32, size: u32 } [upload];
    25 => GenTextures { count: u32 };
    26 => DeleteTextures { count: u32 } [upload];
    27 => BindTexture { target: u32, texture: u32 };
    28 => TexImage2D {
        target: u32,
        level: i32,
        internal_format: i32,
        width: i32,
        height: i32,
        format: u32,
        ty: u32,
    } [upload];
    29 => TexParameteri { target: u32, pname: u32, param: i32 };
    30 => CreateShader { kind: u32 };
    /// Source text comes from the upload.
    31 => ShaderSource { shader: u32 } [upload];
    32 => CompileShader { shader: u32 };
    33 => CreateProgram {};
    34 => AttachShader { program: u32, shader: u32 };
    35 => LinkProgram { program: u32 };
    36 => UseProgram { program: u32 };
    /// Uniform name comes from the upload.
    37 => GetUniformLocation { program: u32 } [upload];
    38 => Uniform4f { location: i32, x: f32, y: f32, z: f32, w: f32 };
    39 => VertexAttribPointer {
        index: u32,
        size: i32,
        ty: u32,
        normalized: u32,
        stride: i32,
        offset: u32,
    };
    40 => EnableVertexAttribArray { index: u32 };
    41 => DrawArrays { mode: u32, first: i32, count: i32 };
    /// Client-side indices come from the upload; a null upload uses the bound element
    /// buffer at `offset`.
    42 => DrawElements { mode: u32, count: i32, ty: u32, offset: u32 } [upload];
    43 => Begin { mode: u32 };
    44 => End {};
    45 => Vertex3f { x: f32, y: f32, z: f32 };
    46 => Color4f { r: f32, g: f32, b: f32, a: f32 };
}

impl Command {
    pub fn consumes_upload(&self) -> bool {
        self.opcode().consumes_upload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_frozen() {
        assert_eq!(Opcode::Sentinel as u32, 0);
        assert_eq!(Opcode::CreateContext as u32, 1);
        assert_eq!(Opcode::Goodbye as u32, 2);
        assert_eq!(Opcode::Upload as u32, 5);
        assert_eq!(Opcode::Clear as u32, 7);
        assert_eq!(Opcode::UploadNull as u32, 8);
    }

    #[test]
    fn from_u32_knows_every_declared_opcode() {
        for value in 0..=46 {
            let opcode = Opcode::from_u32(value).expect("declared opcode");
            assert_eq!(opcode as u32, value);
        }
        assert_eq!(Opcode::from_u32(47), None);
        assert_eq!(Opcode::from_u32(u32::MAX), None);
    }

    #[test]
    fn upload_consumers_are_marked() {
        assert!(Opcode::BufferData.consumes_upload());
        assert!(Opcode::ShaderSource.consumes_upload());
        assert!(!Opcode::Upload.consumes_upload());
        assert!(!Opcode::Clear.consumes_upload());
        assert!(!Opcode::Sentinel.consumes_upload());
    }

    #[test]
    fn payload_is_padded_to_a_word() {
        let mut buf = PushBuffer::new();
        Command::Upload {
            data: Payload(vec![1, 2, 3, 4, 5]),
        }
        .encode(&mut buf);
        // opcode + len + 8 padded bytes
        assert_eq!(buf.size(), 16);
        assert_eq!(&buf.as_bytes()[8..16], &[1, 2, 3, 4, 5, 0, 0, 0]);
    }
}
