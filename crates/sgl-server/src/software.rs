//! Headless reference backend.
//!
//! Keeps a CPU-side RGBA framebuffer per context and tracks enough GL state to answer
//! queries and validate calls the way a driver would. Only clears touch pixels; draw
//! calls are validated and counted but not rasterized.

use std::collections::{BTreeMap, BTreeSet};

use sgl_protocol::Command;

use crate::backend::{GlBackend, ReadbackRequest, Reply};
use crate::error::BackendError;
use crate::gl;

/// Drawable size of a fresh context, before the client reports its window size.
pub const DEFAULT_DRAWABLE: (u32, u32) = (640, 480);

/// Newest GL version the backend pretends to implement.
pub const MAX_VERSION: (u32, u32) = (4, 6);

const MAX_TEXTURE_SIZE: u32 = 4096;

#[derive(Debug, Default)]
pub struct SoftwareBackend {
    contexts_created: u64,
    contexts_destroyed: u64,
    current_bound: bool,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created
    }

    pub fn live_contexts(&self) -> u64 {
        self.contexts_created - self.contexts_destroyed
    }

    /// Whether some context is bound to the dispatcher thread.
    pub fn has_current(&self) -> bool {
        self.current_bound
    }
}

#[derive(Debug, Default)]
struct Shader {
    kind: u32,
    source: String,
    compiled: bool,
}

#[derive(Debug, Default)]
struct Program {
    shaders: Vec<u32>,
    linked: bool,
    uniforms: Vec<String>,
    uniform_values: BTreeMap<i32, [f32; 4]>,
}

#[derive(Debug, Default)]
struct Texture {
    width: i32,
    height: i32,
    data: Vec<u8>,
    params: BTreeMap<u32, i32>,
}

/// State recorded by `glVertexAttribPointer`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttribPointer {
    pub size: i32,
    pub ty: u32,
    pub normalized: bool,
    pub stride: i32,
    pub offset: u32,
}

#[derive(Debug)]
pub struct SoftwareContext {
    version: (u32, u32),
    width: u32,
    height: u32,
    /// Bottom-up rows, RGBA8.
    color: Vec<u8>,
    error: u32,

    clear_color: [f32; 4],
    clear_depth: f32,
    viewport: [i32; 4],
    scissor: [i32; 4],
    caps: BTreeSet<u32>,

    next_name: u32,
    buffers: BTreeMap<u32, Vec<u8>>,
    array_buffer: u32,
    element_buffer: u32,
    textures: BTreeMap<u32, Texture>,
    bound_texture: u32,
    shaders: BTreeMap<u32, Shader>,
    programs: BTreeMap<u32, Program>,
    current_program: u32,
    attribs: BTreeMap<u32, AttribPointer>,
    enabled_attribs: BTreeSet<u32>,

    immediate_mode: Option<u32>,
    immediate_vertices: u64,
    current_color: [f32; 4],

    draw_calls: u64,
    vertices: u64,
    clears: u64,
}

impl SoftwareContext {
    fn new(version: (u32, u32)) -> Self {
        let (width, height) = DEFAULT_DRAWABLE;
        Self {
            version,
            width,
            height,
            color: vec![0; (width * height * 4) as usize],
            error: gl::NO_ERROR,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            viewport: [0, 0, width as i32, height as i32],
            scissor: [0, 0, width as i32, height as i32],
            caps: BTreeSet::new(),
            next_name: 1,
            buffers: BTreeMap::new(),
            array_buffer: 0,
            element_buffer: 0,
            textures: BTreeMap::new(),
            bound_texture: 0,
            shaders: BTreeMap::new(),
            programs: BTreeMap::new(),
            current_program: 0,
            attribs: BTreeMap::new(),
            enabled_attribs: BTreeSet::new(),
            immediate_mode: None,
            immediate_vertices: 0,
            current_color: [1.0; 4],
            draw_calls: 0,
            vertices: 0,
            clears: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    pub fn vertices(&self) -> u64 {
        self.vertices
    }

    pub fn clears(&self) -> u64 {
        self.clears
    }

    pub fn clear_depth(&self) -> f32 {
        self.clear_depth
    }

    /// Color last set by `glColor4f`.
    pub fn current_color(&self) -> [f32; 4] {
        self.current_color
    }

    pub fn buffer(&self, name: u32) -> Option<&[u8]> {
        self.buffers.get(&name).map(Vec::as_slice)
    }

    /// Size and texel bytes of texture `name`.
    pub fn texture(&self, name: u32) -> Option<(i32, i32, &[u8])> {
        self.textures
            .get(&name)
            .map(|t| (t.width, t.height, t.data.as_slice()))
    }

    pub fn texture_parameter(&self, name: u32, pname: u32) -> Option<i32> {
        self.textures.get(&name)?.params.get(&pname).copied()
    }

    pub fn uniform(&self, program: u32, location: i32) -> Option<[f32; 4]> {
        self.programs.get(&program)?.uniform_values.get(&location).copied()
    }

    pub fn attrib(&self, index: u32) -> Option<AttribPointer> {
        self.attribs.get(&index).copied()
    }

    pub fn attrib_enabled(&self, index: u32) -> bool {
        self.enabled_attribs.contains(&index)
    }

    /// RGBA of the pixel at `(x, y)`, origin bottom-left.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        Some([
            self.color[i],
            self.color[i + 1],
            self.color[i + 2],
            self.color[i + 3],
        ])
    }

    /// Records `code` unless an earlier error is still pending.
    fn set_error(&mut self, code: u32) {
        if self.error == gl::NO_ERROR {
            self.error = code;
        }
    }

    fn take_error(&mut self) -> u32 {
        std::mem::replace(&mut self.error, gl::NO_ERROR)
    }

    fn gen_names(&mut self, count: u32) -> Option<Vec<u32>> {
        if count as usize > sgl_protocol::registers::RETVAL_V_WORDS {
            self.set_error(gl::INVALID_VALUE);
            return None;
        }
        let start = self.next_name;
        self.next_name += count;
        Some((start..start + count).collect())
    }

    fn clear(&mut self, mask: u32) {
        let known = gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT;
        if mask & !known != 0 {
            self.set_error(gl::INVALID_VALUE);
            return;
        }
        self.clears += 1;
        if mask & gl::COLOR_BUFFER_BIT == 0 {
            return;
        }

        let (mut x0, mut y0, mut x1, mut y1) = (0i64, 0i64, self.width as i64, self.height as i64);
        if self.caps.contains(&gl::SCISSOR_TEST) {
            let [sx, sy, sw, sh] = self.scissor.map(i64::from);
            x0 = x0.max(sx);
            y0 = y0.max(sy);
            x1 = x1.min(sx + sw);
            y1 = y1.min(sy + sh);
        }
        if x0 >= x1 || y0 >= y1 {
            return;
        }

        let rgba = self
            .clear_color
            .map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        for y in y0..y1 {
            let row = (y as usize) * self.width as usize;
            for x in x0..x1 {
                let i = (row + x as usize) * 4;
                self.color[i..i + 4].copy_from_slice(&rgba);
            }
        }
    }

    fn integer(&mut self, pname: u32) -> Reply {
        let words = |v: [i32; 4]| Reply::Vector(v.iter().map(|x| *x as u32).collect());
        match pname {
            gl::VIEWPORT => words(self.viewport),
            gl::SCISSOR_BOX => words(self.scissor),
            gl::SCISSOR_TEST => Reply::Scalar(self.caps.contains(&gl::SCISSOR_TEST) as u64),
            gl::MAJOR_VERSION => Reply::Scalar(self.version.0 as u64),
            gl::MINOR_VERSION => Reply::Scalar(self.version.1 as u64),
            gl::MAX_TEXTURE_SIZE => Reply::Scalar(MAX_TEXTURE_SIZE as u64),
            _ => {
                self.set_error(gl::INVALID_ENUM);
                Reply::None
            }
        }
    }

    fn string(&mut self, name: u32) -> Reply {
        let (major, minor) = self.version;
        let s = match name {
            gl::VENDOR => "sgl".to_owned(),
            gl::RENDERER => "sgl software rasterizer".to_owned(),
            gl::VERSION => format!("{major}.{minor} sgl"),
            gl::SHADING_LANGUAGE_VERSION => format!("{major}.{minor}0 sgl"),
            _ => {
                self.set_error(gl::INVALID_ENUM);
                return Reply::None;
            }
        };
        Reply::Vector(nul_terminated_words(&s))
    }

    fn buffer_for(&mut self, target: u32) -> Option<u32> {
        let bound = match target {
            gl::ARRAY_BUFFER => self.array_buffer,
            gl::ELEMENT_ARRAY_BUFFER => self.element_buffer,
            _ => {
                self.set_error(gl::INVALID_ENUM);
                return None;
            }
        };
        if bound == 0 {
            self.set_error(gl::INVALID_OPERATION);
            return None;
        }
        Some(bound)
    }

    fn delete_names(&mut self, count: u32, upload: Option<&[u8]>) -> Option<Vec<u32>> {
        let bytes = match upload {
            Some(b) if b.len() >= count as usize * 4 => b,
            _ => {
                self.set_error(gl::INVALID_VALUE);
                return None;
            }
        };
        Some(
            bytes
                .chunks_exact(4)
                .take(count as usize)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    fn uniform_location(&mut self, program: u32, upload: Option<&[u8]>) -> i32 {
        let name = match upload {
            Some(b) => String::from_utf8_lossy(b)
                .trim_end_matches('\0')
                .to_owned(),
            None => {
                self.set_error(gl::INVALID_VALUE);
                return -1;
            }
        };
        let Some(prog) = self.programs.get(&program) else {
            self.set_error(gl::INVALID_VALUE);
            return -1;
        };
        if !prog.linked {
            self.set_error(gl::INVALID_OPERATION);
            return -1;
        }
        if let Some(i) = prog.uniforms.iter().position(|u| *u == name) {
            return i as i32;
        }
        let declared = prog.shaders.iter().any(|s| {
            self.shaders
                .get(s)
                .is_some_and(|sh| declares_uniform(&sh.source, &name))
        });
        if !declared {
            return -1;
        }
        let Some(prog) = self.programs.get_mut(&program) else {
            return -1;
        };
        prog.uniforms.push(name);
        (prog.uniforms.len() - 1) as i32
    }

    fn execute(&mut self, cmd: &Command, upload: Option<&[u8]>) -> Result<Reply, BackendError> {
        if self.immediate_mode.is_some()
            && !matches!(
                cmd,
                Command::Vertex3f { .. } | Command::Color4f { .. } | Command::End {}
            )
        {
            self.set_error(gl::INVALID_OPERATION);
            return Ok(Reply::None);
        }

        let reply = match *cmd {
            Command::ClearColor { r, g, b, a } => {
                self.clear_color = [r, g, b, a];
                Reply::None
            }
            Command::ClearDepth { depth } => {
                self.clear_depth = depth.clamp(0.0, 1.0);
                Reply::None
            }
            Command::Clear { mask } => {
                self.clear(mask);
                Reply::None
            }
            Command::Viewport {
                x,
                y,
                width,
                height,
            } => {
                if width < 0 || height < 0 {
                    self.set_error(gl::INVALID_VALUE);
                } else {
                    self.viewport = [x, y, width, height];
                }
                Reply::None
            }
            Command::Scissor {
                x,
                y,
                width,
                height,
            } => {
                if width < 0 || height < 0 {
                    self.set_error(gl::INVALID_VALUE);
                } else {
                    self.scissor = [x, y, width, height];
                }
                Reply::None
            }
            Command::Enable { cap } | Command::Disable { cap } => {
                let known = [
                    gl::BLEND,
                    gl::CULL_FACE,
                    gl::DEPTH_TEST,
                    gl::SCISSOR_TEST,
                    gl::STENCIL_TEST,
                    gl::TEXTURE_2D,
                ];
                if !known.contains(&cap) {
                    self.set_error(gl::INVALID_ENUM);
                } else if matches!(cmd, Command::Enable { .. }) {
                    self.caps.insert(cap);
                } else {
                    self.caps.remove(&cap);
                }
                Reply::None
            }
            Command::Flush {} | Command::Finish {} => Reply::None,
            Command::GetError {} => Reply::Scalar(self.take_error() as u64),
            Command::GetIntegerv { pname } => self.integer(pname),
            Command::GetString { name } => self.string(name),

            Command::GenBuffers { count } => match self.gen_names(count) {
                Some(names) => {
                    for n in &names {
                        self.buffers.insert(*n, Vec::new());
                    }
                    Reply::Vector(names)
                }
                None => Reply::None,
            },
            Command::DeleteBuffers { count } => {
                for name in self.delete_names(count, upload).unwrap_or_default() {
                    self.buffers.remove(&name);
                    if self.array_buffer == name {
                        self.array_buffer = 0;
                    }
                    if self.element_buffer == name {
                        self.element_buffer = 0;
                    }
                }
                Reply::None
            }
            Command::BindBuffer { target, buffer } => {
                let slot = match target {
                    gl::ARRAY_BUFFER => &mut self.array_buffer,
                    gl::ELEMENT_ARRAY_BUFFER => &mut self.element_buffer,
                    _ => {
                        self.set_error(gl::INVALID_ENUM);
                        return Ok(Reply::None);
                    }
                };
                *slot = buffer;
                if buffer != 0 {
                    self.buffers.entry(buffer).or_default();
                }
                Reply::None
            }
            Command::BufferData { target, size, .. } => {
                if let Some(name) = self.buffer_for(target) {
                    let mut data = vec![0u8; size as usize];
                    if let Some(src) = upload {
                        let n = src.len().min(data.len());
                        data[..n].copy_from_slice(&src[..n]);
                    }
                    self.buffers.insert(name, data);
                }
                Reply::None
            }
            Command::BufferSubData {
                target,
                offset,
                size,
            } => {
                if let Some(name) = self.buffer_for(target) {
                    let (offset, size) = (offset as usize, size as usize);
                    let fits = self
                        .buffers
                        .get(&name)
                        .is_some_and(|b| offset.checked_add(size).is_some_and(|e| e <= b.len()));
                    match upload {
                        Some(src) if fits && src.len() >= size => {
                            if let Some(buf) = self.buffers.get_mut(&name) {
                                buf[offset..offset + size].copy_from_slice(&src[..size]);
                            }
                        }
                        _ => self.set_error(gl::INVALID_VALUE),
                    }
                }
                Reply::None
            }

            Command::GenTextures { count } => match self.gen_names(count) {
                Some(names) => {
                    for n in &names {
                        self.textures.insert(*n, Texture::default());
                    }
                    Reply::Vector(names)
                }
                None => Reply::None,
            },
            Command::DeleteTextures { count } => {
                for name in self.delete_names(count, upload).unwrap_or_default() {
                    self.textures.remove(&name);
                    if self.bound_texture == name {
                        self.bound_texture = 0;
                    }
                }
                Reply::None
            }
            Command::BindTexture { target, texture } => {
                if target != gl::TEXTURE_2D {
                    self.set_error(gl::INVALID_ENUM);
                } else {
                    self.bound_texture = texture;
                    if texture != 0 {
                        self.textures.entry(texture).or_default();
                    }
                }
                Reply::None
            }
            Command::TexImage2D {
                target,
                width,
                height,
                ..
            } => {
                if target != gl::TEXTURE_2D {
                    self.set_error(gl::INVALID_ENUM);
                } else if width < 0
                    || height < 0
                    || width as u32 > MAX_TEXTURE_SIZE
                    || height as u32 > MAX_TEXTURE_SIZE
                {
                    self.set_error(gl::INVALID_VALUE);
                } else if self.bound_texture == 0 {
                    self.set_error(gl::INVALID_OPERATION);
                } else if let Some(tex) = self.textures.get_mut(&self.bound_texture) {
                    tex.width = width;
                    tex.height = height;
                    tex.data = match upload {
                        Some(bytes) => bytes.to_vec(),
                        None => vec![0; width as usize * height as usize * 4],
                    };
                }
                Reply::None
            }
            Command::TexParameteri {
                target,
                pname,
                param,
            } => {
                if target != gl::TEXTURE_2D {
                    self.set_error(gl::INVALID_ENUM);
                } else if let Some(tex) = self.textures.get_mut(&self.bound_texture) {
                    tex.params.insert(pname, param);
                } else {
                    self.set_error(gl::INVALID_OPERATION);
                }
                Reply::None
            }

            Command::CreateShader { kind } => {
                if kind != gl::VERTEX_SHADER && kind != gl::FRAGMENT_SHADER {
                    self.set_error(gl::INVALID_ENUM);
                    Reply::Scalar(0)
                } else {
                    let name = self.next_name;
                    self.next_name += 1;
                    self.shaders.insert(
                        name,
                        Shader {
                            kind,
                            ..Shader::default()
                        },
                    );
                    Reply::Scalar(name as u64)
                }
            }
            Command::ShaderSource { shader } => {
                match (self.shaders.get_mut(&shader), upload) {
                    (Some(sh), Some(src)) => {
                        sh.source = String::from_utf8_lossy(src)
                            .trim_end_matches('\0')
                            .to_owned();
                        sh.compiled = false;
                    }
                    _ => self.set_error(gl::INVALID_VALUE),
                }
                Reply::None
            }
            Command::CompileShader { shader } => {
                match self.shaders.get_mut(&shader) {
                    Some(sh) => sh.compiled = !sh.source.trim().is_empty(),
                    None => self.set_error(gl::INVALID_VALUE),
                }
                Reply::None
            }
            Command::CreateProgram {} => {
                let name = self.next_name;
                self.next_name += 1;
                self.programs.insert(name, Program::default());
                Reply::Scalar(name as u64)
            }
            Command::AttachShader { program, shader } => {
                if !self.shaders.contains_key(&shader) {
                    self.set_error(gl::INVALID_VALUE);
                } else if let Some(prog) = self.programs.get_mut(&program) {
                    if prog.shaders.contains(&shader) {
                        self.set_error(gl::INVALID_OPERATION);
                    } else {
                        prog.shaders.push(shader);
                    }
                } else {
                    self.set_error(gl::INVALID_VALUE);
                }
                Reply::None
            }
            Command::LinkProgram { program } => {
                let shaders = &self.shaders;
                match self.programs.get_mut(&program) {
                    Some(prog) => {
                        let kinds: BTreeSet<u32> = prog
                            .shaders
                            .iter()
                            .filter_map(|s| shaders.get(s))
                            .filter(|s| s.compiled)
                            .map(|s| s.kind)
                            .collect();
                        prog.linked = kinds.contains(&gl::VERTEX_SHADER)
                            && kinds.contains(&gl::FRAGMENT_SHADER);
                        prog.uniforms.clear();
                        prog.uniform_values.clear();
                    }
                    None => self.set_error(gl::INVALID_VALUE),
                }
                Reply::None
            }
            Command::UseProgram { program } => {
                let linked = self.programs.get(&program).map(|p| p.linked);
                match linked {
                    _ if program == 0 => self.current_program = 0,
                    Some(true) => self.current_program = program,
                    Some(false) => self.set_error(gl::INVALID_OPERATION),
                    None => self.set_error(gl::INVALID_VALUE),
                }
                Reply::None
            }
            Command::GetUniformLocation { program } => {
                Reply::Scalar(self.uniform_location(program, upload) as u32 as u64)
            }
            Command::Uniform4f { location, x, y, z, w } => {
                let stored = match self.programs.get_mut(&self.current_program) {
                    Some(_) if location == -1 => true,
                    Some(prog) if location >= 0 && (location as usize) < prog.uniforms.len() => {
                        prog.uniform_values.insert(location, [x, y, z, w]);
                        true
                    }
                    _ => false,
                };
                if !stored {
                    self.set_error(gl::INVALID_OPERATION);
                }
                Reply::None
            }

            Command::VertexAttribPointer {
                index,
                size,
                ty,
                normalized,
                stride,
                offset,
            } => {
                if index >= gl::MAX_VERTEX_ATTRIBS || !(1..=4).contains(&size) || stride < 0 {
                    self.set_error(gl::INVALID_VALUE);
                } else {
                    self.attribs.insert(
                        index,
                        AttribPointer {
                            size,
                            ty,
                            normalized: normalized != 0,
                            stride,
                            offset,
                        },
                    );
                }
                Reply::None
            }
            Command::EnableVertexAttribArray { index } => {
                if index >= gl::MAX_VERTEX_ATTRIBS {
                    self.set_error(gl::INVALID_VALUE);
                } else {
                    self.enabled_attribs.insert(index);
                }
                Reply::None
            }
            Command::DrawArrays { mode, count, .. } => {
                if mode > gl::TRIANGLE_FAN {
                    self.set_error(gl::INVALID_ENUM);
                } else if count < 0 {
                    self.set_error(gl::INVALID_VALUE);
                } else {
                    self.draw_calls += 1;
                    self.vertices += count as u64;
                }
                Reply::None
            }
            Command::DrawElements {
                mode, count, ty, ..
            } => {
                let index_types = [gl::UNSIGNED_BYTE, gl::UNSIGNED_SHORT, gl::UNSIGNED_INT];
                if mode > gl::TRIANGLE_FAN || !index_types.contains(&ty) {
                    self.set_error(gl::INVALID_ENUM);
                } else if count < 0 {
                    self.set_error(gl::INVALID_VALUE);
                } else if upload.is_none() && self.element_buffer == 0 {
                    self.set_error(gl::INVALID_OPERATION);
                } else {
                    self.draw_calls += 1;
                    self.vertices += count as u64;
                }
                Reply::None
            }

            Command::Begin { mode } => {
                if mode > gl::TRIANGLE_FAN {
                    self.set_error(gl::INVALID_ENUM);
                } else {
                    self.immediate_mode = Some(mode);
                    self.immediate_vertices = 0;
                }
                Reply::None
            }
            Command::End {} => {
                if self.immediate_mode.take().is_none() {
                    self.set_error(gl::INVALID_OPERATION);
                } else {
                    self.draw_calls += 1;
                    self.vertices += self.immediate_vertices;
                }
                Reply::None
            }
            Command::Vertex3f { .. } => {
                if self.immediate_mode.is_some() {
                    self.immediate_vertices += 1;
                }
                Reply::None
            }
            Command::Color4f { r, g, b, a } => {
                self.current_color = [r, g, b, a];
                Reply::None
            }

            Command::CreateContext {}
            | Command::Goodbye { .. }
            | Command::ReportDimensions { .. }
            | Command::RequestFramebuffer { .. }
            | Command::Upload { .. }
            | Command::UploadStay { .. }
            | Command::UploadNull {} => {
                return Err(BackendError::Unsupported(cmd.opcode().name()));
            }
        };
        Ok(reply)
    }
}

impl GlBackend for SoftwareBackend {
    type Context = SoftwareContext;

    fn create_context(&mut self, version: (u32, u32)) -> Result<SoftwareContext, BackendError> {
        if version > MAX_VERSION || version.0 == 0 {
            return Err(BackendError::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }
        self.contexts_created += 1;
        Ok(SoftwareContext::new(version))
    }

    fn destroy_context(&mut self, _ctx: SoftwareContext) {
        self.contexts_destroyed += 1;
    }

    fn make_current(&mut self, ctx: Option<&mut SoftwareContext>) -> Result<(), BackendError> {
        self.current_bound = ctx.is_some();
        Ok(())
    }

    fn execute(
        &mut self,
        ctx: &mut SoftwareContext,
        cmd: &Command,
        upload: Option<&[u8]>,
    ) -> Result<Reply, BackendError> {
        ctx.execute(cmd, upload)
    }

    fn resize(
        &mut self,
        ctx: &mut SoftwareContext,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        if width > MAX_TEXTURE_SIZE || height > MAX_TEXTURE_SIZE {
            ctx.set_error(gl::INVALID_VALUE);
            return Ok(());
        }
        let full = |w: u32, h: u32| [0, 0, w as i32, h as i32];
        let old = full(ctx.width, ctx.height);
        if ctx.viewport == old {
            ctx.viewport = full(width, height);
        }
        if ctx.scissor == old {
            ctx.scissor = full(width, height);
        }
        ctx.width = width;
        ctx.height = height;
        ctx.color = vec![0; (width * height * 4) as usize];
        Ok(())
    }

    fn read_pixels(
        &mut self,
        ctx: &mut SoftwareContext,
        request: ReadbackRequest,
    ) -> Result<Vec<u8>, BackendError> {
        let swap_rb = match request.format {
            gl::RGBA => false,
            gl::BGRA => true,
            _ => {
                ctx.set_error(gl::INVALID_ENUM);
                return Ok(Vec::new());
            }
        };
        if request.width > MAX_TEXTURE_SIZE || request.height > MAX_TEXTURE_SIZE {
            ctx.set_error(gl::INVALID_VALUE);
            return Ok(Vec::new());
        }
        let (w, h) = (request.width as usize, request.height as usize);
        let mut out = vec![0u8; w * h * 4];
        let copy_w = w.min(ctx.width as usize);
        for y in 0..h.min(ctx.height as usize) {
            let dst_y = if request.vflip { h - 1 - y } else { y };
            let src = y * ctx.width as usize * 4;
            let dst = dst_y * w * 4;
            out[dst..dst + copy_w * 4].copy_from_slice(&ctx.color[src..src + copy_w * 4]);
        }
        if swap_rb {
            for px in out.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        Ok(out)
    }

    fn finish(&mut self, _ctx: &mut SoftwareContext) -> Result<(), BackendError> {
        Ok(())
    }

    fn get_error(&mut self, ctx: &mut SoftwareContext) -> u32 {
        ctx.take_error()
    }
}

fn nul_terminated_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes.truncate(sgl_protocol::registers::RETVAL_V_WORDS * 4);
    bytes
        .chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(w)
        })
        .collect()
}

fn declares_uniform(source: &str, name: &str) -> bool {
    source.split(';').any(|stmt| {
        let mut tokens = stmt
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| !t.is_empty());
        tokens.any(|t| t == "uniform") && tokens.any(|t| t == name)
    })
}
