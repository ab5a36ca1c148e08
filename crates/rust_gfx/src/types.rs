//! Backend-neutral resource descriptions and registry keys

use std::path::Path;

use bitflags::bitflags;
use slotmap::new_key_type;

use crate::error::{GfxError, GfxResult};

new_key_type! {
    /// Handle to a buffer owned by a context
    pub struct BufferKey;
    /// Handle to an image owned by a context
    pub struct ImageKey;
    /// Handle to a sampler owned by a context
    pub struct SamplerKey;
    /// Handle to a shader owned by a context
    pub struct ShaderKey;
    /// Handle to a framebuffer owned by a context
    pub struct FramebufferKey;
    /// Handle to a graphics, compute or ray tracing pipeline
    pub struct PipelineKey;
    /// Handle to a bottom-level acceleration structure
    pub struct RtMeshKey;
    /// Handle to a top-level acceleration structure
    pub struct RtSceneKey;
}

/// Two-dimensional pixel extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero (minimized window)
    pub const fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamp each dimension into `[min, max]`
    pub fn clamp(self, min: Self, max: Self) -> Self {
        Self {
            width: self.width.clamp(min.width, max.width.max(min.width)),
            height: self.height.clamp(min.height, max.height.max(min.height)),
        }
    }
}

/// Three-dimensional pixel extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent3D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Depth in pixels (1 for 2D images)
    pub depth: u32,
}

impl Extent3D {
    /// Create an extent
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    /// Number of texels covered
    pub const fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// The 2D footprint
    pub const fn to_2d(self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

impl From<Extent2D> for Extent3D {
    fn from(extent: Extent2D) -> Self {
        Self::new(extent.width, extent.height, 1)
    }
}

/// Pixel formats understood by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// 8-bit single channel
    R8Unorm,
    /// 8-bit two channels
    Rg8Unorm,
    /// 8-bit RGBA, linear
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 8-bit BGRA, linear
    Bgra8Unorm,
    /// 8-bit BGRA, sRGB encoded
    Bgra8Srgb,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float single channel
    R32Float,
    /// 32-bit float RGBA
    Rgba32Float,
    /// 32-bit float depth
    D32Float,
}

impl Format {
    /// Size of one texel in bytes
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm => 2,
            Self::Rgba8Unorm | Self::Rgba8Srgb | Self::Bgra8Unorm | Self::Bgra8Srgb => 4,
            Self::R32Float | Self::D32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Whether this is a depth format
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Float)
    }
}

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex input
        const VERTEX = 1 << 0;
        /// Index input
        const INDEX = 1 << 1;
        /// Uniform buffer binding
        const UNIFORM = 1 << 2;
        /// Storage buffer binding
        const STORAGE = 1 << 3;
        /// Source of a transfer
        const TRANSFER_SRC = 1 << 4;
        /// Destination of a transfer
        const TRANSFER_DST = 1 << 5;
        /// Queryable device address
        const DEVICE_ADDRESS = 1 << 6;
        /// Read by acceleration structure builds
        const ACCELERATION_STRUCTURE_INPUT = 1 << 7;
        /// Backing storage of an acceleration structure
        const ACCELERATION_STRUCTURE_STORAGE = 1 << 8;
        /// Shader binding table region
        const SHADER_BINDING_TABLE = 1 << 9;
    }
}

bitflags! {
    /// How an image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Sampled from shaders
        const SAMPLED = 1 << 0;
        /// Read/written as a storage image
        const STORAGE = 1 << 1;
        /// Rendered to as a colour attachment
        const COLOR_ATTACHMENT = 1 << 2;
        /// Rendered to as a depth attachment
        const DEPTH_ATTACHMENT = 1 << 3;
        /// Source of a transfer
        const TRANSFER_SRC = 1 << 4;
        /// Destination of a transfer
        const TRANSFER_DST = 1 << 5;
    }
}

/// Update strategy of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferMode {
    /// Device-local; uploads go through staging when not host-visible
    #[default]
    Constant,
    /// Host-visible; uploads write the mapping directly
    Dynamic,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Size in bytes
    pub size: u64,
    /// Intended usage
    pub usage: BufferUsage,
    /// Memory placement
    pub mode: BufferMode,
}

impl BufferInfo {
    /// Device-local buffer
    pub const fn constant(size: u64, usage: BufferUsage) -> Self {
        Self { size, usage, mode: BufferMode::Constant }
    }

    /// Host-visible buffer
    pub const fn dynamic(size: u64, usage: BufferUsage) -> Self {
        Self { size, usage, mode: BufferMode::Dynamic }
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Extent in texels
    pub extent: Extent3D,
    /// Texel format
    pub format: Format,
    /// Intended usage
    pub usage: ImageUsage,
}

impl ImageInfo {
    /// A sampled 2D texture
    pub const fn texture_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            extent: Extent3D::new(width, height, 1),
            format,
            usage: ImageUsage::SAMPLED,
        }
    }

    /// Bytes required for a full upload
    pub const fn byte_size(&self) -> u64 {
        self.extent.texel_count() * self.format.bytes_per_texel() as u64
    }
}

/// Texel filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Nearest texel
    Nearest,
    /// Bilinear
    Linear,
}

/// Texture coordinate wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Tile
    Repeat,
    /// Tile, mirrored
    MirroredRepeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerInfo {
    /// Magnification filter
    pub mag_filter: Filter,
    /// Minification filter
    pub min_filter: Filter,
    /// Wrapping on all axes
    pub address_mode: AddressMode,
    /// Anisotropic filtering level, if enabled
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            address_mode: AddressMode::Repeat,
            max_anisotropy: None,
        }
    }
}

/// Pipeline stage a shader is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Fragment shader
    Fragment,
    /// Compute shader
    Compute,
    /// Ray generation shader
    RayGen,
    /// Miss shader
    Miss,
    /// Closest-hit shader
    ClosestHit,
}

/// Shader code as delivered by the shader loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    /// SPIR-V words (explicit backend)
    SpirV(Vec<u32>),
    /// GLSL text (immediate backend)
    Glsl(String),
}

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

impl ShaderSource {
    /// Decode a little-endian SPIR-V binary as written by `glslc`
    pub fn from_spirv_bytes(bytes: &[u8]) -> GfxResult<Self> {
        if bytes.len() < 4 || bytes.len() % 4 != 0 {
            return Err(GfxError::BadShaderCode);
        }
        let words: Vec<u32> =
            bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        if words[0] != SPIRV_MAGIC {
            return Err(GfxError::BadShaderCode);
        }
        Ok(Self::SpirV(words))
    }

    /// Read a shader file; `.spv` files are SPIR-V, anything else is GLSL text
    pub fn load(path: impl AsRef<Path>) -> GfxResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| GfxError::Unknown(format!("failed to read shader {}: {e}", path.display())))?;
        if path.extension().is_some_and(|ext| ext == "spv") {
            Self::from_spirv_bytes(&bytes)
        } else {
            String::from_utf8(bytes).map(Self::Glsl).map_err(|_| GfxError::BadShaderCode)
        }
    }
}

/// Index element width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexType {
    /// Size of one index in bytes
    pub const fn size(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Framebuffer creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// Size shared by every attachment
    pub extent: Extent2D,
    /// Ordered colour attachment formats
    pub color_formats: Vec<Format>,
    /// Optional depth attachment format
    pub depth_format: Option<Format>,
}

impl FramebufferInfo {
    /// Check the attachment list and extent
    pub fn validate(&self) -> GfxResult<()> {
        if self.extent.is_zero() {
            return Err(GfxError::ZeroFramebufferSize);
        }
        if self.color_formats.is_empty() && self.depth_format.is_none() {
            return Err(GfxError::InvalidUsage("framebuffer without attachments"));
        }
        if self.color_formats.iter().any(|f| f.is_depth()) {
            return Err(GfxError::InvalidUsage("depth format used as a colour attachment"));
        }
        if self.depth_format.is_some_and(|f| !f.is_depth()) {
            return Err(GfxError::InvalidUsage("colour format used as the depth attachment"));
        }
        Ok(())
    }
}

/// Render pass clear values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    /// Colour attachments clear colour
    pub color: [f32; 4],
    /// Depth clear value
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self { color: [0.0, 0.0, 0.0, 1.0], depth: 1.0 }
    }
}

/// Kind of descriptor a pipeline binding expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    /// Uniform buffer
    UniformBuffer,
    /// Storage buffer
    StorageBuffer,
    /// Combined image + sampler
    SampledImage,
    /// Storage image
    StorageImage,
    /// Top-level acceleration structure
    AccelerationStructure,
}

/// One binding slot of a pipeline's resource layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    /// Binding number
    pub binding: u32,
    /// Descriptor type
    pub ty: BindingType,
}

/// Resources and push constants a pipeline consumes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceLayout {
    /// Descriptor bindings of set 0
    pub bindings: Vec<BindingInfo>,
    /// Push constant block size in bytes
    pub push_constant_size: u32,
}

impl ResourceLayout {
    /// Append a binding
    pub fn with_binding(mut self, binding: u32, ty: BindingType) -> Self {
        self.bindings.push(BindingInfo { binding, ty });
        self
    }

    /// Set the push constant block size
    pub fn with_push_constants(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    /// Number of bindings of a given type
    pub fn count(&self, ty: BindingType) -> u32 {
        self.bindings.iter().filter(|b| b.ty == ty).count() as u32
    }
}

/// A resource attached to a binding at bind time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundResource {
    /// Uniform buffer
    UniformBuffer(BufferKey),
    /// Storage buffer
    StorageBuffer(BufferKey),
    /// Image sampled through a sampler
    SampledImage(ImageKey, SamplerKey),
    /// Storage image
    StorageImage(ImageKey),
    /// Ray tracing scene
    Scene(RtSceneKey),
}

/// Binding number paired with a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBinding {
    /// Binding number in the pipeline's layout
    pub binding: u32,
    /// Resource to bind
    pub resource: BoundResource,
}

/// A single mesh draw
#[derive(Debug, Clone, Copy)]
pub struct MeshDraw<'a> {
    /// Vertex buffer bound at binding 0, if the pipeline takes vertex input
    pub vertex_buffer: Option<BufferKey>,
    /// Index buffer and element width for indexed draws
    pub index_buffer: Option<(BufferKey, IndexType)>,
    /// Vertex or index count
    pub count: u32,
    /// Instance count
    pub instance_count: u32,
    /// Push constant bytes
    pub push_constants: &'a [u8],
}

impl<'a> MeshDraw<'a> {
    /// Non-indexed draw of `count` vertices
    pub const fn vertices(vertex_buffer: Option<BufferKey>, count: u32) -> Self {
        Self { vertex_buffer, index_buffer: None, count, instance_count: 1, push_constants: &[] }
    }

    /// Indexed draw of `count` indices
    pub const fn indexed(vertex_buffer: BufferKey, index_buffer: BufferKey, index_type: IndexType, count: u32) -> Self {
        Self {
            vertex_buffer: Some(vertex_buffer),
            index_buffer: Some((index_buffer, index_type)),
            count,
            instance_count: 1,
            push_constants: &[],
        }
    }

    /// Attach push constant bytes
    pub const fn with_push_constants(mut self, data: &'a [u8]) -> Self {
        self.push_constants = data;
        self
    }
}

/// Triangle geometry for a bottom-level acceleration structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// Buffer of `[f32; 3]` positions at offset 0 of each vertex
    pub vertex_buffer: BufferKey,
    /// Byte stride between vertices
    pub vertex_stride: u64,
    /// Number of vertices
    pub vertex_count: u32,
    /// Optional `u32` index buffer
    pub index_buffer: Option<BufferKey>,
    /// Number of triangles
    pub triangle_count: u32,
    /// Skip any-hit invocation
    pub opaque: bool,
}

/// One instance of a mesh in a ray tracing scene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtInstance {
    /// Instanced mesh
    pub mesh: RtMeshKey,
    /// Row-major 3x4 object-to-world transform
    pub transform: [[f32; 4]; 3],
    /// Value visible to shaders as the instance custom index (24 bits)
    pub custom_index: u32,
    /// Visibility mask
    pub mask: u8,
    /// Hit group offset into the shader binding table (24 bits)
    pub hit_group: u32,
}

impl RtInstance {
    /// Row-major identity transform
    pub const IDENTITY: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    /// An untransformed instance visible to every ray
    pub const fn new(mesh: RtMeshKey) -> Self {
        Self { mesh, transform: Self::IDENTITY, custom_index: 0, mask: 0xFF, hit_group: 0 }
    }
}

/// Per-frame information returned by `begin_record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frame-sync ring slot in use
    pub frame_index: usize,
    /// Acquired swapchain image index
    pub image_index: u32,
    /// Extent of the default framebuffer
    pub extent: Extent2D,
}

/// Presentation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// No vsync, may tear
    Immediate,
    /// Triple-buffered vsync
    Mailbox,
    /// Vsync
    Fifo,
    /// Vsync that tears when late
    FifoRelaxed,
}

/// Surface compositing alpha modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeAlpha {
    /// Alpha ignored
    Opaque,
    /// Premultiplied alpha
    PreMultiplied,
    /// Non-premultiplied alpha
    PostMultiplied,
    /// Platform decides
    Inherit,
}

/// Surface pre-transform, as raw transform bits reported by the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceTransform(pub u32);

impl SurfaceTransform {
    /// No transform
    pub const IDENTITY: Self = Self(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_bytes_decoded_little_endian() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000_u32.to_le_bytes());
        assert_eq!(ShaderSource::from_spirv_bytes(&bytes), Ok(ShaderSource::SpirV(vec![SPIRV_MAGIC, 0x0001_0000])));
        assert_eq!(ShaderSource::from_spirv_bytes(&bytes[..6]), Err(GfxError::BadShaderCode));
        assert_eq!(ShaderSource::from_spirv_bytes(&[0; 8]), Err(GfxError::BadShaderCode));
    }

    #[test]
    fn test_extent_zero() {
        assert!(Extent2D::new(0, 600).is_zero());
        assert!(Extent2D::new(800, 0).is_zero());
        assert!(!Extent2D::new(1, 1).is_zero());
    }

    #[test]
    fn test_extent_clamp() {
        let clamped = Extent2D::new(5000, 10).clamp(Extent2D::new(64, 64), Extent2D::new(4096, 4096));
        assert_eq!(clamped, Extent2D::new(4096, 64));
    }

    #[test]
    fn test_image_byte_size() {
        let info = ImageInfo::texture_2d(256, 256, Format::Rgba8Unorm);
        assert_eq!(info.byte_size(), 256 * 256 * 4);
        let float = ImageInfo::texture_2d(4, 4, Format::Rgba32Float);
        assert_eq!(float.byte_size(), 4 * 4 * 16);
    }

    #[test]
    fn test_resource_layout_counts() {
        let layout = ResourceLayout::default()
            .with_binding(0, BindingType::UniformBuffer)
            .with_binding(1, BindingType::SampledImage)
            .with_binding(2, BindingType::SampledImage)
            .with_push_constants(64);
        assert_eq!(layout.count(BindingType::SampledImage), 2);
        assert_eq!(layout.count(BindingType::StorageImage), 0);
        assert_eq!(layout.push_constant_size, 64);
    }
}
