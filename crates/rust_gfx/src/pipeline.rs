//! Pipeline descriptions and caller hooks
//!
//! Fixed-function state is plain data so both backends can consume it. Size
//! dependent parts (viewport, scissor) are recomputed through
//! [`PipelineHooks::on_resize`] whenever the owning framebuffer changes extent.

use crate::types::{Extent2D, FrameInfo, ResourceLayout, ShaderKey};

/// Vertex attribute component layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// One `f32`
    Float,
    /// Two `f32`
    Float2,
    /// Three `f32`
    Float3,
    /// Four `f32`
    Float4,
    /// Four normalized `u8`
    UByte4Norm,
}

impl VertexFormat {
    /// Attribute size in bytes
    pub const fn size(self) -> u32 {
        match self {
            Self::Float | Self::UByte4Norm => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }

    /// Component count
    pub const fn components(self) -> i32 {
        match self {
            Self::Float => 1,
            Self::Float2 => 2,
            Self::Float3 => 3,
            Self::Float4 | Self::UByte4Norm => 4,
        }
    }
}

/// One vertex attribute of binding 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location
    pub location: u32,
    /// Component layout
    pub format: VertexFormat,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Interleaved vertex layout; a zero stride means no vertex input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    /// Bytes per vertex
    pub stride: u32,
    /// Attributes in location order
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Layout with the given stride and no attributes yet
    pub fn new(stride: u32) -> Self {
        Self { stride, attributes: Vec::new() }
    }

    /// Append an attribute
    pub fn with_attribute(mut self, location: u32, format: VertexFormat, offset: u32) -> Self {
        self.attributes.push(VertexAttribute { location, format, offset });
        self
    }

    /// Whether the pipeline consumes a vertex buffer
    pub fn has_input(&self) -> bool {
        self.stride > 0 && !self.attributes.is_empty()
    }
}

/// Primitive assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    /// Independent triangles
    TriangleList,
    /// Triangle strip
    TriangleStrip,
    /// Independent lines
    LineList,
    /// Points
    PointList,
}

/// Rasterized polygon fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    /// Filled
    Fill,
    /// Wireframe
    Line,
}

/// Face culling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// Cull nothing
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    Back,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    /// Counter-clockwise triangles face front
    CounterClockwise,
    /// Clockwise triangles face front
    Clockwise,
}

/// Colour blending preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    /// Overwrite
    Opaque,
    /// Source-over alpha blending
    Alpha,
    /// Additive
    Additive,
}

/// Viewport rectangle with depth range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Left edge
    pub x: f32,
    /// Top edge
    pub y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
    /// Near depth
    pub min_depth: f32,
    /// Far depth
    pub max_depth: f32,
}

impl Viewport {
    /// Viewport covering the whole extent
    pub fn full(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Integer rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Rect2D {
    /// Rectangle covering the whole extent
    pub const fn full(extent: Extent2D) -> Self {
        Self { x: 0, y: 0, width: extent.width, height: extent.height }
    }
}

/// Fixed-function state baked into a graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedFunctionState {
    /// Primitive assembly
    pub topology: PrimitiveTopology,
    /// Fill mode
    pub polygon_mode: PolygonMode,
    /// Culling
    pub cull_mode: CullMode,
    /// Winding
    pub front_face: FrontFace,
    /// Depth test enabled
    pub depth_test: bool,
    /// Depth writes enabled
    pub depth_write: bool,
    /// Blending preset
    pub blend: BlendMode,
    /// Baked viewport (ignored when `dynamic_viewport`)
    pub viewport: Viewport,
    /// Baked scissor (ignored when `dynamic_viewport`)
    pub scissor: Rect2D,
    /// Viewport and scissor are set at bind time instead of baked
    pub dynamic_viewport: bool,
}

impl Default for FixedFunctionState {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_test: true,
            depth_write: true,
            blend: BlendMode::Opaque,
            viewport: Viewport::full(Extent2D::default()),
            scissor: Rect2D::default(),
            dynamic_viewport: false,
        }
    }
}

impl FixedFunctionState {
    /// Cover the whole extent with viewport and scissor
    pub fn fit_to(&mut self, extent: Extent2D) {
        self.viewport = Viewport::full(extent);
        self.scissor = Rect2D::full(extent);
    }
}

/// Pipeline flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Rasterization
    Graphics,
    /// Compute
    Compute,
    /// Hardware ray tracing
    RayTracing,
}

/// Caller-supplied callbacks attached to a pipeline.
///
/// Every method has a default, so an empty `impl` is a valid hook set.
pub trait PipelineHooks {
    /// Invoked when the pipeline is bound inside a frame
    fn on_bind(&mut self, _frame: &FrameInfo) {}

    /// Recompute size-dependent state before the pipeline is rebuilt for `extent`
    fn on_resize(&mut self, state: &mut FixedFunctionState, extent: Extent2D) {
        state.fit_to(extent);
    }

    /// Invoked once before the pipeline's backend objects are destroyed
    fn on_destroy(&mut self) {}
}

/// Hooks that only fit the viewport to the framebuffer
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl PipelineHooks for DefaultHooks {}

/// Graphics pipeline creation parameters
pub struct GraphicsPipelineInfo {
    /// Vertex shader
    pub vertex: ShaderKey,
    /// Fragment shader
    pub fragment: ShaderKey,
    /// Vertex input layout
    pub vertex_layout: VertexLayout,
    /// Fixed-function state
    pub state: FixedFunctionState,
    /// Descriptor bindings and push constants
    pub resources: ResourceLayout,
    /// Caller hooks
    pub hooks: Box<dyn PipelineHooks>,
}

impl GraphicsPipelineInfo {
    /// Pipeline with default state, no vertex input and default hooks
    pub fn new(vertex: ShaderKey, fragment: ShaderKey) -> Self {
        Self {
            vertex,
            fragment,
            vertex_layout: VertexLayout::default(),
            state: FixedFunctionState::default(),
            resources: ResourceLayout::default(),
            hooks: Box::new(DefaultHooks),
        }
    }

    /// Set the vertex layout
    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    /// Set the fixed-function state
    pub fn with_state(mut self, state: FixedFunctionState) -> Self {
        self.state = state;
        self
    }

    /// Set the resource layout
    pub fn with_resources(mut self, resources: ResourceLayout) -> Self {
        self.resources = resources;
        self
    }

    /// Set the hooks
    pub fn with_hooks(mut self, hooks: impl PipelineHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }
}

/// Compute pipeline creation parameters
pub struct ComputePipelineInfo {
    /// Compute shader
    pub shader: ShaderKey,
    /// Descriptor bindings and push constants
    pub resources: ResourceLayout,
    /// Caller hooks
    pub hooks: Box<dyn PipelineHooks>,
}

impl ComputePipelineInfo {
    /// Pipeline with default hooks
    pub fn new(shader: ShaderKey, resources: ResourceLayout) -> Self {
        Self { shader, resources, hooks: Box::new(DefaultHooks) }
    }
}

/// Ray tracing pipeline creation parameters.
///
/// Shader groups are laid out raygen first, then every miss shader, then one
/// triangle hit group per closest-hit shader.
pub struct RayTracingPipelineInfo {
    /// Ray generation shader
    pub raygen: ShaderKey,
    /// Miss shaders
    pub miss: Vec<ShaderKey>,
    /// Closest-hit shaders
    pub closest_hit: Vec<ShaderKey>,
    /// Descriptor bindings and push constants
    pub resources: ResourceLayout,
    /// Maximum trace recursion depth
    pub max_recursion_depth: u32,
    /// Caller hooks
    pub hooks: Box<dyn PipelineHooks>,
}

impl RayTracingPipelineInfo {
    /// Pipeline with a single recursion level and default hooks
    pub fn new(raygen: ShaderKey, miss: Vec<ShaderKey>, closest_hit: Vec<ShaderKey>, resources: ResourceLayout) -> Self {
        Self { raygen, miss, closest_hit, resources, max_recursion_depth: 1, hooks: Box::new(DefaultHooks) }
    }

    /// Total shader group count
    pub fn group_count(&self) -> u32 {
        (1 + self.miss.len() + self.closest_hit.len()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_to_extent() {
        let mut state = FixedFunctionState::default();
        state.fit_to(Extent2D::new(1280, 720));
        assert_relative_eq!(state.viewport.width, 1280.0);
        assert_relative_eq!(state.viewport.height, 720.0);
        assert_relative_eq!(state.viewport.max_depth, 1.0);
        assert_eq!(state.scissor, Rect2D { x: 0, y: 0, width: 1280, height: 720 });
    }

    #[test]
    fn test_default_hooks_fit_viewport() {
        let mut hooks = DefaultHooks;
        let mut state = FixedFunctionState::default();
        hooks.on_resize(&mut state, Extent2D::new(640, 480));
        assert_relative_eq!(state.viewport.width, 640.0);
        assert_relative_eq!(state.viewport.height, 480.0);
    }

    #[test]
    fn test_vertex_layout_input() {
        assert!(!VertexLayout::default().has_input());
        let layout = VertexLayout::new(20)
            .with_attribute(0, VertexFormat::Float3, 0)
            .with_attribute(1, VertexFormat::Float2, 12);
        assert!(layout.has_input());
        assert_eq!(layout.attributes[1].format.size(), 8);
    }
}
