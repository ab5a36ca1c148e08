//! Backend-neutral enums to GL constants

use crate::pipeline::{BlendMode, CullMode, FrontFace, PolygonMode, PrimitiveTopology, VertexFormat};
use crate::types::{AddressMode, Filter, Format, IndexType, ShaderStage};

/// Internal format, pixel format and pixel type of a texture format
pub(super) struct TextureFormat {
    pub internal: u32,
    pub format: u32,
    pub ty: u32,
}

pub(super) const fn texture_format(format: Format) -> TextureFormat {
    let (internal, format, ty) = match format {
        Format::R8Unorm => (glow::R8, glow::RED, glow::UNSIGNED_BYTE),
        Format::Rg8Unorm => (glow::RG8, glow::RG, glow::UNSIGNED_BYTE),
        Format::Rgba8Unorm => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
        Format::Rgba8Srgb => (glow::SRGB8_ALPHA8, glow::RGBA, glow::UNSIGNED_BYTE),
        Format::Bgra8Unorm => (glow::RGBA8, glow::BGRA, glow::UNSIGNED_BYTE),
        Format::Bgra8Srgb => (glow::SRGB8_ALPHA8, glow::BGRA, glow::UNSIGNED_BYTE),
        Format::Rgba16Float => (glow::RGBA16F, glow::RGBA, glow::HALF_FLOAT),
        Format::R32Float => (glow::R32F, glow::RED, glow::FLOAT),
        Format::Rgba32Float => (glow::RGBA32F, glow::RGBA, glow::FLOAT),
        Format::D32Float => (glow::DEPTH_COMPONENT32F, glow::DEPTH_COMPONENT, glow::FLOAT),
    };
    TextureFormat { internal, format, ty }
}

/// GL shader type, or `None` for stages GL has no equivalent of
pub(super) const fn shader_stage(stage: ShaderStage) -> Option<u32> {
    match stage {
        ShaderStage::Vertex => Some(glow::VERTEX_SHADER),
        ShaderStage::Fragment => Some(glow::FRAGMENT_SHADER),
        ShaderStage::Compute => Some(glow::COMPUTE_SHADER),
        ShaderStage::RayGen | ShaderStage::Miss | ShaderStage::ClosestHit => None,
    }
}

/// Component count, component type and normalization of a vertex attribute
pub(super) const fn vertex_format(format: VertexFormat) -> (i32, u32, bool) {
    match format {
        VertexFormat::Float => (1, glow::FLOAT, false),
        VertexFormat::Float2 => (2, glow::FLOAT, false),
        VertexFormat::Float3 => (3, glow::FLOAT, false),
        VertexFormat::Float4 => (4, glow::FLOAT, false),
        VertexFormat::UByte4Norm => (4, glow::UNSIGNED_BYTE, true),
    }
}

pub(super) const fn topology(topology: PrimitiveTopology) -> u32 {
    match topology {
        PrimitiveTopology::TriangleList => glow::TRIANGLES,
        PrimitiveTopology::TriangleStrip => glow::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => glow::LINES,
        PrimitiveTopology::PointList => glow::POINTS,
    }
}

pub(super) const fn polygon_mode(mode: PolygonMode) -> u32 {
    match mode {
        PolygonMode::Fill => glow::FILL,
        PolygonMode::Line => glow::LINE,
    }
}

/// Face to cull, or `None` when culling is off
pub(super) const fn cull_face(mode: CullMode) -> Option<u32> {
    match mode {
        CullMode::None => None,
        CullMode::Front => Some(glow::FRONT),
        CullMode::Back => Some(glow::BACK),
    }
}

pub(super) const fn front_face(face: FrontFace) -> u32 {
    match face {
        FrontFace::CounterClockwise => glow::CCW,
        FrontFace::Clockwise => glow::CW,
    }
}

/// Source and destination blend factors, or `None` for opaque output
pub(super) const fn blend(mode: BlendMode) -> Option<(u32, u32)> {
    match mode {
        BlendMode::Opaque => None,
        BlendMode::Alpha => Some((glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA)),
        BlendMode::Additive => Some((glow::SRC_ALPHA, glow::ONE)),
    }
}

pub(super) const fn index_type(index_type: IndexType) -> u32 {
    match index_type {
        IndexType::U16 => glow::UNSIGNED_SHORT,
        IndexType::U32 => glow::UNSIGNED_INT,
    }
}

pub(super) const fn filter(filter: Filter) -> i32 {
    (match filter {
        Filter::Nearest => glow::NEAREST,
        Filter::Linear => glow::LINEAR,
    }) as i32
}

pub(super) const fn address_mode(mode: AddressMode) -> i32 {
    (match mode {
        AddressMode::Repeat => glow::REPEAT,
        AddressMode::MirroredRepeat => glow::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => glow::CLAMP_TO_EDGE,
    }) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_tracing_stages_have_no_gl_type() {
        assert_eq!(shader_stage(ShaderStage::Compute), Some(glow::COMPUTE_SHADER));
        assert_eq!(shader_stage(ShaderStage::RayGen), None);
        assert_eq!(shader_stage(ShaderStage::ClosestHit), None);
    }

    #[test]
    fn test_depth_format_is_depth_component() {
        let depth = texture_format(Format::D32Float);
        assert_eq!(depth.format, glow::DEPTH_COMPONENT);
        assert_eq!(texture_format(Format::Rgba8Srgb).internal, glow::SRGB8_ALPHA8);
    }
}
