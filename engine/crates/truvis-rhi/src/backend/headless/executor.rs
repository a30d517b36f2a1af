//! 在 CPU 上执行解析后的命令
//!
//! 只模拟会改变内存内容的命令（copy、fill、clear）；draw 和 dispatch 只记录到 trace 中。

use crate::backend::headless::{HeadlessObject, HeadlessShared};
use crate::backend::{MemoryBinding, ObjectId, ResolvedAttachment, ResolvedCommand};
use crate::commands::command::{ClearValue, LoadOp};
use crate::error::{RhiError, RhiResult};
use crate::resource::desc::{Format, ImageDesc};

/// 一次 clear 对应的 texel 字节
pub(crate) fn encode_clear(format: Format, value: ClearValue) -> Vec<u8> {
    let unorm8 = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match (format, value) {
        (Format::R8Unorm, ClearValue::Color(c)) => vec![unorm8(c[0])],
        (Format::Rg8Unorm, ClearValue::Color(c)) => vec![unorm8(c[0]), unorm8(c[1])],
        (Format::Rgba8Unorm | Format::Rgba8Srgb, ClearValue::Color(c)) => c.iter().map(|v| unorm8(*v)).collect(),
        (Format::Bgra8Unorm | Format::Bgra8Srgb, ClearValue::Color(c)) => {
            vec![unorm8(c[2]), unorm8(c[1]), unorm8(c[0]), unorm8(c[3])]
        }
        (Format::R32Float, ClearValue::Color(c)) => c[0].to_le_bytes().to_vec(),
        (Format::Rg32Float, ClearValue::Color(c)) => c[..2].iter().flat_map(|v| v.to_le_bytes()).collect(),
        (Format::Rgba32Float, ClearValue::Color(c)) => c.iter().flat_map(|v| v.to_le_bytes()).collect(),
        (Format::R32Uint, ClearValue::Color(c)) => (c[0] as u32).to_le_bytes().to_vec(),
        (Format::D32Float, ClearValue::DepthStencil { depth, .. }) => depth.to_le_bytes().to_vec(),
        (Format::D16Unorm, ClearValue::DepthStencil { depth, .. }) => {
            ((depth.clamp(0.0, 1.0) * 65535.0).round() as u16).to_le_bytes().to_vec()
        }
        (Format::D24UnormS8Uint, ClearValue::DepthStencil { depth, stencil }) => {
            let d = (depth.clamp(0.0, 1.0) * 16_777_215.0).round() as u32;
            (d | (stencil & 0xff) << 24).to_le_bytes().to_vec()
        }
        // half float 格式只模拟清零
        (format, _) => vec![0; format.texel_size() as usize],
    }
}

fn buffer_binding(shared: &HeadlessShared, object: ObjectId) -> RhiResult<MemoryBinding> {
    match shared.objects.read().get(&object) {
        Some(HeadlessObject::Buffer { binding }) => Ok(*binding),
        other => Err(RhiError::Backend(format!("{object:?} is not a buffer: {other:?}"))),
    }
}

fn image_binding(shared: &HeadlessShared, object: ObjectId) -> RhiResult<(MemoryBinding, ImageDesc)> {
    match shared.objects.read().get(&object) {
        Some(HeadlessObject::Image { binding, desc }) => Ok((*binding, desc.clone())),
        other => Err(RhiError::Backend(format!("{object:?} is not an image: {other:?}"))),
    }
}

fn clear_image(shared: &HeadlessShared, image: ObjectId, value: ClearValue) -> RhiResult<()> {
    let (binding, desc) = image_binding(shared, image)?;
    let texel = encode_clear(desc.format, value);
    shared.memory.lock().fill(binding, 0, desc.base_level_size(), &texel)
}

fn load_attachment(shared: &HeadlessShared, attachment: &ResolvedAttachment) -> RhiResult<()> {
    match attachment.load {
        LoadOp::Clear(value) => clear_image(shared, attachment.image, value),
        LoadOp::Load | LoadOp::DontCare => Ok(()),
    }
}

pub(crate) fn execute(shared: &HeadlessShared, commands: &[ResolvedCommand]) -> RhiResult<()> {
    for command in commands {
        match command {
            ResolvedCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = buffer_binding(shared, *src)?;
                let dst = buffer_binding(shared, *dst)?;
                shared.memory.lock().copy(src, *src_offset, dst, *dst_offset, *size)?;
            }
            ResolvedCommand::CopyBufferToImage { src, src_offset, dst } => {
                let src = buffer_binding(shared, *src)?;
                let (dst, desc) = image_binding(shared, *dst)?;
                shared.memory.lock().copy(src, *src_offset, dst, 0, desc.base_level_size())?;
            }
            ResolvedCommand::CopyImageToBuffer { src, dst, dst_offset } => {
                let (src, desc) = image_binding(shared, *src)?;
                let dst = buffer_binding(shared, *dst)?;
                shared.memory.lock().copy(src, 0, dst, *dst_offset, desc.base_level_size())?;
            }
            ResolvedCommand::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => {
                let dst = buffer_binding(shared, *dst)?;
                shared.memory.lock().fill(dst, *offset, *size, &value.to_le_bytes())?;
            }
            ResolvedCommand::ClearImage { image, value } => clear_image(shared, *image, *value)?,
            ResolvedCommand::BeginRendering { color, depth, .. } => {
                for attachment in color.iter().chain(depth.iter()) {
                    load_attachment(shared, attachment)?;
                }
            }
            // 其余命令不改变内存
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_clear() {
        assert_eq!(encode_clear(Format::Rgba8Unorm, ClearValue::Color([1.0, 0.0, 0.5, 1.0])), vec![255, 0, 128, 255]);
        assert_eq!(encode_clear(Format::Bgra8Unorm, ClearValue::Color([1.0, 0.0, 0.0, 1.0])), vec![0, 0, 255, 255]);
        assert_eq!(
            encode_clear(Format::D32Float, ClearValue::DepthStencil { depth: 1.0, stencil: 0 }),
            1.0f32.to_le_bytes().to_vec()
        );
        assert_eq!(encode_clear(Format::Rgba16Float, ClearValue::Color([1.0; 4])).len(), 8);
    }
}
