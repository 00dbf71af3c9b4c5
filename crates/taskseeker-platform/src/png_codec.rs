use anyhow::{anyhow, Context, Result};
use taskseeker_core::CapturedImage;

pub fn encode_png_rgba(img: &CapturedImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut enc = png::Encoder::new(&mut out, img.width, img.height);
        enc.set_color(png::ColorType::Rgba);
        enc.set_depth(png::BitDepth::Eight);
        let mut writer = enc.write_header().context("png header write failed")?;
        writer
            .write_image_data(&img.rgba)
            .context("png image data write failed")?;
    }
    Ok(out)
}

/// Decodes any 8-bit PNG into tightly packed RGBA.
pub fn decode_png(bytes: &[u8]) -> Result<CapturedImage> {
    let mut decoder = png::Decoder::new(bytes);
    decoder.set_transformations(png::Transformations::EXPAND);
    let mut reader = decoder.read_info().context("png header read failed")?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).context("png frame read failed")?;
    if info.bit_depth != png::BitDepth::Eight {
        return Err(anyhow!("unsupported png bit depth: {:?}", info.bit_depth));
    }
    buf.truncate(info.buffer_size());

    let px = (info.width as usize) * (info.height as usize);
    let rgba = match info.color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => buf
            .chunks_exact(3)
            .flat_map(|c| [c[0], c[1], c[2], 255])
            .collect(),
        png::ColorType::Grayscale => buf.iter().flat_map(|&g| [g, g, g, 255]).collect(),
        png::ColorType::GrayscaleAlpha => buf
            .chunks_exact(2)
            .flat_map(|c| [c[0], c[0], c[0], c[1]])
            .collect(),
        png::ColorType::Indexed => {
            return Err(anyhow!("indexed png was not expanded"));
        }
    };
    if rgba.len() != px * 4 {
        return Err(anyhow!("decoded png has unexpected size"));
    }
    CapturedImage::new(info.width, info.height, rgba)
}

/// Grayscale plus a mild contrast stretch around the mean luminance.
/// Tesseract does noticeably better on screen captures after this.
pub fn enhance_for_ocr(img: &CapturedImage, contrast: f32) -> CapturedImage {
    let lum: Vec<f32> = img
        .rgba
        .chunks_exact(4)
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .collect();
    let mean = if lum.is_empty() {
        0.0
    } else {
        lum.iter().sum::<f32>() / lum.len() as f32
    };
    let rgba = lum
        .iter()
        .zip(img.rgba.chunks_exact(4))
        .flat_map(|(&l, p)| {
            let v = (mean + contrast * (l - mean)).round().clamp(0.0, 255.0) as u8;
            [v, v, v, p[3]]
        })
        .collect();
    CapturedImage {
        width: img.width,
        height: img.height,
        rgba,
    }
}
