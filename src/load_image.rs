use candle_core::{DType, Device, Tensor};
use image::{ImageReader, ImageResult, RgbImage};
use std::io::Cursor;

pub const IMAGE_SIZE: u32 = 384;

const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

/// Decodes an uploaded payload into an RGB image. The format is sniffed from the bytes, the
/// declared content type is not trusted.
pub fn decode_image(bytes: &[u8]) -> ImageResult<RgbImage> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(img.to_rgb8())
}

/// Turns an RGB image into the (3, 384, 384) tensor BLIP expects. OpenAI normalization is
/// applied.
pub fn preprocess(img: &RgbImage, device: &Device) -> candle_core::Result<Tensor> {
    let img = image::imageops::resize(
        img,
        IMAGE_SIZE,
        IMAGE_SIZE,
        image::imageops::FilterType::CatmullRom,
    );
    let size = IMAGE_SIZE as usize;
    let data = img.into_raw();
    let data = Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?
        .to_device(device)
}
