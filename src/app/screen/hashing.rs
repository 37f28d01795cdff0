use image::ImageFormat;
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use sha2::{Digest, Sha256};

pub const NO_XML_HASH: &str = "no_xml";
pub const NO_IMAGE_HASH: &str = "no_image";

/// sha256 hex of the page source.
pub fn structural_hash(xml: &str) -> String {
    if xml.is_empty() {
        return NO_XML_HASH.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(xml.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 8x8 double-gradient perceptual hash of a PNG screenshot, base64 encoded.
pub fn visual_hash(png_bytes: &[u8]) -> Result<String, String> {
    if png_bytes.is_empty() {
        return Ok(NO_IMAGE_HASH.to_string());
    }
    let img = image::load_from_memory_with_format(png_bytes, ImageFormat::Png)
        .map_err(|err| format!("Failed to decode screenshot: {err}"))?;
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    Ok(hasher.hash_image(&img).to_base64())
}

pub fn hamming_distance(lhs: &str, rhs: &str) -> u32 {
    let Ok(h1) = ImageHash::<Vec<u8>>::from_base64(lhs) else {
        return u32::MAX;
    };
    let Ok(h2) = ImageHash::<Vec<u8>>::from_base64(rhs) else {
        return u32::MAX;
    };
    h1.dist(&h2)
}

pub fn composite_fingerprint(xml_hash: &str, visual_hash: &str) -> String {
    format!("{xml_hash}_{visual_hash}")
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 3]) -> Vec<u8> {
    use std::io::Cursor;

    let img = image::RgbImage::from_fn(width, height, |x, y| image::Rgb(paint(x, y)));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}
