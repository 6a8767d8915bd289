//! Raw uploads and the normalized pixel buffer handed to an engine.

use image::RgbImage;

use crate::error::CaptionError;

/// Bytes of a single uploaded file, as received.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub declared_content_type: Option<String>,
    pub file_name: Option<String>,
}

impl UploadedImage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            declared_content_type: None,
            file_name: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An 8-bit RGB image, whatever the source color model was.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    /// Decodes `upload`, sniffing the format from its contents.
    ///
    /// Palette, grayscale, alpha and 16-bit sources are all flattened to
    /// three 8-bit channels. Alpha is dropped, not composited.
    pub fn decode(upload: &UploadedImage) -> Result<Self, CaptionError> {
        if upload.is_empty() {
            return Err(CaptionError::Decode("upload is empty".to_string()));
        }

        let image = image::load_from_memory(&upload.bytes)?;
        Ok(Self {
            pixels: image.to_rgb8(),
        })
    }

    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_rgb(self) -> RgbImage {
        self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma, Rgba, RgbaImage};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn encode(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn grayscale_becomes_rgb() {
        let gray = GrayImage::from_pixel(4, 3, Luma([200]));
        let decoded =
            DecodedImage::decode(&UploadedImage::new(encode(DynamicImage::ImageLuma8(gray))))
                .unwrap();

        assert_eq!((decoded.width(), decoded.height()), (4, 3));
        assert_eq!(decoded.as_rgb().get_pixel(0, 0).0, [200, 200, 200]);
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let rgba = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 0]));
        let decoded =
            DecodedImage::decode(&UploadedImage::new(encode(DynamicImage::ImageRgba8(rgba))))
                .unwrap();

        assert_eq!(decoded.as_rgb().get_pixel(1, 1).0, [10, 20, 30]);
    }

    #[test]
    fn empty_upload_is_a_decode_error() {
        let err = DecodedImage::decode(&UploadedImage::new(Vec::new())).unwrap_err();
        assert!(matches!(err, CaptionError::Decode(_)));
    }

    #[test]
    fn truncated_png_is_a_decode_error() {
        let rgba = RgbaImage::from_pixel(16, 16, Rgba([1, 2, 3, 255]));
        let mut bytes = encode(DynamicImage::ImageRgba8(rgba));
        bytes.truncate(bytes.len() / 2);

        let err = DecodedImage::decode(&UploadedImage::new(bytes)).unwrap_err();
        assert!(matches!(err, CaptionError::Decode(_)));
    }

    proptest! {
        #[test]
        fn text_payloads_never_decode(body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut bytes = b"this is a text file, ".to_vec();
            bytes.extend(body);

            let result = DecodedImage::decode(&UploadedImage::new(bytes));
            prop_assert!(matches!(result, Err(CaptionError::Decode(_))));
        }
    }
}
