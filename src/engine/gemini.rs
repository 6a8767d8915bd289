//! Hosted captioning through the Google Gemini `generateContent` API.

use std::io::Cursor;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageOutputFormat};
use tracing::debug;

use super::CaptioningEngine;
use crate::config::GeminiConfig;
use crate::error::CaptionError;
use crate::upload::DecodedImage;

const CAPTION_PROMPT: &str =
    "Write a short, single-sentence caption describing this image. Reply with the caption only.";

const JPEG_QUALITY: u8 = 85;

pub struct GeminiEngine {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiEngine {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        )
    }
}

/// Re-encodes the image as JPEG and wraps it in base64 for `inline_data`.
fn encode_jpeg_base64(image: DecodedImage) -> Result<String, CaptionError> {
    let mut jpeg_bytes = Vec::new();
    DynamicImage::ImageRgb8(image.into_rgb())
        .write_to(
            &mut Cursor::new(&mut jpeg_bytes),
            ImageOutputFormat::Jpeg(JPEG_QUALITY),
        )
        .map_err(|e| CaptionError::Inference(format!("failed to re-encode image: {e}")))?;

    Ok(general_purpose::STANDARD.encode(&jpeg_bytes))
}

#[async_trait]
impl CaptioningEngine for GeminiEngine {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn caption(&self, image: DecodedImage) -> Result<String, CaptionError> {
        let image_base64 = tokio::task::spawn_blocking(move || encode_jpeg_base64(image))
            .await
            .map_err(|e| CaptionError::Inference(format!("encoding worker failed: {e}")))??;

        let payload = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": CAPTION_PROMPT },
                    {
                        "inline_data": {
                            "mime_type": "image/jpeg",
                            "data": image_base64
                        }
                    }
                ]
            }]
        });

        debug!(model = %self.config.model, "sending caption request to Gemini");

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| CaptionError::Inference(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| CaptionError::Inference(format!("Gemini response unreadable: {e}")))?;

        if !status.is_success() {
            let excerpt: String = response_text.chars().take(500).collect();
            return Err(CaptionError::Inference(format!(
                "Gemini API error {status}: {excerpt}"
            )));
        }

        let result: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| CaptionError::Inference(format!("Gemini returned invalid JSON: {e}")))?;

        result["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|caption| caption.trim().to_string())
            .ok_or_else(|| CaptionError::Inference("no caption in Gemini response".to_string()))
    }
}
