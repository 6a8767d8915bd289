//! Captioning engines.
//!
//! An engine is built once at startup and shared read-only by every request
//! through an `Arc<dyn CaptioningEngine>`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Backend, ServerConfig};
use crate::error::CaptionError;
use crate::upload::DecodedImage;

pub mod blip;
pub mod gemini;

pub use blip::BlipEngine;
pub use gemini::GeminiEngine;

#[async_trait]
pub trait CaptioningEngine: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Produces a caption for `image`.
    ///
    /// Implementations whose work is compute-bound must move it off the
    /// async executor themselves.
    async fn caption(&self, image: DecodedImage) -> Result<String, CaptionError>;
}

/// Builds the engine selected by `config`.
///
/// Loading local weights may download and memory-map several hundred
/// megabytes, so it runs on the blocking pool.
pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Arc<dyn CaptioningEngine>> {
    match config.backend {
        Backend::Blip => {
            let blip = config.blip();
            let engine = tokio::task::spawn_blocking(move || BlipEngine::load(&blip)).await??;
            Ok(Arc::new(engine))
        }
        Backend::Gemini => Ok(Arc::new(GeminiEngine::new(config.gemini()?))),
    }
}
