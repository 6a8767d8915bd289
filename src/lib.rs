//! Image captioning over HTTP.
//!
//! A client uploads an image to `POST /generate_caption/` and receives
//! `{"caption": "..."}` or, on any failure, `{"error": "..."}`. The caption
//! comes from a [`CaptioningEngine`]: a local BLIP model by default, or the
//! hosted Gemini API.

pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod upload;

pub use config::ServerConfig;
pub use engine::CaptioningEngine;
pub use error::CaptionError;
pub use server::{router, CaptionResult, ErrorResult};
pub use upload::{DecodedImage, UploadedImage};
