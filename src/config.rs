//! Process configuration.
//!
//! Values come from CLI flags, then environment variables (a `.env` file is
//! loaded by `main` before parsing), then defaults.

use std::net::{IpAddr, SocketAddr};

use clap::{Parser, ValueEnum};

/// Command-line / environment configuration for the caption server.
#[derive(Parser, Debug, Clone)]
#[command(name = "blip-caption-server")]
#[command(about = "Upload an image, get a caption back")]
#[command(version)]
pub struct ServerConfig {
    /// Address to bind (all interfaces by default)
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', default_value_t = 8000, env = "PORT")]
    pub port: u16,

    /// Which captioning engine serves requests
    #[arg(long, value_enum, default_value = "blip", env = "CAPTION_BACKEND")]
    pub backend: Backend,

    /// Compute device for the local model
    #[arg(long, value_enum, default_value = "auto", env = "CAPTION_DEVICE")]
    pub device: DevicePreference,

    /// Hugging Face repository with the BLIP weights and tokenizer.
    ///
    /// The layout is read from the repository's `config.json`; if that is
    /// missing or unreadable the large captioning layout is assumed. For
    /// `Salesforce/blip-image-captioning-base` pass `--model-revision main`.
    #[arg(
        long,
        default_value = "Salesforce/blip-image-captioning-large",
        env = "CAPTION_MODEL_ID"
    )]
    pub model_id: String,

    /// Repository revision holding `model.safetensors` and `config.json`
    #[arg(long, default_value = "refs/pr/18", env = "CAPTION_MODEL_REVISION")]
    pub model_revision: String,

    /// Upper bound on generated caption tokens
    #[arg(long, default_value_t = 20, env = "CAPTION_MAX_TOKENS")]
    pub max_caption_tokens: usize,

    /// API key for the hosted Gemini backend
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Hosted model used by the Gemini backend
    #[arg(long, default_value = "gemini-2.5-flash", env = "GEMINI_MODEL")]
    pub gemini_model: String,

    /// Root of the Gemini REST API
    #[arg(
        long,
        default_value = "https://generativelanguage.googleapis.com/v1beta",
        env = "GEMINI_BASE_URL"
    )]
    pub gemini_base_url: String,

    /// Largest request body accepted, in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "CAPTION_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: usize,

    /// Report failures with 4xx/5xx instead of 200
    #[arg(long, default_value_t = false, env = "CAPTION_STRICT_STATUS")]
    pub strict_status: bool,

    /// Allowed CORS origins, comma separated; empty allows every origin
    #[arg(long, value_delimiter = ',', env = "CAPTION_CORS_ORIGINS")]
    pub cors_origins: Vec<String>,
}

/// Captioning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Local BLIP model running on candle
    Blip,
    /// Google Gemini over HTTPS
    Gemini,
}

/// Where the local model runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DevicePreference {
    /// First available accelerator, else CPU
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Settings for the local BLIP engine.
#[derive(Debug, Clone)]
pub struct BlipConfig {
    pub model_id: String,
    pub revision: String,
    pub device: DevicePreference,
    pub max_caption_tokens: usize,
}

/// Settings for the hosted Gemini engine.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Settings the HTTP layer needs.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_upload_bytes: usize,
    pub strict_status: bool,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            strict_status: false,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn blip(&self) -> BlipConfig {
        BlipConfig {
            model_id: self.model_id.clone(),
            revision: self.model_revision.clone(),
            device: self.device,
            max_caption_tokens: self.max_caption_tokens,
        }
    }

    /// Gemini settings; fails when no API key was supplied.
    pub fn gemini(&self) -> anyhow::Result<GeminiConfig> {
        let api_key = self
            .gemini_api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY must be set for the gemini backend"))?;

        Ok(GeminiConfig {
            api_key,
            model: self.gemini_model.clone(),
            base_url: self.gemini_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn http(&self) -> HttpConfig {
        HttpConfig {
            max_upload_bytes: self.max_upload_bytes,
            strict_status: self.strict_status,
            cors_origins: self
                .cors_origins
                .iter()
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
        }
    }
}
