use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Which {
    Base,
    Large,
}

impl Which {
    pub fn model_id(&self) -> &'static str {
        match self {
            Self::Base => "Salesforce/blip-image-captioning-base",
            Self::Large => "Salesforce/blip-image-captioning-large",
        }
    }

    /// The large checkpoint only ships safetensors on this PR branch.
    pub fn revision(&self) -> &'static str {
        match self {
            Self::Base => "main",
            Self::Large => "refs/pr/18",
        }
    }

    pub fn quantized_file(&self) -> &'static str {
        match self {
            Self::Base => "blip-image-captioning-base-q4k.gguf",
            Self::Large => "blip-image-captioning-large-q4k.gguf",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Serves BLIP image captions over HTTP")]
pub struct Config {
    #[arg(long, env = "CAPTION_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "CAPTION_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Which BLIP checkpoint to serve.
    #[arg(long, env = "CAPTION_MODEL", value_enum, default_value_t = Which::Base)]
    pub which: Which,

    /// Hub repository to fetch weights and tokenizer from, defaults to the one for `--which`.
    #[arg(long, env = "CAPTION_MODEL_ID")]
    pub model_id: Option<String>,

    #[arg(long, env = "CAPTION_REVISION")]
    pub revision: Option<String>,

    /// Local weights file, skips the hub download.
    #[arg(long, env = "CAPTION_WEIGHTS")]
    pub weights: Option<PathBuf>,

    /// Local tokenizer.json, skips the hub download.
    #[arg(long, env = "CAPTION_TOKENIZER")]
    pub tokenizer: Option<PathBuf>,

    /// Use the q4k quantized weights.
    #[arg(long, env = "CAPTION_QUANTIZED")]
    pub quantized: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long, env = "CAPTION_CPU")]
    pub cpu: bool,

    /// Maximum caption length in tokens, the leading [DEC] token included.
    #[arg(long, env = "CAPTION_MAX_LENGTH", default_value_t = 50)]
    pub max_length: usize,

    /// Model instances to load; bounds how many captions are generated at once.
    #[arg(long, env = "CAPTION_WORKERS", default_value_t = 1)]
    pub workers: usize,

    #[arg(long, env = "CAPTION_BODY_LIMIT_MB", default_value_t = 250)]
    pub body_limit_mb: usize,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_length < 2 {
            anyhow::bail!("max length must be at least 2, got {}", self.max_length);
        }
        if self.workers == 0 {
            anyhow::bail!("at least one worker is required");
        }
        Ok(())
    }

    pub fn model_id(&self) -> String {
        self.model_id
            .clone()
            .unwrap_or_else(|| self.which.model_id().to_string())
    }

    pub fn revision(&self) -> String {
        self.revision
            .clone()
            .unwrap_or_else(|| self.which.revision().to_string())
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(addr)
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit_mb * 1024 * 1024
    }
}
