//! Application Configuration Module
//!
//! Centralizes the configuration for the interview service. Settings load
//! from environment variables into a single shareable struct.

use std::env;
use std::path::PathBuf;

use tracing::Level;

// --- Application Constants ---

/// The size of each audio chunk sent from the microphone input stream.
pub const INPUT_CHUNK_SIZE: usize = 1024;
/// The latency for the output audio buffer in milliseconds. Must hold more
/// than one resampled playback chunk at any device rate.
pub const OUTPUT_LATENCY_MS: usize = 500;

/// Which speech-input implementation the session uses.
#[derive(Debug, Clone, PartialEq)]
pub enum InputProvider {
    /// On-device continuous recognition. Requires an engine supplied by the
    /// embedding application; this binary ships none.
    Local,
    /// Streaming recognition over the provider socket.
    Streaming,
}

const DEFAULT_RECOGNITION_URL: &str =
    "wss://api.deepgram.com/v1/listen?encoding=linear16&sample_rate=16000&language=en-US";
const DEFAULT_VOICE_ID: &str = "pNInz6obpgDQGcFmaJgB";
const DEFAULT_SCORING_URL: &str = "https://your-scoring-api.com";
const DEFAULT_BACKUP_DIR: &str = ".viva-backups";

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub elevenlabs_api_key: String,
    pub elevenlabs_voice_id: String,
    pub input_provider: InputProvider,
    pub deepgram_api_key: Option<String>,
    pub recognition_url: String,
    pub scoring_api_url: String,
    pub backup_dir: PathBuf,
    pub log_level: Level,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Unsupported input provider: {0}")]
    UnsupportedProvider(String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `ELEVENLABS_API_KEY`: Your secret key for the synthesis API. Required.
    // *   `ELEVENLABS_VOICE_ID`: (Optional) Voice to synthesize with.
    // *   `INPUT_PROVIDER`: "streaming" (default) or "local". The runtime
    //     rejects "local" at startup since this binary ships no on-device
    //     engine; embedders supply their own Recognizer instead.
    // *   `DEEPGRAM_API_KEY`: Your secret key for the recognition socket.
    //     Required when the input provider is "streaming".
    // *   `RECOGNITION_URL`: (Optional) Override for the recognition socket URL.
    // *   `SCORING_API_URL`: (Optional) Base URL of the scoring backend.
    // *   `BACKUP_DIR`: (Optional) Directory for local transcript backups.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. Useful for local development; ignored if absent.
        dotenvy::dotenv().ok();

        let provider_str = env::var("INPUT_PROVIDER").unwrap_or_else(|_| "streaming".to_string());
        let input_provider = match provider_str.to_lowercase().as_str() {
            "streaming" => InputProvider::Streaming,
            "local" => InputProvider::Local,
            other => return Err(ConfigError::UnsupportedProvider(other.to_string())),
        };

        let elevenlabs_api_key = env::var("ELEVENLABS_API_KEY")
            .map_err(|_| ConfigError::MissingVar("ELEVENLABS_API_KEY".to_string()))?;
        let elevenlabs_voice_id =
            env::var("ELEVENLABS_VOICE_ID").unwrap_or_else(|_| DEFAULT_VOICE_ID.to_string());

        let deepgram_api_key = env::var("DEEPGRAM_API_KEY").ok();
        if input_provider == InputProvider::Streaming && deepgram_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "DEEPGRAM_API_KEY must be set for the streaming input provider".to_string(),
            ));
        }

        let recognition_url =
            env::var("RECOGNITION_URL").unwrap_or_else(|_| DEFAULT_RECOGNITION_URL.to_string());
        let scoring_api_url =
            env::var("SCORING_API_URL").unwrap_or_else(|_| DEFAULT_SCORING_URL.to_string());
        let backup_dir = PathBuf::from(
            env::var("BACKUP_DIR").unwrap_or_else(|_| DEFAULT_BACKUP_DIR.to_string()),
        );

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            elevenlabs_api_key,
            elevenlabs_voice_id,
            input_provider,
            deepgram_api_key,
            recognition_url,
            scoring_api_url,
            backup_dir,
            log_level,
        })
    }
}
