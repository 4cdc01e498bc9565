use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;

use viva_core::SessionError;

/// Sample rate of the PCM payload requested from the synthesis provider.
pub const SYNTH_SAMPLE_RATE: u32 = 16_000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Voice tuning parameters forwarded to the synthesis provider.
#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
        }
    }
}

// The `SpeechSynthesizer` trait is the seam between the playback queue and
// whichever text-to-speech provider backs it. Implementations return raw
// little-endian PCM16 audio at `SYNTH_SAMPLE_RATE`; the queue owns decoding
// and playback. In tests, `mockall`'s `MockSpeechSynthesizer` stands in for
// the network.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SessionError>;
}

/// HTTP client for the ElevenLabs text-to-speech API.
pub struct ElevenLabsSynthesizer {
    client: Client,
    api_key: String,
    voice_id: String,
    settings: VoiceSettings,
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            voice_id: voice_id.into(),
            settings: VoiceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: VoiceSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SessionError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=pcm_16000",
            self.voice_id
        );
        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_monolingual_v1",
            "voice_settings": {
                "stability": self.settings.stability,
                "similarity_boost": self.settings.similarity_boost,
            },
        });

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("synthesis request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SessionError::Network(format!(
                "synthesis API returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SessionError::Network(format!("failed to read audio payload: {e}")))?;
        tracing::debug!(bytes = bytes.len(), "received synthesized audio");
        Ok(bytes.to_vec())
    }
}
