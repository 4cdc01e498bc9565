pub mod input;
pub mod playback;
pub mod session;
pub mod synth;

pub use input::{InputBackend, InputEvent, RetryPolicy, SpeechInputChannel, StreamingConfig};
pub use playback::{AudioSink, AudioUnit, OutputEvent, SpeechOutputQueue};
pub use session::{ConversationSession, ProviderSet, SessionConfig};
pub use synth::{ElevenLabsSynthesizer, SpeechSynthesizer, VoiceSettings};
