use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use viva_core::scoring::{ScoringApi, ScoringMetadata, ScoringResponse};
use viva_core::{
    Command, PhaseController, SessionError, SessionState, SessionStatus, Speaker, TranscriptEntry,
    TranscriptStore,
};

use crate::input::{InputBackend, InputEvent, RetryPolicy, SpeechInputChannel};
use crate::playback::{AudioSink, OutputEvent, SpeechOutputQueue};
use crate::synth::SpeechSynthesizer;

/// Pause between the end of a phase utterance and resuming the microphone.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Session-level configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub interview_id: String,
    pub candidate_name: Option<String>,
    /// Directory for the best-effort local transcript backup. No backup is
    /// written when unset.
    pub backup_dir: Option<PathBuf>,
    pub settle_delay: Duration,
    pub retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(interview_id: impl Into<String>) -> Self {
        Self {
            interview_id: interview_id.into(),
            candidate_name: None,
            backup_dir: None,
            settle_delay: SETTLE_DELAY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything the session needs to talk to the outside world. Built per
/// session so concurrent sessions never share device handles.
pub struct ProviderSet {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Box<dyn AudioSink>,
    pub input: InputBackend,
}

/// The conversation orchestrator. Composes the playback queue, the input
/// channel, the phase controller, and the transcript store; never performs
/// I/O itself, only coordinates via commands and events.
pub struct ConversationSession {
    config: SessionConfig,
    state: SessionState,
    phases: PhaseController,
    transcript: TranscriptStore,
    output: Option<SpeechOutputQueue>,
    input: Option<SpeechInputChannel>,
    output_event_tx: mpsc::Sender<OutputEvent>,
    output_events: mpsc::Receiver<OutputEvent>,
    input_event_tx: mpsc::Sender<InputEvent>,
    input_events: mpsc::Receiver<InputEvent>,
    command_tx: mpsc::Sender<Command>,
    /// Set while a phase utterance is playing and listening should resume
    /// after the settle delay.
    resume_after_speech: bool,
    permission_failures: u32,
    started_at: Option<Instant>,
}

enum Pumped {
    Output(Option<OutputEvent>),
    Input(Option<InputEvent>),
}

impl ConversationSession {
    pub fn new(config: SessionConfig, command_tx: mpsc::Sender<Command>) -> Self {
        let (output_event_tx, output_events) = mpsc::channel(64);
        let (input_event_tx, input_events) = mpsc::channel(64);
        Self {
            config,
            state: SessionState::new(),
            phases: PhaseController::new(),
            transcript: TranscriptStore::new(),
            output: None,
            input: None,
            output_event_tx,
            output_events,
            input_event_tx,
            input_events,
            command_tx,
            resume_after_speech: false,
            permission_failures: 0,
            started_at: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    /// Initializes provider connections and enters the first phase. Fails
    /// with `Initialization` or `Permission` when a provider is unreachable
    /// or the microphone is refused; either leaves the session in `Error`.
    pub async fn start_call(&mut self, providers: ProviderSet) -> Result<(), SessionError> {
        if self.state.connected {
            return Err(SessionError::State("call already active".into()));
        }

        // A fresh call resets everything a previous run left behind.
        self.state = SessionState::new();
        self.phases = PhaseController::new();
        self.transcript = TranscriptStore::new();
        self.resume_after_speech = false;
        self.permission_failures = 0;
        self.state.status = SessionStatus::Connecting;

        let output = SpeechOutputQueue::spawn(
            providers.synthesizer,
            providers.sink,
            self.output_event_tx.clone(),
        );
        let input = match SpeechInputChannel::connect(
            providers.input,
            self.config.retry.clone(),
            self.input_event_tx.clone(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                output.shutdown().await;
                self.state.record_error(e.clone());
                return Err(e);
            }
        };

        self.output = Some(output);
        self.input = Some(input);
        self.state.status = SessionStatus::Connected;
        self.state.connected = true;
        self.started_at = Some(Instant::now());
        tracing::info!(interview_id = %self.config.interview_id, "call started");

        // Prime the interviewer backend with the first phase's instructions,
        // then open with its greeting.
        let _ = self
            .send_system_message(self.phases.current().system_prompt())
            .await;
        self.enter_phase().await;
        Ok(())
    }

    /// Tears down both components, releasing devices best-effort, and writes
    /// the local transcript backup.
    pub async fn stop_call(&mut self) {
        if let Some(input) = self.input.take() {
            input.shutdown().await;
        }
        if let Some(output) = self.output.take() {
            output.shutdown().await;
        }
        if let Some(dir) = &self.config.backup_dir {
            if let Err(e) = self.transcript.persist_locally(dir, &self.config.interview_id) {
                tracing::warn!("failed to persist local transcript backup: {e}");
            }
        }
        self.state.connected = false;
        self.state.listening = false;
        self.state.speaking = false;
        self.state.status = SessionStatus::Ended;
        tracing::info!(interview_id = %self.config.interview_id, "call ended");
    }

    /// Injects an out-of-band instruction for the interviewer backend.
    /// Produces no transcript entry.
    pub async fn send_system_message(
        &self,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        if !self.state.connected {
            return Err(SessionError::State("no active call".into()));
        }
        self.command_tx
            .send(Command::SystemMessage(text.into()))
            .await
            .map_err(|_| SessionError::State("runtime command channel closed".into()))
    }

    /// Mutes or unmutes the input channel without destroying it.
    pub async fn set_muted(&mut self, muted: bool) -> Result<(), SessionError> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| SessionError::State("no active call".into()))?;
        input.set_muted(muted).await?;
        self.state.muted = muted;
        Ok(())
    }

    /// Advances to the next phase. When the phase actually changes: frame the
    /// transition for the interviewer backend, stop listening, speak the
    /// opening utterance, and resume listening after the settle delay
    /// (skipped when the new phase is terminal).
    pub async fn next_phase(&mut self) -> Result<(), SessionError> {
        if !self.state.connected {
            return Err(SessionError::State("no active call".into()));
        }
        if !self.phases.advance() {
            return Ok(());
        }
        let framing = self.phases.transition_message();
        self.send_system_message(framing).await?;
        self.enter_phase().await;
        Ok(())
    }

    /// Speaks `text` as the interviewer, recording it in the transcript.
    pub async fn speak(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        if !self.state.connected {
            return Err(SessionError::State("no active call".into()));
        }
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| SessionError::State("no active call".into()))?;
        let text = text.into();
        self.transcript
            .append(TranscriptEntry::new(Speaker::Ai, text.clone()));
        self.state.speaking = true;
        self.state.status = SessionStatus::Speaking;
        output.speak(text).await
    }

    /// Drives one step of the event loop: waits for the next component event
    /// and folds it into session state. Returns `false` once both event
    /// streams have ended.
    pub async fn pump(&mut self) -> bool {
        let pumped = tokio::select! {
            event = self.output_events.recv() => Pumped::Output(event),
            event = self.input_events.recv() => Pumped::Input(event),
        };
        match pumped {
            Pumped::Output(Some(event)) => {
                self.handle_output_event(event).await;
                true
            }
            Pumped::Input(Some(event)) => {
                self.handle_input_event(event).await;
                true
            }
            Pumped::Output(None) | Pumped::Input(None) => false,
        }
    }

    /// Sends the transcript to the scoring collaborator. On failure the
    /// local backup (if configured) becomes the fallback record.
    pub async fn send_for_scoring<A: ScoringApi + Sync>(
        &self,
        api: &A,
    ) -> Result<ScoringResponse, SessionError> {
        let metadata = ScoringMetadata {
            candidate_name: self.config.candidate_name.clone(),
            duration: self
                .started_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            completed_phases: self.phases.completed_phases(),
        };
        match self
            .transcript
            .send_for_scoring(api, &self.config.interview_id, metadata)
            .await
        {
            Ok(scores) => Ok(scores),
            Err(e) => {
                if let Some(dir) = &self.config.backup_dir {
                    if let Err(backup_err) =
                        self.transcript.persist_locally(dir, &self.config.interview_id)
                    {
                        tracing::error!(
                            "local backup after scoring failure also failed: {backup_err}"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn enter_phase(&mut self) {
        let phase = self.phases.current();
        self.state.current_phase = phase;
        self.stop_listening().await;
        self.resume_after_speech = !phase.is_terminal();
        if let Err(e) = self.speak(phase.opening_line()).await {
            self.state.record_error(e);
        }
        if phase.is_terminal() {
            let _ = self
                .command_tx
                .send(Command::SessionComplete(phase.opening_line().to_string()))
                .await;
        }
    }

    async fn start_listening(&mut self) {
        if let Some(input) = &self.input {
            if input.start().await.is_ok() {
                self.state.listening = true;
                if self.state.connected {
                    self.state.status = SessionStatus::Listening;
                }
            }
        }
    }

    async fn stop_listening(&mut self) {
        if let Some(input) = &self.input {
            let _ = input.stop().await;
        }
        self.state.listening = false;
    }

    async fn handle_output_event(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::SpeakingStarted => {
                self.state.speaking = true;
                if self.state.connected {
                    self.state.status = SessionStatus::Speaking;
                }
                // A successful synthesis clears the previous speak failure.
                if self.state.error.as_ref().is_some_and(|e| !e.is_fatal()) {
                    self.state.clear_error();
                }
            }
            OutputEvent::SpeakingFinished => {
                self.state.speaking = false;
                self.state.volume_level = 0.0;
                if self.state.connected {
                    self.state.status = SessionStatus::Connected;
                }
                if self.resume_after_speech && self.state.connected {
                    self.resume_after_speech = false;
                    tokio::time::sleep(self.config.settle_delay).await;
                    self.start_listening().await;
                }
            }
            OutputEvent::Volume(level) => {
                self.state.volume_level = level;
            }
            OutputEvent::Failed(e) => {
                self.state.speaking = false;
                if self.state.connected {
                    self.state.status = SessionStatus::Connected;
                }
                self.state.record_error(e);
            }
        }
    }

    async fn handle_input_event(&mut self, event: InputEvent) {
        match event {
            InputEvent::Transcript {
                text,
                is_final,
                confidence,
            } => {
                if is_final {
                    self.transcript.append(TranscriptEntry::with_confidence(
                        Speaker::Candidate,
                        text,
                        confidence,
                    ));
                    self.state.interim_text.clear();
                } else {
                    self.state.interim_text = text;
                }
                // A flowing transcript clears the previous listen failure.
                if self.state.error.as_ref().is_some_and(|e| !e.is_fatal()) {
                    self.state.clear_error();
                }
            }
            InputEvent::Failed(e) => match &e {
                SessionError::Permission(_) => {
                    self.permission_failures += 1;
                    if self.permission_failures >= 2 {
                        self.state.record_error(e);
                    } else {
                        tracing::warn!(%e, "microphone permission failure");
                        self.state.error = Some(e);
                    }
                }
                _ => self.state.record_error(e),
            },
            InputEvent::Ended => {
                self.state.listening = false;
                if self.state.connected && self.state.status == SessionStatus::Listening {
                    self.state.status = SessionStatus::Connected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{MockMicrophoneSource, MockRecognizer, StreamingConfig};
    use crate::playback::{MockAudioSink, PLAYBACK_CHUNK};
    use crate::synth::MockSpeechSynthesizer;
    use viva_core::Phase;
    use viva_native_utils::audio::f32_to_pcm16;

    use std::time::Duration;
    use tokio::time::timeout;

    fn working_synthesizer() -> MockSpeechSynthesizer {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer.expect_synthesize().returning(|_| {
            Box::pin(async { Ok(f32_to_pcm16(&vec![0.1; PLAYBACK_CHUNK / 4])) })
        });
        synthesizer
    }

    fn instant_sink() -> MockAudioSink {
        let mut sink = MockAudioSink::new();
        sink.expect_write().returning(|_, _| Box::pin(async { Ok(()) }));
        sink.expect_stop().returning(|| Box::pin(async {}));
        sink
    }

    fn idle_recognizer() -> MockRecognizer {
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_start().returning(|| Box::pin(async { Ok(()) }));
        recognizer.expect_stop().returning(|| Box::pin(async {}));
        recognizer
            .expect_next_event()
            .returning(|| Box::pin(std::future::pending()));
        recognizer
    }

    fn providers(synthesizer: MockSpeechSynthesizer, sink: MockAudioSink) -> ProviderSet {
        ProviderSet {
            synthesizer: Arc::new(synthesizer),
            sink: Box::new(sink),
            input: InputBackend::Local(Box::new(idle_recognizer())),
        }
    }

    fn quick_config() -> SessionConfig {
        let mut config = SessionConfig::new("test-interview");
        config.settle_delay = Duration::from_millis(1);
        config
    }

    async fn pump_until_quiet(session: &mut ConversationSession) {
        while timeout(Duration::from_millis(200), session.pump())
            .await
            .is_ok()
        {}
    }

    #[tokio::test]
    async fn start_call_connects_and_speaks_the_opening_line() {
        let (command_tx, mut commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);

        session
            .start_call(providers(working_synthesizer(), instant_sink()))
            .await
            .unwrap();

        assert!(session.state().connected);
        assert_eq!(session.state().current_phase, Phase::Fit);
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(
            session.transcript().entries()[0].text,
            Phase::Fit.opening_line()
        );
        assert_eq!(session.transcript().entries()[0].speaker, Speaker::Ai);

        // The first phase's instructions went out as a system message.
        match commands.recv().await.unwrap() {
            Command::SystemMessage(text) => assert_eq!(text, Phase::Fit.system_prompt()),
            other => panic!("unexpected command: {other:?}"),
        }

        pump_until_quiet(&mut session).await;
        assert!(session.state().listening, "listening should resume after the greeting");
        session.stop_call().await;
        assert_eq!(session.state().status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn synthesis_failure_is_reported_without_ending_the_session() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        // The greeting works; the explicit speak fails.
        let mut calls = 0u32;
        synthesizer.expect_synthesize().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Box::pin(async { Ok(f32_to_pcm16(&vec![0.1; 64])) })
            } else {
                Box::pin(async {
                    Err(SessionError::Network("synthesis API returned 500".into()))
                })
            }
        });

        let (command_tx, _commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);
        session
            .start_call(providers(synthesizer, instant_sink()))
            .await
            .unwrap();
        pump_until_quiet(&mut session).await;

        session.speak("Hello").await.unwrap();
        pump_until_quiet(&mut session).await;

        assert!(matches!(session.state().error, Some(SessionError::Network(_))));
        assert!(!session.state().speaking);
        assert!(session.state().connected, "one failed speak must not end the session");
    }

    #[tokio::test]
    async fn final_transcripts_append_candidate_entries_and_clear_interim() {
        let (command_tx, _commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);
        session
            .start_call(providers(working_synthesizer(), instant_sink()))
            .await
            .unwrap();
        pump_until_quiet(&mut session).await;

        let events = session.input_event_tx.clone();
        events
            .send(InputEvent::Transcript {
                text: "I think".into(),
                is_final: false,
                confidence: None,
            })
            .await
            .unwrap();
        session.pump().await;
        assert_eq!(session.state().interim_text, "I think");

        events
            .send(InputEvent::Transcript {
                text: "I think two weighings".into(),
                is_final: true,
                confidence: Some(0.92),
            })
            .await
            .unwrap();
        session.pump().await;

        assert_eq!(session.state().interim_text, "");
        let last = session.transcript().entries().last().unwrap();
        assert_eq!(last.speaker, Speaker::Candidate);
        assert_eq!(last.text, "I think two weighings");
        assert_eq!(last.confidence, Some(0.92));
    }

    #[tokio::test]
    async fn next_phase_walks_the_sequence_and_completes() {
        let (command_tx, mut commands) = mpsc::channel(32);
        let mut session = ConversationSession::new(quick_config(), command_tx);
        session
            .start_call(providers(working_synthesizer(), instant_sink()))
            .await
            .unwrap();
        pump_until_quiet(&mut session).await;

        session.next_phase().await.unwrap();
        assert_eq!(session.state().current_phase, Phase::Tech);
        session.next_phase().await.unwrap();
        assert_eq!(session.state().current_phase, Phase::Brainteaser);
        session.next_phase().await.unwrap();
        assert_eq!(session.state().current_phase, Phase::Done);

        // A fourth advance is a no-op.
        session.next_phase().await.unwrap();
        assert_eq!(session.state().current_phase, Phase::Done);

        // Every phase entry left its opening line in the transcript.
        let texts: Vec<_> = session
            .transcript()
            .entries()
            .iter()
            .map(|e| e.text.clone())
            .collect();
        assert_eq!(
            texts,
            vec![
                Phase::Fit.opening_line().to_string(),
                Phase::Tech.opening_line().to_string(),
                Phase::Brainteaser.opening_line().to_string(),
                Phase::Done.opening_line().to_string(),
            ]
        );

        // The runtime saw the transition framings and the completion command.
        let mut saw_complete = false;
        let mut framings = 0;
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::SystemMessage(text) => {
                    if text.starts_with("PHASE TRANSITION") {
                        framings += 1;
                    }
                }
                Command::SessionComplete(_) => saw_complete = true,
            }
        }
        assert_eq!(framings, 3);
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn commands_require_an_active_call() {
        let (command_tx, _commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);

        assert!(matches!(
            session.speak("hello").await,
            Err(SessionError::State(_))
        ));
        assert!(matches!(
            session.send_system_message("hi").await,
            Err(SessionError::State(_))
        ));
        assert!(matches!(
            session.next_phase().await,
            Err(SessionError::State(_))
        ));
    }

    #[tokio::test]
    async fn microphone_permission_denied_fails_start_call() {
        let mut microphone = MockMicrophoneSource::new();
        microphone
            .expect_open()
            .returning(|| Err(SessionError::Permission("access refused".into())));
        microphone.expect_close().returning(|| ());

        let (command_tx, _commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);
        let providers = ProviderSet {
            synthesizer: Arc::new(working_synthesizer()),
            sink: Box::new(instant_sink()),
            input: InputBackend::Streaming {
                config: StreamingConfig::new("wss://unused.invalid", "key"),
                microphone: Box::new(microphone),
            },
        };

        let result = session.start_call(providers).await;
        assert!(matches!(result, Err(SessionError::Permission(_))));
        assert_eq!(session.state().status, SessionStatus::Error);
        assert!(!session.state().connected);
        assert!(!session.state().listening, "listening must never start");
        assert!(session.transcript().is_empty(), "no greeting without a call");
    }

    #[tokio::test]
    async fn set_muted_mirrors_into_state() {
        let (command_tx, _commands) = mpsc::channel(16);
        let mut session = ConversationSession::new(quick_config(), command_tx);
        session
            .start_call(providers(working_synthesizer(), instant_sink()))
            .await
            .unwrap();

        session.set_muted(true).await.unwrap();
        assert!(session.state().muted);
        session.set_muted(false).await.unwrap();
        assert!(!session.state().muted);
    }
}
