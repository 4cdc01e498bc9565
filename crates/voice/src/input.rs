use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use viva_core::SessionError;
use viva_native_utils::audio::f32_to_pcm16;

type WsWriter =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A transcription event surfaced by the input channel.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Transcript {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
    Failed(SessionError),
    /// The channel gave up listening (socket closed or restart budget spent).
    Ended,
}

#[derive(Debug)]
pub enum InputCommand {
    Start,
    Stop,
    SetMuted(bool),
    Shutdown,
}

/// An event from an in-process continuous recognition engine.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    Interim(String),
    Final {
        text: String,
        confidence: Option<f32>,
    },
}

// The `Recognizer` trait abstracts an on-device continuous recognition
// engine. The engine owns its own capture path; `start` fails with
// `Permission` when microphone access is refused, and `next_event` returning
// `None` means the engine stream ended.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait Recognizer: Send {
    async fn start(&mut self) -> Result<(), SessionError>;
    async fn stop(&mut self);
    async fn next_event(&mut self) -> Option<RecognizerEvent>;
}

// Owner of the capture device for the streaming backend. `open` acquires the
// microphone and returns the frame stream; `close` releases the device.
#[cfg_attr(test, automock)]
pub trait MicrophoneSource: Send {
    fn open(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, SessionError>;
    fn close(&mut self);
}

/// Bounded back-off for supervised recognizer restarts. An unsupervised
/// restart-on-every-end turns an engine that rejects immediately into a
/// tight failure loop; this caps it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Back-off before the given 1-based attempt, doubling per attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }
}

/// Connection parameters for the streaming recognition socket.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub url: String,
    pub api_key: String,
    pub sample_rate: u32,
    /// Cadence at which buffered microphone audio is flushed to the socket.
    pub frame_interval: Duration,
}

impl StreamingConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            sample_rate: 16_000,
            frame_interval: Duration::from_millis(250),
        }
    }
}

/// The speech-input implementation, chosen once at session start. Switching
/// requires recreating the channel.
pub enum InputBackend {
    /// On-device continuous recognition.
    Local(Box<dyn Recognizer>),
    /// Duplex streaming recognition over a provider socket.
    Streaming {
        config: StreamingConfig,
        microphone: Box<dyn MicrophoneSource>,
    },
}

/// Abstraction over an interim/final transcription source. Exactly one
/// channel is active per session.
pub struct SpeechInputChannel {
    command_tx: mpsc::Sender<InputCommand>,
    handle: JoinHandle<()>,
}

impl SpeechInputChannel {
    /// Connects the selected backend and spawns the channel task. Provider
    /// connection failures surface as `Initialization`; microphone
    /// acquisition failures as `Permission`.
    pub async fn connect(
        backend: InputBackend,
        retry: RetryPolicy,
        event_tx: mpsc::Sender<InputEvent>,
    ) -> Result<Self, SessionError> {
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = match backend {
            InputBackend::Local(recognizer) => {
                tokio::spawn(run_local(recognizer, retry, command_rx, event_tx))
            }
            InputBackend::Streaming {
                config,
                mut microphone,
            } => {
                let frames = microphone.open()?;
                let (write, read) = open_socket(&config).await?;
                tokio::spawn(run_streaming(
                    config, microphone, frames, write, read, command_rx, event_tx,
                ))
            }
        };
        Ok(Self { command_tx, handle })
    }

    /// Begins listening. A no-op while already listening.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.send(InputCommand::Start).await
    }

    /// Stops listening and releases the capture device. A no-op while not
    /// listening.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.send(InputCommand::Stop).await
    }

    /// Mutes or unmutes the channel without destroying it.
    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.send(InputCommand::SetMuted(muted)).await
    }

    /// Tears the channel down, releasing the capture device.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(InputCommand::Shutdown).await;
        let _ = self.handle.await;
    }

    async fn send(&self, command: InputCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionError::State("speech input channel is gone".into()))
    }
}

async fn open_socket(config: &StreamingConfig) -> Result<(WsWriter, WsReader), SessionError> {
    let mut request = config
        .url
        .clone()
        .into_client_request()
        .map_err(|e| SessionError::Initialization(format!("bad recognition url: {e}")))?;
    let auth = HeaderValue::from_str(&format!("Token {}", config.api_key))
        .map_err(|e| SessionError::Initialization(format!("bad recognition api key: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    let (stream, _) = connect_async(request).await.map_err(|e| {
        SessionError::Initialization(format!("recognition socket connect failed: {e}"))
    })?;
    tracing::info!("connected to streaming recognition socket");
    Ok(stream.split())
}

/// Inbound transcript message from the streaming provider. The transcript
/// may arrive at the top level or nested under `channel.alternatives[0]`.
#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    channel: Option<ChannelPayload>,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

impl TranscriptMessage {
    fn into_event(self) -> Option<InputEvent> {
        let (text, confidence) = match self.transcript {
            Some(text) => (text, self.confidence),
            None => {
                let alternative = self.channel?.alternatives.into_iter().next()?;
                (alternative.transcript, alternative.confidence.or(self.confidence))
            }
        };
        if text.trim().is_empty() {
            return None;
        }
        Some(InputEvent::Transcript {
            text,
            is_final: self.is_final,
            confidence,
        })
    }
}

enum LocalStep {
    Command(Option<InputCommand>),
    Event(Option<RecognizerEvent>),
}

async fn run_local(
    mut recognizer: Box<dyn Recognizer>,
    retry: RetryPolicy,
    mut command_rx: mpsc::Receiver<InputCommand>,
    event_tx: mpsc::Sender<InputEvent>,
) {
    let mut listening = false;
    let mut muted = false;
    let mut attempts: u32 = 0;

    loop {
        let step = tokio::select! {
            cmd = command_rx.recv() => LocalStep::Command(cmd),
            event = next_or_pending(recognizer.as_mut(), listening) => LocalStep::Event(event),
        };

        match step {
            LocalStep::Command(None) | LocalStep::Command(Some(InputCommand::Shutdown)) => break,
            LocalStep::Command(Some(InputCommand::Start)) => {
                if listening {
                    continue;
                }
                match recognizer.start().await {
                    Ok(()) => {
                        listening = true;
                        attempts = 0;
                    }
                    Err(e) => {
                        let _ = event_tx.send(InputEvent::Failed(e)).await;
                    }
                }
            }
            LocalStep::Command(Some(InputCommand::Stop)) => {
                if !listening {
                    continue;
                }
                listening = false;
                recognizer.stop().await;
            }
            LocalStep::Command(Some(InputCommand::SetMuted(m))) => muted = m,
            LocalStep::Event(Some(event)) => {
                attempts = 0;
                if muted {
                    continue;
                }
                let forwarded = match event {
                    RecognizerEvent::Interim(text) => InputEvent::Transcript {
                        text,
                        is_final: false,
                        confidence: None,
                    },
                    RecognizerEvent::Final { text, confidence } => InputEvent::Transcript {
                        text,
                        is_final: true,
                        confidence,
                    },
                };
                let _ = event_tx.send(forwarded).await;
            }
            LocalStep::Event(None) => {
                // The engine ended while we still want to listen: supervised
                // restart with a bounded budget.
                attempts += 1;
                if attempts > retry.max_attempts {
                    tracing::error!(
                        "recognizer restart budget exhausted after {} attempts",
                        retry.max_attempts
                    );
                    listening = false;
                    let _ = event_tx
                        .send(InputEvent::Failed(SessionError::Initialization(
                            "speech recognition keeps terminating".into(),
                        )))
                        .await;
                    let _ = event_tx.send(InputEvent::Ended).await;
                    continue;
                }
                let backoff = retry.backoff(attempts);
                tracing::warn!(attempt = attempts, ?backoff, "recognition ended unexpectedly; restarting");
                tokio::time::sleep(backoff).await;
                if let Err(e) = recognizer.start().await {
                    tracing::warn!("recognizer restart failed: {e}");
                }
            }
        }
    }

    recognizer.stop().await;
}

async fn next_or_pending(
    recognizer: &mut dyn Recognizer,
    listening: bool,
) -> Option<RecognizerEvent> {
    if listening {
        recognizer.next_event().await
    } else {
        std::future::pending().await
    }
}

enum StreamStep {
    Command(Option<InputCommand>),
    Frame(Option<Vec<f32>>),
    Flush,
    Inbound(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

async fn run_streaming(
    config: StreamingConfig,
    mut microphone: Box<dyn MicrophoneSource>,
    frames: mpsc::Receiver<Vec<f32>>,
    mut write: WsWriter,
    mut read: WsReader,
    mut command_rx: mpsc::Receiver<InputCommand>,
    event_tx: mpsc::Sender<InputEvent>,
) {
    let mut frames = Some(frames);
    let mut listening = false;
    let mut muted = false;
    let mut pending: Vec<f32> = Vec::new();
    let mut ticker = tokio::time::interval(config.frame_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            cmd = command_rx.recv() => StreamStep::Command(cmd),
            frame = recv_or_pending(&mut frames) => StreamStep::Frame(frame),
            _ = ticker.tick() => StreamStep::Flush,
            message = read.next() => StreamStep::Inbound(message),
        };

        match step {
            StreamStep::Command(None) | StreamStep::Command(Some(InputCommand::Shutdown)) => break,
            StreamStep::Command(Some(InputCommand::Start)) => {
                if listening {
                    continue;
                }
                // Reacquire the device when a previous stop released it.
                if frames.is_none() {
                    match microphone.open() {
                        Ok(rx) => frames = Some(rx),
                        Err(e) => {
                            let _ = event_tx.send(InputEvent::Failed(e)).await;
                            continue;
                        }
                    }
                }
                listening = true;
            }
            StreamStep::Command(Some(InputCommand::Stop)) => {
                if !listening {
                    continue;
                }
                listening = false;
                pending.clear();
                microphone.close();
                frames = None;
            }
            StreamStep::Command(Some(InputCommand::SetMuted(m))) => {
                muted = m;
                if muted {
                    pending.clear();
                }
            }
            StreamStep::Frame(Some(frame)) => {
                if listening && !muted {
                    pending.extend(frame);
                }
            }
            StreamStep::Frame(None) => {
                // Capture stream closed from the device side.
                frames = None;
            }
            StreamStep::Flush => {
                if listening && !muted && !pending.is_empty() {
                    let payload = f32_to_pcm16(&pending);
                    pending.clear();
                    if let Err(e) = write.send(Message::Binary(payload)).await {
                        let _ = event_tx
                            .send(InputEvent::Failed(SessionError::Network(format!(
                                "failed to send audio frame: {e}"
                            ))))
                            .await;
                    }
                }
            }
            StreamStep::Inbound(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<TranscriptMessage>(&text) {
                    Ok(message) => {
                        if let Some(event) = message.into_event() {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Err(e) => tracing::warn!("failed to parse transcript message: {e}"),
                }
            }
            StreamStep::Inbound(Some(Ok(Message::Close(reason)))) => {
                tracing::info!("recognition socket closed: {:?}", reason);
                let _ = event_tx.send(InputEvent::Ended).await;
                break;
            }
            StreamStep::Inbound(Some(Ok(_))) => {}
            StreamStep::Inbound(Some(Err(e))) => {
                let _ = event_tx
                    .send(InputEvent::Failed(SessionError::Network(format!(
                        "recognition socket error: {e}"
                    ))))
                    .await;
                let _ = event_tx.send(InputEvent::Ended).await;
                break;
            }
            StreamStep::Inbound(None) => {
                let _ = event_tx.send(InputEvent::Ended).await;
                break;
            }
        }
    }

    microphone.close();
    let _ = write.close().await;
}

async fn recv_or_pending(frames: &mut Option<mpsc::Receiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<InputEvent>) -> InputEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for input event")
            .expect("event channel closed")
    }

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(250));
        assert_eq!(retry.backoff(2), Duration::from_millis(500));
        assert_eq!(retry.backoff(3), Duration::from_secs(1));
        assert_eq!(retry.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn transcript_message_parses_top_level_shape() {
        let raw = r#"{"transcript": "I think two weighings", "is_final": true}"#;
        let message: TranscriptMessage = serde_json::from_str(raw).unwrap();
        match message.into_event() {
            Some(InputEvent::Transcript { text, is_final, confidence }) => {
                assert_eq!(text, "I think two weighings");
                assert!(is_final);
                assert!(confidence.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn transcript_message_parses_nested_alternatives() {
        let raw = r#"{
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.87}]},
            "is_final": false
        }"#;
        let message: TranscriptMessage = serde_json::from_str(raw).unwrap();
        match message.into_event() {
            Some(InputEvent::Transcript { text, is_final, confidence }) => {
                assert_eq!(text, "hello there");
                assert!(!is_final);
                assert_eq!(confidence, Some(0.87));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn empty_transcripts_are_ignored()  {
        let raw = r#"{"transcript": "   ", "is_final": true}"#;
        let message: TranscriptMessage = serde_json::from_str(raw).unwrap();
        assert!(message.into_event().is_none());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mut recognizer = MockRecognizer::new();
        recognizer
            .expect_start()
            .returning(|| Box::pin(async { Ok(()) }))
            .once();
        recognizer
            .expect_next_event()
            .returning(|| Box::pin(std::future::pending()));
        recognizer.expect_stop().returning(|| Box::pin(async {}));

        let (event_tx, _events) = mpsc::channel(8);
        let channel = SpeechInputChannel::connect(
            InputBackend::Local(Box::new(recognizer)),
            quick_retry(3),
            event_tx,
        )
        .await
        .unwrap();

        channel.start().await.unwrap();
        channel.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn stop_when_not_listening_is_a_noop() {
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_start().never();
        // Only the teardown stop fires; the command-level stop is swallowed.
        recognizer.expect_stop().returning(|| Box::pin(async {})).once();
        recognizer.expect_next_event().never();

        let (event_tx, mut events) = mpsc::channel(8);
        let channel = SpeechInputChannel::connect(
            InputBackend::Local(Box::new(recognizer)),
            quick_retry(3),
            event_tx,
        )
        .await
        .unwrap();

        channel.stop().await.unwrap();
        channel.shutdown().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn final_and_interim_events_are_forwarded() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_mock = calls.clone();
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_start().returning(|| Box::pin(async { Ok(()) }));
        recognizer.expect_stop().returning(|| Box::pin(async {}));
        recognizer.expect_next_event().returning(move || {
            let n = calls_in_mock.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match n {
                    0 => Some(RecognizerEvent::Interim("I think".into())),
                    1 => Some(RecognizerEvent::Final {
                        text: "I think two weighings".into(),
                        confidence: Some(0.9),
                    }),
                    _ => std::future::pending().await,
                }
            })
        });

        let (event_tx, mut events) = mpsc::channel(8);
        let channel = SpeechInputChannel::connect(
            InputBackend::Local(Box::new(recognizer)),
            quick_retry(3),
            event_tx,
        )
        .await
        .unwrap();
        channel.start().await.unwrap();

        match next_event(&mut events).await {
            InputEvent::Transcript { text, is_final: false, .. } => assert_eq!(text, "I think"),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            InputEvent::Transcript { text, is_final: true, confidence } => {
                assert_eq!(text, "I think two weighings");
                assert_eq!(confidence, Some(0.9));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn muted_channel_suppresses_events_until_unmuted() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_mock = calls.clone();
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_start().returning(|| Box::pin(async { Ok(()) }));
        recognizer.expect_stop().returning(|| Box::pin(async {}));
        recognizer.expect_next_event().returning(move || {
            let n = calls_in_mock.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                // Pace the stream so the mute command interleaves.
                tokio::time::sleep(Duration::from_millis(10)).await;
                if n < 20 {
                    Some(RecognizerEvent::Final {
                        text: format!("segment {n}"),
                        confidence: None,
                    })
                } else {
                    std::future::pending().await
                }
            })
        });

        let (event_tx, mut events) = mpsc::channel(64);
        let channel = SpeechInputChannel::connect(
            InputBackend::Local(Box::new(recognizer)),
            quick_retry(3),
            event_tx,
        )
        .await
        .unwrap();

        channel.set_muted(true).await.unwrap();
        channel.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err(), "muted channel forwarded a transcript");

        channel.set_muted(false).await.unwrap();
        match next_event(&mut events).await {
            InputEvent::Transcript { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn restart_budget_is_bounded() {
        let starts = Arc::new(AtomicU32::new(0));
        let starts_in_mock = starts.clone();
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_start().returning(move || {
            starts_in_mock.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });
        recognizer.expect_stop().returning(|| Box::pin(async {}));
        // The engine dies immediately on every attempt.
        recognizer
            .expect_next_event()
            .returning(|| Box::pin(async { None }));

        let (event_tx, mut events) = mpsc::channel(16);
        let channel = SpeechInputChannel::connect(
            InputBackend::Local(Box::new(recognizer)),
            quick_retry(2),
            event_tx,
        )
        .await
        .unwrap();
        channel.start().await.unwrap();

        match next_event(&mut events).await {
            InputEvent::Failed(SessionError::Initialization(_)) => {}
            other => panic!("expected a fatal failure, got {other:?}"),
        }
        match next_event(&mut events).await {
            InputEvent::Ended => {}
            other => panic!("expected the channel to end, got {other:?}"),
        }

        channel.shutdown().await;
        // One initial start plus at most `max_attempts` supervised restarts.
        assert!(starts.load(Ordering::SeqCst) <= 3);
    }
}
