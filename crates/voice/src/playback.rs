use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use viva_core::SessionError;
use viva_native_utils::audio::pcm16_to_f32;

use crate::synth::{SpeechSynthesizer, SYNTH_SAMPLE_RATE};

/// Samples handed to the sink per write. Small enough that a stop lands
/// quickly, large enough to keep the device fed.
pub const PLAYBACK_CHUNK: usize = 4096;

/// An opaque decoded audio payload ready for playback. Owned exclusively by
/// the playback queue until played, then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioUnit {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioUnit {
    /// Decodes a provider PCM16 payload. Odd-length payloads are malformed.
    pub fn from_pcm16(bytes: &[u8], sample_rate: u32) -> Result<Self, SessionError> {
        if bytes.is_empty() || bytes.len() % 2 != 0 {
            return Err(SessionError::Network(format!(
                "malformed audio payload ({} bytes)",
                bytes.len()
            )));
        }
        Ok(Self {
            samples: pcm16_to_f32(bytes),
            sample_rate,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

// The `AudioSink` trait wraps the session's single audio-output resource.
// `write` returns once the chunk has been played; `stop` discards whatever
// is still buffered in the device. The real implementation lives in the
// service binary on top of cpal; tests use `MockAudioSink`.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait AudioSink: Send {
    async fn write(&mut self, samples: &[f32], sample_rate: u32) -> Result<(), SessionError>;
    async fn stop(&mut self);
}

#[derive(Debug)]
pub enum OutputCommand {
    Speak(String),
    Stop,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    SpeakingStarted,
    SpeakingFinished,
    /// RMS level of the chunk currently being played.
    Volume(f32),
    Failed(SessionError),
}

/// Sequential text-to-speech playback. Synthesis results are decoded into
/// `AudioUnit`s and played strictly in enqueue order; units never overlap.
pub struct SpeechOutputQueue {
    command_tx: mpsc::Sender<OutputCommand>,
    handle: JoinHandle<()>,
}

impl SpeechOutputQueue {
    pub fn spawn(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Box<dyn AudioSink>,
        event_tx: mpsc::Sender<OutputEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = tokio::spawn(run(synthesizer, sink, command_rx, event_tx));
        Self { command_tx, handle }
    }

    /// Requests synthesis and playback of `text`. If nothing is playing,
    /// playback starts immediately; otherwise the unit waits its turn.
    pub async fn speak(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.command_tx
            .send(OutputCommand::Speak(text.into()))
            .await
            .map_err(|_| SessionError::State("speech output queue is gone".into()))
    }

    /// Clears the queue and halts any in-progress playback immediately.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.command_tx
            .send(OutputCommand::Stop)
            .await
            .map_err(|_| SessionError::State("speech output queue is gone".into()))
    }

    /// Tears the queue down, releasing the audio-output resource.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(OutputCommand::Shutdown).await;
        let _ = self.handle.await;
    }
}

enum Step {
    Command(Option<OutputCommand>),
    Wrote(Result<(), SessionError>),
}

async fn run(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    mut sink: Box<dyn AudioSink>,
    mut command_rx: mpsc::Receiver<OutputCommand>,
    event_tx: mpsc::Sender<OutputEvent>,
) {
    let mut queue: VecDeque<AudioUnit> = VecDeque::new();
    // The unit being played and the playback position within it.
    let mut current: Option<(AudioUnit, usize)> = None;

    loop {
        let step = tokio::select! {
            cmd = command_rx.recv() => Step::Command(cmd),
            result = write_chunk(sink.as_mut(), current.as_ref()) => Step::Wrote(result),
        };

        match step {
            Step::Command(None) | Step::Command(Some(OutputCommand::Shutdown)) => break,
            Step::Command(Some(OutputCommand::Speak(text))) => {
                match synthesize_unit(synthesizer.as_ref(), &text).await {
                    Ok(unit) => {
                        let was_idle = current.is_none() && queue.is_empty();
                        tracing::debug!(duration = ?unit.duration(), "queueing audio unit");
                        queue.push_back(unit);
                        if was_idle {
                            let _ = event_tx.send(OutputEvent::SpeakingStarted).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("speech synthesis failed: {e}");
                        let _ = event_tx.send(OutputEvent::Failed(e)).await;
                    }
                }
            }
            Step::Command(Some(OutputCommand::Stop)) => {
                let interrupted = current.take().is_some() || !queue.is_empty();
                queue.clear();
                sink.stop().await;
                if interrupted {
                    let _ = event_tx.send(OutputEvent::SpeakingFinished).await;
                }
            }
            Step::Wrote(Ok(())) => {
                let mut finished_unit = false;
                if let Some((unit, pos)) = current.as_mut() {
                    let len = (unit.samples.len() - *pos).min(PLAYBACK_CHUNK);
                    let level = rms(&unit.samples[*pos..*pos + len]);
                    *pos += len;
                    finished_unit = *pos >= unit.samples.len();
                    let _ = event_tx.send(OutputEvent::Volume(level)).await;
                }
                if finished_unit {
                    current = None;
                    if queue.is_empty() {
                        let _ = event_tx.send(OutputEvent::SpeakingFinished).await;
                    }
                }
            }
            Step::Wrote(Err(e)) => {
                tracing::warn!("audio sink write failed: {e}");
                current = None;
                queue.clear();
                let _ = event_tx.send(OutputEvent::Failed(e)).await;
            }
        }

        // Playback completion pulls the next unit without external prompting.
        if current.is_none() {
            if let Some(unit) = queue.pop_front() {
                current = Some((unit, 0));
            }
        }
    }

    sink.stop().await;
}

async fn write_chunk(
    sink: &mut dyn AudioSink,
    current: Option<&(AudioUnit, usize)>,
) -> Result<(), SessionError> {
    match current {
        Some((unit, pos)) => {
            let end = (pos + PLAYBACK_CHUNK).min(unit.samples.len());
            sink.write(&unit.samples[*pos..end], unit.sample_rate).await
        }
        None => std::future::pending().await,
    }
}

async fn synthesize_unit(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
) -> Result<AudioUnit, SessionError> {
    let bytes = synthesizer.synthesize(text).await?;
    AudioUnit::from_pcm16(&bytes, SYNTH_SAMPLE_RATE)
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::MockSpeechSynthesizer;
    use std::sync::Mutex;
    use tokio::time::timeout;

    use viva_native_utils::audio::f32_to_pcm16;

    fn pcm_payload(value: f32, samples: usize) -> Vec<u8> {
        f32_to_pcm16(&vec![value; samples])
    }

    async fn next_event(rx: &mut mpsc::Receiver<OutputEvent>) -> OutputEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for output event")
            .expect("event channel closed")
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(AudioUnit::from_pcm16(&[], SYNTH_SAMPLE_RATE).is_err());
        assert!(AudioUnit::from_pcm16(&[0x01, 0x02, 0x03], SYNTH_SAMPLE_RATE).is_err());
        let unit = AudioUnit::from_pcm16(&[0x00, 0x40], SYNTH_SAMPLE_RATE).unwrap();
        assert_eq!(unit.samples.len(), 1);
    }

    #[tokio::test]
    async fn units_play_fully_in_enqueue_order() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer
            .expect_synthesize()
            .returning(|text| {
                let value = if text == "A" { 0.25 } else { -0.5 };
                Box::pin(async move { Ok(pcm_payload(value, PLAYBACK_CHUNK + 16)) })
            })
            .times(2);

        let written: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let written_by_sink = written.clone();
        let mut sink = MockAudioSink::new();
        sink.expect_write().returning(move |samples, _rate| {
            written_by_sink.lock().unwrap().push(samples[0]);
            Box::pin(async { Ok(()) })
        });
        sink.expect_stop().returning(|| Box::pin(async {}));

        let (event_tx, _events) = mpsc::channel(64);
        let queue = SpeechOutputQueue::spawn(Arc::new(synthesizer), Box::new(sink), event_tx);

        queue.speak("A").await.unwrap();
        queue.speak("B").await.unwrap();

        // Both units are two chunks long; wait until B's chunks landed.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if written.lock().unwrap().iter().filter(|v| **v < 0.0).count() >= 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "playback did not complete");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.shutdown().await;

        let written = written.lock().unwrap();
        let first_b = written.iter().position(|v| *v < 0.0).expect("B never played");
        assert!(
            written[..first_b].iter().all(|v| *v > 0.0),
            "B started before A finished: {written:?}"
        );
        assert!(written[first_b..].iter().all(|v| *v < 0.0));
    }

    #[tokio::test]
    async fn synthesis_failure_discards_the_unit() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer
            .expect_synthesize()
            .returning(|_| {
                Box::pin(async { Err(SessionError::Network("synthesis API returned 500".into())) })
            })
            .once();

        let mut sink = MockAudioSink::new();
        sink.expect_write().never();
        sink.expect_stop().returning(|| Box::pin(async {}));

        let (event_tx, mut events) = mpsc::channel(64);
        let queue = SpeechOutputQueue::spawn(Arc::new(synthesizer), Box::new(sink), event_tx);

        queue.speak("Hello").await.unwrap();
        match next_event(&mut events).await {
            OutputEvent::Failed(SessionError::Network(_)) => {}
            other => panic!("expected a network failure event, got {other:?}"),
        }
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn stop_clears_queued_units_before_they_reach_the_sink() {
        let mut synthesizer = MockSpeechSynthesizer::new();
        synthesizer.expect_synthesize().returning(|text| {
            let value = if text == "A" { 0.25 } else { -0.5 };
            Box::pin(async move { Ok(pcm_payload(value, PLAYBACK_CHUNK * 3)) })
        });

        let written: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let written_by_sink = written.clone();
        let mut sink = MockAudioSink::new();
        sink.expect_write().returning(move |samples, _rate| {
            written_by_sink.lock().unwrap().push(samples[0]);
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            })
        });
        sink.expect_stop().returning(|| Box::pin(async {}));

        let (event_tx, mut events) = mpsc::channel(64);
        let queue = SpeechOutputQueue::spawn(Arc::new(synthesizer), Box::new(sink), event_tx);

        queue.speak("A").await.unwrap();
        queue.speak("B").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.stop().await.unwrap();

        // Let any stray writes surface before asserting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.shutdown().await;

        assert!(
            written.lock().unwrap().iter().all(|v| *v > 0.0),
            "a queued unit reached the sink after stop"
        );

        let mut saw_finished = false;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
            if matches!(event, OutputEvent::SpeakingFinished) {
                saw_finished = true;
            }
        }
        assert!(saw_finished, "stop should settle playback with a finished event");
    }

    #[tokio::test]
    async fn stop_when_idle_is_harmless() {
        let synthesizer = MockSpeechSynthesizer::new();
        let mut sink = MockAudioSink::new();
        sink.expect_write().never();
        sink.expect_stop().returning(|| Box::pin(async {}));

        let (event_tx, mut events) = mpsc::channel(8);
        let queue = SpeechOutputQueue::spawn(Arc::new(synthesizer), Box::new(sink), event_tx);

        queue.stop().await.unwrap();
        queue.shutdown().await;
        assert!(events.try_recv().is_err(), "idle stop should emit nothing");
    }
}
