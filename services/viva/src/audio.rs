//! cpal-backed implementations of the engine's audio device seams.
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that builds it, keeps it alive, and drops it on shutdown. The async side
//! talks to those threads through ring buffers and channels only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapProd;
use rubato::{FastFixedIn, Resampler};
use tokio::sync::mpsc;

use viva_core::SessionError;
use viva_native_utils::audio::{create_resampler, shared_buffer, split_for_chunks};
use viva_native_utils::device::{get_or_default_input, get_or_default_output};
use viva_voice::input::MicrophoneSource;
use viva_voice::playback::{AudioSink, PLAYBACK_CHUNK};

use crate::config::{INPUT_CHUNK_SIZE, OUTPUT_LATENCY_MS};

/// Keeps a cpal stream alive on its own thread until shut down.
struct AudioThread {
    handle: Option<thread::JoinHandle<()>>,
    quit_tx: std::sync::mpsc::Sender<()>,
}

impl AudioThread {
    fn shutdown(&mut self) {
        let _ = self.quit_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Speaker output: pushes decoded samples into a ring buffer drained by the
/// cpal output callback.
pub struct CpalSink {
    producer: HeapProd<f32>,
    flush: Arc<AtomicBool>,
    resampler: Option<FastFixedIn<f32>>,
    source_rate: u32,
    _thread: AudioThread,
}

impl CpalSink {
    pub fn new(device_name: Option<String>, source_rate: u32) -> Result<Self> {
        let flush = Arc::new(AtomicBool::new(false));
        let flush_in_callback = flush.clone();

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (quit_tx, quit_rx) = std::sync::mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let built = (move || -> Result<(cpal::Stream, HeapProd<f32>, u32)> {
                let device = get_or_default_output(device_name.as_deref())
                    .context("Failed to get audio output device")?;
                tracing::info!("Using output device: {:?}", device.name()?);

                let default_config = device
                    .default_output_config()
                    .context("Failed to get default output config")?;
                let config = StreamConfig {
                    channels: default_config.channels(),
                    sample_rate: default_config.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                };
                let channels = config.channels as usize;
                let rate = config.sample_rate.0;
                tracing::info!("Output stream config: {:?}", &config);

                let buffer = shared_buffer(rate as usize * OUTPUT_LATENCY_MS / 1000);
                let (producer, mut consumer) = buffer.split();

                let flush = flush_in_callback;
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if flush.swap(false, Ordering::AcqRel) {
                            while consumer.try_pop().is_some() {}
                        }
                        // Duplicate the mono sample across every channel.
                        for frame in data.chunks_mut(channels) {
                            let sample = consumer.try_pop().unwrap_or(0.0);
                            for slot in frame {
                                *slot = sample;
                            }
                        }
                    },
                    move |err| tracing::error!("An error occurred on output stream: {}", err),
                    None,
                )?;
                stream.play()?;
                Ok((stream, producer, rate))
            })();

            match built {
                Ok((stream, producer, rate)) => {
                    let _ = ready_tx.send(Ok((producer, rate)));
                    let _ = quit_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let (producer, device_rate) = ready_rx
            .recv()
            .context("audio output thread died during setup")??;

        let resampler = if device_rate == source_rate {
            None
        } else {
            Some(create_resampler(
                source_rate as f64,
                device_rate as f64,
                PLAYBACK_CHUNK,
            )?)
        };

        Ok(Self {
            producer,
            flush,
            resampler,
            source_rate,
            _thread: AudioThread {
                handle: Some(handle),
                quit_tx,
            },
        })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn write(&mut self, samples: &[f32], sample_rate: u32) -> Result<(), SessionError> {
        debug_assert_eq!(sample_rate, self.source_rate);
        for chunk in split_for_chunks(samples, PLAYBACK_CHUNK) {
            let resampled = match self.resampler.as_mut() {
                None => chunk,
                Some(resampler) => resampler
                    .process(&[chunk.as_slice()], None)
                    .map_err(|e| SessionError::Network(format!("audio output failed: {e}")))?
                    .into_iter()
                    .next()
                    .unwrap_or_default(),
            };
            // Wait for room, then push the whole chunk in one go so a
            // cancelled write never leaves a chunk half-pushed. The capacity
            // wait also paces playback at roughly real time.
            while self.producer.vacant_len() < resampled.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            for sample in resampled {
                let _ = self.producer.try_push(sample);
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.flush.store(true, Ordering::Release);
    }
}

/// Microphone capture: the device callback ships mono frames to a resampler
/// task which emits frames at the provider rate.
pub struct CpalMicrophone {
    device_name: Option<String>,
    target_rate: u32,
    thread: Option<AudioThread>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>, target_rate: u32) -> Self {
        Self {
            device_name,
            target_rate,
            thread: None,
        }
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, SessionError> {
        // Reopening releases any previous capture first.
        self.close();

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<f32>>(1024);
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(1024);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (quit_tx, quit_rx) = std::sync::mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        let handle = thread::spawn(move || {
            let built = (move || -> Result<(cpal::Stream, u32)> {
                let device = get_or_default_input(device_name.as_deref())
                    .context("Failed to get audio input device")?;
                tracing::info!("Using input device: {:?}", device.name()?);

                let default_config = device
                    .default_input_config()
                    .context("Failed to get default input config")?;
                let config = StreamConfig {
                    channels: default_config.channels(),
                    sample_rate: default_config.sample_rate(),
                    buffer_size: cpal::BufferSize::Fixed(FrameCount::from(INPUT_CHUNK_SIZE as u32)),
                };
                let channel_count = config.channels as usize;
                tracing::info!("Input stream config: {:?}", &config);

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Downmix to mono before shipping to the resampler task.
                        let audio = if channel_count > 1 {
                            data.chunks(channel_count)
                                .map(|c| c.iter().sum::<f32>() / channel_count as f32)
                                .collect::<Vec<f32>>()
                        } else {
                            data.to_vec()
                        };
                        if let Err(e) = raw_tx.try_send(audio) {
                            tracing::warn!("Failed to send audio data to buffer: {:?}", e);
                        }
                    },
                    move |err| tracing::error!("An error occurred on input stream: {}", err),
                    None,
                )?;
                stream.play()?;
                Ok((stream, config.sample_rate.0))
            })();

            match built {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = quit_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let input_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(SessionError::Permission(format!(
                    "microphone unavailable: {e}"
                )));
            }
            Err(_) => {
                return Err(SessionError::Permission(
                    "microphone thread died during setup".into(),
                ));
            }
        };

        let target_rate = self.target_rate;
        tokio::spawn(async move {
            if input_rate == target_rate {
                while let Some(audio) = raw_rx.recv().await {
                    if frame_tx.send(audio).await.is_err() {
                        break;
                    }
                }
                return;
            }

            let mut resampler =
                match create_resampler(input_rate as f64, target_rate as f64, INPUT_CHUNK_SIZE) {
                    Ok(resampler) => resampler,
                    Err(e) => {
                        tracing::error!("failed to create input resampler: {e}");
                        return;
                    }
                };
            let mut buffer: VecDeque<f32> = VecDeque::with_capacity(INPUT_CHUNK_SIZE * 2);
            while let Some(audio) = raw_rx.recv().await {
                buffer.extend(audio);
                while buffer.len() >= INPUT_CHUNK_SIZE {
                    let chunk: Vec<f32> = buffer.drain(..INPUT_CHUNK_SIZE).collect();
                    if let Ok(resampled) = resampler.process(&[chunk.as_slice()], None) {
                        if let Some(mono) = resampled.first() {
                            if frame_tx.send(mono.clone()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        self.thread = Some(AudioThread {
            handle: Some(handle),
            quit_tx,
        });
        Ok(frame_rx)
    }

    fn close(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.shutdown();
        }
    }
}
