mod audio;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::time::ChronoLocal;

use viva_core::scoring::{ScoringClient, ScoringResponse};
use viva_core::{Command, Speaker};
use viva_voice::input::{InputBackend, StreamingConfig};
use viva_voice::session::{ConversationSession, ProviderSet, SessionConfig};
use viva_voice::synth::{ElevenLabsSynthesizer, SYNTH_SAMPLE_RATE};

use crate::audio::{CpalMicrophone, CpalSink};
use crate::config::{Config, InputProvider};

#[derive(Parser)]
#[command(about = "Phased voice interview runtime")]
struct Cli {
    /// Candidate name attached to the scoring metadata
    #[arg(long)]
    candidate: Option<String>,
    /// Interview identifier; generated from the clock when omitted
    #[arg(long)]
    interview_id: Option<String>,
    /// Input device name; the system default when omitted
    #[arg(long)]
    input_device: Option<String>,
    /// Output device name; the system default when omitted
    #[arg(long)]
    output_device: Option<String>,
    /// Candidate answers collected before moving to the next phase
    #[arg(long, default_value_t = 3)]
    answers_per_phase: usize,
}

enum Tick {
    Pumped(bool),
    Runtime(Option<Command>),
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting interview service...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    let interview_id = args.interview_id.clone().unwrap_or_else(|| {
        format!("interview-{}", chrono::Utc::now().timestamp_millis())
    });

    // --- 4. Assemble the Session ---
    let mut session_config = SessionConfig::new(interview_id.clone());
    session_config.candidate_name = args.candidate.clone();
    session_config.backup_dir = Some(config.backup_dir.clone());

    let (command_tx, mut command_rx) = mpsc::channel::<Command>(32);
    let mut session = ConversationSession::new(session_config, command_tx);

    let synthesizer = ElevenLabsSynthesizer::new(
        config.elevenlabs_api_key.clone(),
        config.elevenlabs_voice_id.clone(),
    );
    let sink = CpalSink::new(args.output_device.clone(), SYNTH_SAMPLE_RATE)
        .context("Failed to open audio output device")?;

    let input = match config.input_provider {
        InputProvider::Streaming => {
            let api_key = config
                .deepgram_api_key
                .clone()
                .context("DEEPGRAM_API_KEY must be set for the streaming input provider")?;
            InputBackend::Streaming {
                config: StreamingConfig::new(config.recognition_url.clone(), api_key),
                microphone: Box::new(CpalMicrophone::new(
                    args.input_device.clone(),
                    SYNTH_SAMPLE_RATE,
                )),
            }
        }
        InputProvider::Local => {
            anyhow::bail!("local recognition requires embedding viva-voice with a Recognizer")
        }
    };

    let providers = ProviderSet {
        synthesizer: Arc::new(synthesizer),
        sink: Box::new(sink),
        input,
    };

    session
        .start_call(providers)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start call: {e}"))?;

    let scoring = ScoringClient::new(config.scoring_api_url.clone());

    // The runtime's phase policy: move on once the candidate has given
    // enough final answers in the current phase.
    let mut answers_at_phase_start = 0usize;

    loop {
        let tick = tokio::select! {
            more = session.pump() => Tick::Pumped(more),
            command = command_rx.recv() => Tick::Runtime(command),
            _ = tokio::signal::ctrl_c() => Tick::Quit,
        };

        match tick {
            Tick::Pumped(false) | Tick::Runtime(None) => break,
            Tick::Pumped(true) => {
                let answered = candidate_answers(&session);
                if !session.state().current_phase.is_terminal()
                    && answered >= answers_at_phase_start + args.answers_per_phase
                {
                    answers_at_phase_start = answered;
                    if let Err(e) = session.next_phase().await {
                        tracing::warn!("failed to advance phase: {e}");
                    }
                }
            }
            Tick::Runtime(Some(Command::SystemMessage(text))) => {
                // Delivery to the interviewer backend is deployment-specific;
                // the reference runtime records the instruction.
                tracing::info!(instruction = %text, "system message for interviewer backend");
            }
            Tick::Runtime(Some(Command::SessionComplete(message))) => {
                tracing::info!("interview complete: {message}");
                // Let the closing line finish playing before teardown.
                tokio::time::sleep(Duration::from_secs(2)).await;
                session.stop_call().await;
                match session.send_for_scoring(&scoring).await {
                    Ok(scores) => print_report(&session, &scores),
                    Err(e) => {
                        tracing::error!("scoring failed: {e}; transcript kept in local backup")
                    }
                }
                break;
            }
            Tick::Quit => {
                tracing::info!("Received Ctrl-C, shutting down...");
                session.stop_call().await;
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    Ok(())
}

fn candidate_answers(session: &ConversationSession) -> usize {
    session
        .transcript()
        .entries()
        .iter()
        .filter(|entry| entry.speaker == Speaker::Candidate)
        .count()
}

fn print_report(session: &ConversationSession, scores: &ScoringResponse) {
    println!("\n=== Interview Report ===");
    println!("{}", session.transcript().format());
    println!("\nOverall: {:.1}", scores.overall_score);
    println!(
        "Fit: {:.1}  Tech: {:.1}  Brainteaser: {:.1}",
        scores.fit_score, scores.tech_score, scores.brain_score
    );
    println!("\nFeedback: {}", scores.feedback);
    if !scores.strengths.is_empty() {
        println!("Strengths: {}", scores.strengths.join(", "));
    }
    if !scores.improvements.is_empty() {
        println!("Improvements: {}", scores.improvements.join(", "));
    }
}
