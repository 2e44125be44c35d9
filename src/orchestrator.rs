//! Conversation orchestration
//!
//! One control loop ties capture, recognition, completion, synthesis, and
//! playback into the turn cycle `Idle → Listening → Transcribing →
//! Generating → Speaking → Idle`, with barge-in jumping back to
//! `Listening` from anywhere in the reply pipeline.
//!
//! Coordination is versioned, not locked: every spawned pipeline captures
//! the session generation at submission and re-checks it before each
//! observable effect. Advancing the generation is therefore the whole of
//! cancellation for in-flight network work; only local playback is stopped
//! eagerly.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::completion::{ChatCompletion, ChatMessage, Role};
use crate::config::Config;
use crate::net::RequestClient;
use crate::session::{CallSession, CallState, ConversationTurn, DeviceCapabilities, Generation};
use crate::stt::{
    DeviceOutcome, ErrorDirective, HallucinationFilter, RecognizerEvent, TranscriptCandidate,
    TranscriptSource, TranscriptionStrategy,
};
use crate::tts::{SpeechSynthesis, VoiceParams};
use crate::voice::{AudioCaptureController, AudioSink, PlaybackHandle, VoiceActivityMonitor};
use crate::{Error, Result};

/// How often the voice-activity monitor samples the live stream
const VAD_TICK_MS: u64 = 100;

/// Conversation status reported to the display collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// No call, or between turns
    Idle,
    /// Waiting for user speech
    Listening,
    /// A chunk is at the transcription boundary
    Transcribing,
    /// Waiting on the completion boundary
    Generating,
    /// Assistant reply is playing
    Speaking,
}

impl From<CallState> for EngineStatus {
    fn from(state: CallState) -> Self {
        match state {
            CallState::Idle => Self::Idle,
            CallState::Listening => Self::Listening,
            CallState::Transcribing => Self::Transcribing,
            CallState::Generating => Self::Generating,
            CallState::Speaking => Self::Speaking,
        }
    }
}

/// Display collaborator. The engine renders nothing itself; it pushes
/// status, live transcript previews, and reply text here.
pub trait StatusSink: Send + Sync {
    /// Receive a state change or text update
    fn update(&self, status: EngineStatus, transcript_preview: Option<&str>, reply: Option<&str>);
}

/// Messages delivered to the orchestrator's control loop.
///
/// Recognizer callbacks, timer ticks, and pipeline completions all arrive
/// here rather than mutating state from their own tasks.
#[derive(Debug)]
pub enum EngineEvent {
    /// An on-device recognizer event
    Recognizer(RecognizerEvent),

    /// A cloud chunk finished processing (possibly with no transcript)
    ChunkProcessed {
        /// Generation captured when the chunk was sealed
        generation: u64,
        /// Transcript, absent when gated out, timed out, or empty
        text: Option<String>,
    },

    /// A completion round-trip finished
    Reply {
        /// Generation the turn was started under
        generation: u64,
        /// Accepted user utterance
        user_text: String,
        /// Assistant reply (or the apology utterance on failure)
        reply: String,
        /// Whether the exchange belongs in history (apologies do not)
        record: bool,
        /// When the user utterance was accepted
        started_at: DateTime<Utc>,
    },

    /// A reply segment started playing
    PlaybackStarted {
        /// Generation of the owning reply pipeline
        generation: u64,
        /// Handle for barge-in cancellation
        handle: PlaybackHandle,
    },

    /// The reply pipeline for this generation ran out of sentences
    TurnFinished {
        /// Generation of the finished pipeline
        generation: u64,
    },

    /// The on-device recognizer should start again after backoff
    RestartRecognizer,

    /// User speech interrupted assistant playback
    BargeIn,
}

/// The conversation state machine and its control loop
pub struct Orchestrator {
    config: Config,
    session: CallSession,
    generation: Generation,
    strategy: TranscriptionStrategy,
    filter: HallucinationFilter,
    vad: VoiceActivityMonitor,
    completion: Arc<dyn ChatCompletion>,
    synthesis: Arc<dyn SpeechSynthesis>,
    sink: Arc<dyn AudioSink>,
    status: Arc<dyn StatusSink>,
    net: Arc<RequestClient>,
    voice_params: VoiceParams,
    capture: Option<AudioCaptureController>,

    tx: mpsc::Sender<EngineEvent>,
    rx: Option<mpsc::Receiver<EngineEvent>>,

    playback: Option<PlaybackHandle>,
    /// Generation whose reply pipeline is in flight, if any. At most one
    /// per generation.
    active_turn: Option<u64>,
    /// Last reply actually spoken, for duplicate-reply suppression
    last_spoken: String,
    recognizer_paused: bool,
}

impl Orchestrator {
    /// Assemble the engine from its injected collaborators
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        capabilities: DeviceCapabilities,
        strategy: TranscriptionStrategy,
        completion: Arc<dyn ChatCompletion>,
        synthesis: Arc<dyn SpeechSynthesis>,
        sink: Arc<dyn AudioSink>,
        status: Arc<dyn StatusSink>,
        net: Arc<RequestClient>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let session = CallSession::new(
            capabilities,
            config.call.history_turns,
            config.call.barge_in_allowed,
        );
        let generation = session.generation();
        let vad = VoiceActivityMonitor::new(config.vad.clone());
        let voice_params = VoiceParams::from_config(&config.tts);

        Self {
            config,
            session,
            generation,
            strategy,
            filter: HallucinationFilter::new(),
            vad,
            completion,
            synthesis,
            sink,
            status,
            net,
            voice_params,
            capture: None,
            tx,
            rx: Some(rx),
            playback: None,
            active_turn: None,
            last_spoken: String::new(),
            recognizer_paused: false,
        }
    }

    /// Attach the microphone controller. Hosts without audio hardware (and
    /// the test suite) drive the engine through events instead.
    #[must_use]
    pub fn with_capture(mut self, capture: AudioCaptureController) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Sender for injecting events (used by recognizer pumps and hosts)
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<EngineEvent> {
        self.tx.clone()
    }

    /// Take the event receiver to drive the loop manually
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.rx.take()
    }

    /// Current pipeline state
    #[must_use]
    pub const fn state(&self) -> CallState {
        self.session.state
    }

    /// Current session generation
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.current()
    }

    /// The session under orchestration
    #[must_use]
    pub const fn session(&self) -> &CallSession {
        &self.session
    }

    /// Whether a playback handle is currently held
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.playback.is_some()
    }

    /// Which transcription adapter is feeding the session
    #[must_use]
    pub const fn transcription_source(&self) -> TranscriptSource {
        self.strategy.active()
    }

    /// Mute or unmute the session. Muting stops recognition intake without
    /// tearing the session down.
    pub fn set_muted(&mut self, muted: bool) {
        self.session.is_muted = muted;
        if let Some(device) = self.strategy.device_mut() {
            if muted {
                device.pause();
            } else if !self.recognizer_paused {
                device.resume();
            }
        }
        tracing::info!(muted, "mute toggled");
    }

    /// Run the conversation loop until the shutdown channel fires.
    ///
    /// Runs on the caller's thread: capture streams are not `Send`.
    ///
    /// # Errors
    ///
    /// Returns error if capture or recognition cannot start.
    pub async fn run(&mut self, shutdown: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| Error::Config("engine loop already taken".to_string()))?;

        if let Some(capture) = self.capture.as_mut() {
            capture.start()?;
        }
        if let Err(e) = self.start_recognizer_pump() {
            tracing::warn!(error = %e, "on-device recognition unavailable");
            self.strategy.switch_to_cloud();
        }

        self.session.state = CallState::Listening;
        self.publish(None, None);
        tracing::info!(call = %self.session.id, "conversation started");

        let greeting = self.config.call.greeting.clone();
        if !greeting.is_empty() {
            self.begin_speaking(greeting, self.generation.current());
        }

        let mut vad_tick =
            tokio::time::interval(std::time::Duration::from_millis(VAD_TICK_MS));
        let mut chunk_tick = tokio::time::interval(self.config.capture.chunk_interval());
        // The immediate first tick would seal an empty chunk
        chunk_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Some(event) = rx.recv() => self.handle_event(event),
                _ = vad_tick.tick() => self.poll_vad(),
                _ = chunk_tick.tick() => self.poll_chunk(),
            }
        }

        self.teardown();
        Ok(())
    }

    /// Stop periodic work, invalidate in-flight pipelines, and release the
    /// microphone. The capture stop here is the only path that destroys the
    /// device resource.
    pub fn teardown(&mut self) {
        self.generation.advance();
        if let Some(handle) = self.playback.take() {
            handle.cancel();
        }
        self.strategy.shutdown();
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        self.active_turn = None;
        self.session.state = CallState::Idle;
        self.publish(None, None);
        tracing::info!(
            call = %self.session.id,
            duration = ?self.session.elapsed(),
            "conversation ended"
        );
    }

    /// Process one control-loop message
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Recognizer(recognizer_event) => {
                self.on_recognizer_event(&recognizer_event);
            }
            EngineEvent::ChunkProcessed { generation, text } => {
                self.on_chunk_processed(generation, text);
            }
            EngineEvent::Reply {
                generation,
                user_text,
                reply,
                record,
                started_at,
            } => {
                self.on_reply(generation, user_text, reply, record, started_at);
            }
            EngineEvent::PlaybackStarted { generation, handle } => {
                if self.generation.is_current(generation) {
                    self.playback = Some(handle);
                } else {
                    // A stale pipeline got as far as starting audio; kill it
                    handle.cancel();
                }
            }
            EngineEvent::TurnFinished { generation } => self.on_turn_finished(generation),
            EngineEvent::RestartRecognizer => {
                if let Err(e) = self.start_recognizer_pump() {
                    tracing::warn!(error = %e, "recognizer restart failed");
                    self.strategy.switch_to_cloud();
                }
            }
            EngineEvent::BargeIn => self.barge_in(),
        }
    }

    /// Sample the live stream for barge-in speech
    fn poll_vad(&mut self) {
        let Some(capture) = self.capture.as_ref() else {
            return;
        };
        if self.session.is_muted {
            return;
        }

        let window = (self.config.capture.engine_sample_rate as usize * VAD_TICK_MS as usize)
            / 1000;
        let samples = capture.recent_samples(window);
        let speaking = self.session.state == CallState::Speaking;

        if self.vad.observe(&samples, speaking, Instant::now()) && speaking {
            self.barge_in();
        }
    }

    /// Seal the current chunk and ship it to the cloud adapter
    fn poll_chunk(&mut self) {
        if self.strategy.active() != TranscriptSource::Cloud {
            return;
        }
        if self.session.is_muted || self.session.state == CallState::Speaking {
            // Assistant audio leaking into the chunk would only produce
            // echo transcripts; barge-in is the VAD's job
            return;
        }
        let Some(capture) = self.capture.as_ref() else {
            return;
        };

        let chunk = match capture.take_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "chunk seal failed");
                return;
            }
        };

        if self.session.state == CallState::Listening {
            self.session.state = CallState::Transcribing;
            self.publish(None, None);
        }

        let generation = self.generation.current();
        let cloud = self.strategy.cloud();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let text = match cloud.transcribe_chunk(&chunk).await {
                Ok(text) => text,
                Err(e) => {
                    // Terminal for this one chunk; the session continues
                    tracing::warn!(error = %e, "chunk transcription failed");
                    None
                }
            };
            let _ = tx.send(EngineEvent::ChunkProcessed { generation, text }).await;
        });
    }

    fn on_chunk_processed(&mut self, generation: u64, text: Option<String>) {
        if !self.generation.is_current(generation) {
            tracing::debug!(generation, "stale chunk result discarded");
            return;
        }

        match text {
            Some(text) => self.accept_candidate(TranscriptCandidate {
                text,
                source: TranscriptSource::Cloud,
                confidence: None,
                generation,
            }),
            None => {
                if self.session.state == CallState::Transcribing {
                    self.session.state = CallState::Listening;
                    self.publish(None, None);
                }
            }
        }
    }

    fn on_recognizer_event(&mut self, event: &RecognizerEvent) {
        if self.session.is_muted {
            return;
        }
        // Late events from a recognizer we already gave up on
        if self.strategy.active() != TranscriptSource::OnDevice {
            return;
        }

        if let RecognizerEvent::Error(error) = event {
            let Some(device) = self.strategy.device_mut() else {
                return;
            };
            match device.on_error(error) {
                ErrorDirective::RetryAfter(delay) => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(EngineEvent::RestartRecognizer).await;
                    });
                }
                ErrorDirective::SwitchToCloud => self.strategy.switch_to_cloud(),
            }
            return;
        }

        let Some(device) = self.strategy.device_mut() else {
            return;
        };
        match device.on_text(event) {
            DeviceOutcome::Forward(text) => {
                let candidate = TranscriptCandidate {
                    text,
                    source: TranscriptSource::OnDevice,
                    confidence: None,
                    generation: self.generation.current(),
                };
                self.accept_candidate(candidate);
            }
            DeviceOutcome::Preview(text) => {
                self.status
                    .update(self.session.state.into(), Some(&text), None);
            }
            DeviceOutcome::Suppressed => {}
        }
    }

    /// Validate a candidate and, if it survives, start the reply pipeline
    fn accept_candidate(&mut self, candidate: TranscriptCandidate) {
        let TranscriptCandidate {
            text,
            source,
            generation,
            ..
        } = candidate;

        if !self.generation.is_current(generation) {
            tracing::debug!(generation, "stale transcript discarded");
            return;
        }

        let Some(text) = self.filter.apply(&text) else {
            // Hallucinated or empty; absorbed, diagnostics only
            tracing::debug!("transcript filtered");
            if self.session.state == CallState::Transcribing {
                self.session.state = CallState::Listening;
                self.publish(None, None);
            }
            return;
        };

        if self.active_turn == Some(generation) {
            tracing::debug!(text = %text, "turn already in flight for this generation");
            return;
        }

        tracing::info!(text = %text, source = ?source, "transcript accepted");
        // New user input resets reply-dedup state
        self.last_spoken.clear();

        self.session.state = CallState::Generating;
        self.publish(Some(&text), None);
        self.active_turn = Some(generation);

        let completion = Arc::clone(&self.completion);
        let net = Arc::clone(&self.net);
        let policy = self.config.retry.clone();
        let apology = self.config.call.apology.clone();
        let mut messages = self.session.history.messages();
        messages.push(ChatMessage {
            role: Role::User,
            content: text.clone(),
        });
        let tx = self.tx.clone();
        let started_at = Utc::now();

        tokio::spawn(async move {
            let result = net
                .execute("completion.complete", &policy, |_| {
                    let completion = Arc::clone(&completion);
                    let messages = messages.clone();
                    async move { completion.complete(&messages).await }
                })
                .await;

            let (reply, record) = match result {
                Ok(reply) => (reply, true),
                Err(e) => {
                    // A failed turn speaks a short apology, never silence
                    tracing::error!(error = %e, "completion failed");
                    (apology, false)
                }
            };

            let _ = tx
                .send(EngineEvent::Reply {
                    generation,
                    user_text: text,
                    reply,
                    record,
                    started_at,
                })
                .await;
        });
    }

    fn on_reply(
        &mut self,
        generation: u64,
        user_text: String,
        reply: String,
        record: bool,
        started_at: DateTime<Utc>,
    ) {
        if !self.generation.is_current(generation) {
            tracing::debug!(generation, "stale reply discarded");
            return;
        }

        if record {
            self.session.history.push(ConversationTurn {
                user_text,
                assistant_text: reply.clone(),
                started_at,
                completed_at: Utc::now(),
                generation,
            });
        }

        if !should_speak(&self.last_spoken, &reply) {
            tracing::debug!("duplicate reply suppressed");
            self.last_spoken = reply;
            self.finish_turn();
            return;
        }
        self.last_spoken = reply.clone();

        self.begin_speaking(reply, generation);
    }

    /// Move to `Speaking` and start the sentence-by-sentence reply pipeline
    fn begin_speaking(&mut self, reply: String, generation: u64) {
        self.session.state = CallState::Speaking;
        self.publish(None, Some(&reply));

        // Devices without hardware echo cancellation would hear the
        // assistant through the recognizer
        if !self.session.capabilities.native_echo_cancellation {
            if let Some(device) = self.strategy.device_mut() {
                device.pause();
                self.recognizer_paused = true;
            }
        }

        let synthesis = Arc::clone(&self.synthesis);
        let sink = Arc::clone(&self.sink);
        let status = Arc::clone(&self.status);
        let net = Arc::clone(&self.net);
        let policy = self.config.retry.clone();
        let params = self.voice_params.clone();
        let generation_token = self.generation.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let sentences = split_sentences(&reply);
            let mut spoke_any = false;

            for sentence in sentences {
                if !generation_token.is_current(generation) {
                    break;
                }

                let audio = net
                    .execute("tts.synthesize", &policy, |attempt| {
                        // Last chance gets the degraded configuration
                        let request_params = if attempt.is_final() {
                            params.degraded()
                        } else {
                            params.clone()
                        };
                        let synthesis = Arc::clone(&synthesis);
                        let sentence = sentence.clone();
                        async move { synthesis.synthesize(&sentence, &request_params).await }
                    })
                    .await;

                let audio = match audio {
                    Ok(audio) => audio,
                    Err(e) => {
                        tracing::warn!(error = %e, sentence = %sentence, "synthesis failed");
                        continue;
                    }
                };

                // A barge-in during synthesis must prevent playback from
                // ever starting
                if !generation_token.is_current(generation) {
                    break;
                }

                match sink.play(&audio) {
                    Ok(handle) => {
                        spoke_any = true;
                        let _ = tx
                            .send(EngineEvent::PlaybackStarted {
                                generation,
                                handle: handle.clone(),
                            })
                            .await;
                        handle.finished().await;
                        if handle.is_cancelled() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "playback failed");
                        break;
                    }
                }
            }

            if !spoke_any && generation_token.is_current(generation) {
                // Degraded delivery: the reply text already went to the
                // display collaborator when speaking began
                tracing::warn!("reply delivered as text only");
                status.update(EngineStatus::Speaking, None, Some(&reply));
            }

            let _ = tx.send(EngineEvent::TurnFinished { generation }).await;
        });
    }

    fn on_turn_finished(&mut self, generation: u64) {
        if !self.generation.is_current(generation) {
            return;
        }
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        self.playback = None;
        self.active_turn = None;
        self.resume_recognizer();
        // The turn ends at Idle and the continuous session immediately
        // listens again
        self.session.state = CallState::Listening;
        self.publish(None, None);
    }

    /// User speech interrupted playback: invalidate everything in flight
    /// and listen again
    fn barge_in(&mut self) {
        if self.session.state != CallState::Speaking || !self.session.barge_in_allowed {
            return;
        }

        let new_generation = self.generation.advance();
        if let Some(handle) = self.playback.take() {
            handle.cancel();
        }
        self.active_turn = None;
        self.resume_recognizer();
        if let Some(device) = self.strategy.device_mut() {
            device.reset_dedup();
        }

        self.session.state = CallState::Listening;
        self.publish(None, None);
        tracing::info!(generation = new_generation, "barge-in: playback cancelled");
    }

    fn resume_recognizer(&mut self) {
        if self.recognizer_paused {
            if let Some(device) = self.strategy.device_mut() {
                if !self.session.is_muted {
                    device.resume();
                }
            }
            self.recognizer_paused = false;
        }
    }

    /// Start the on-device recognizer and forward its events to the loop
    fn start_recognizer_pump(&mut self) -> Result<()> {
        if self.strategy.active() != TranscriptSource::OnDevice {
            return Ok(());
        }
        let Some(device) = self.strategy.device_mut() else {
            return Ok(());
        };

        let mut events = device.start()?;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(EngineEvent::Recognizer(event)).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn publish(&self, transcript_preview: Option<&str>, reply: Option<&str>) {
        self.status
            .update(self.session.state.into(), transcript_preview, reply);
    }
}

/// Split a reply into sentences so synthesis and playback overlap: the
/// first sentence is audible long before the whole reply is synthesized.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Whether a reply is new speech rather than a duplicate or refinement of
/// what was already spoken for this user input
fn should_speak(last_spoken: &str, reply: &str) -> bool {
    let reply = reply.trim();
    if reply.is_empty() || reply == last_spoken {
        return false;
    }
    if last_spoken.is_empty() {
        return true;
    }
    // An extension re-speaks everything already said
    if reply.starts_with(last_spoken) {
        return false;
    }
    // Minor correction of the same reply
    let difference = reply.chars().count().abs_diff(last_spoken.chars().count());
    let longest = reply.chars().count().max(last_spoken.chars().count());
    #[allow(clippy::cast_precision_loss)]
    let ratio = difference as f32 / longest as f32;
    !(ratio < 0.2 && difference < 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("Привет! Чем помочь? Расскажи."),
            vec!["Привет!", "Чем помочь?", "Расскажи."]
        );
        assert_eq!(split_sentences("без терминатора"), vec!["без терминатора"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_should_speak_dedup() {
        assert!(should_speak("", "Привет!"));
        assert!(!should_speak("Привет!", "Привет!"));
        // Extension of already-spoken text
        assert!(!should_speak("Привет!", "Привет! Чем могу помочь?"));
        // Minor wording correction
        assert!(!should_speak(
            "Возьмите двести грамм муки",
            "Возьмите триста грамм муки"
        ));
        // Genuinely new reply
        assert!(should_speak(
            "Привет!",
            "Для борща нужна свёкла, капуста и говядина."
        ));
        assert!(!should_speak("Привет!", "   "));
    }

    #[test]
    fn test_status_maps_state() {
        assert_eq!(EngineStatus::from(CallState::Speaking), EngineStatus::Speaking);
        assert_eq!(EngineStatus::from(CallState::Idle), EngineStatus::Idle);
    }
}
