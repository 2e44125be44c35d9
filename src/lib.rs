//! Parley - real-time voice conversation engine
//!
//! Captures microphone audio, turns speech into text through two
//! complementary strategies (an on-device recognizer and a chunked cloud
//! fallback), sends the transcript to a chat-completion boundary, and
//! speaks the reply back while watching for the user to barge in.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Microphone                        │
//! └───────┬───────────────────────────────┬──────────────┘
//!         │                               │
//! ┌───────▼──────────┐          ┌─────────▼────────────┐
//! │  AudioCapture    │          │ VoiceActivityMonitor │
//! │  (chunks)        │          │ (barge-in)           │
//! └───────┬──────────┘          └─────────┬────────────┘
//!         │                               │
//! ┌───────▼───────────────────────────────▼──────────────┐
//! │                   Orchestrator                        │
//! │  transcribe → filter → complete → synthesize → play   │
//! │        (generation-versioned, barge-in aware)         │
//! └───────┬───────────────┬───────────────┬──────────────┘
//!         │               │               │
//!    STT boundary   completion boundary  TTS boundary
//! ```
//!
//! Stale async results never corrupt a newer turn: every pipeline captures
//! the session generation at submission and is discarded on arrival if the
//! generation has advanced.

pub mod completion;
pub mod config;
pub mod error;
pub mod net;
pub mod orchestrator;
pub mod session;
pub mod stt;
pub mod tts;
pub mod voice;

pub use completion::{ChatCompletion, ChatMessage, CompletionClient, Role};
pub use config::{CaptureConfig, ChunkFormat, CompletionConfig, Config, SttConfig, TtsConfig, VadConfig};
pub use error::{Error, MicrophoneError, Result};
pub use net::{Attempt, ErrorClass, OpCounters, RequestClient, RetryPolicy};
pub use orchestrator::{EngineEvent, EngineStatus, Orchestrator, StatusSink};
pub use session::{
    CallSession, CallState, ConversationTurn, DeviceCapabilities, Generation, TurnHistory,
};
pub use stt::{
    CloudAdapter, CloudTranscriber, DeviceAdapter, DeviceOutcome, ErrorDirective,
    HallucinationFilter, LocalRecognizer, RecognizerError, RecognizerErrorKind, RecognizerEvent,
    SpeechToText, TranscriptCandidate, TranscriptSource, TranscriptionStrategy,
};
pub use tts::{SpeechSynthesis, SpeechSynthesizer, VoiceParams};
pub use voice::{
    AudioCaptureController, AudioChunk, AudioPlayer, AudioSink, PlaybackHandle,
    VoiceActivityMonitor, samples_to_wav,
};
