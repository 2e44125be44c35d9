//! Audio processing
//!
//! Microphone capture and chunking, voice-activity detection, and
//! synthesized-reply playback. Transcription and synthesis themselves live
//! at the network boundaries (`stt`, `tts`).

mod capture;
mod playback;
mod vad;

pub use capture::{AudioCaptureController, AudioChunk, samples_to_wav};
pub use playback::{AudioPlayer, AudioSink, PlaybackHandle};
pub use vad::VoiceActivityMonitor;
