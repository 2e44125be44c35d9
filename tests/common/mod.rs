//! Shared test utilities
//!
//! Scripted boundary collaborators and sample generators so the engine can
//! be exercised without audio hardware or network access.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use parley_engine::{
    AudioSink, ChatCompletion, ChatMessage, CloudAdapter, Config, DeviceAdapter,
    DeviceCapabilities, EngineEvent, EngineStatus, Error, LocalRecognizer, Orchestrator,
    PlaybackHandle, RecognizerEvent, RequestClient, Result, RetryPolicy, SpeechSynthesis,
    SpeechToText, StatusSink, TranscriptionStrategy, VoiceParams,
};

/// Generate sine wave audio samples
pub fn sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let rate = 16_000.0f32;
    let count = (rate * duration_secs) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / rate;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
pub fn silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (16_000.0 * duration_secs) as usize]
}

/// Test configuration: real defaults with near-zero retry delays
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        backoff_factor: 2.0,
    };
    config.stt.device_retry_backoff_ms = 1;
    config.call.greeting = String::new();
    config
}

/// Completion boundary with scripted replies
pub struct FakeCompletion {
    pub replies: Mutex<Vec<Result<String>>>,
    pub calls: AtomicU32,
    pub delay: Duration,
    pub seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeCompletion {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(vec![Ok(reply.to_string())]),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            seen_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
            seen_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCompletion for FakeCompletion {
    async fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_messages.lock().unwrap().push(history.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            Err(Error::Completion("scripted failure".to_string()))
        } else {
            replies.remove(0)
        }
    }
}

/// Synthesis boundary that records what it was asked to speak
pub struct FakeSynthesis {
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<(String, VoiceParams)>>,
}

impl FakeSynthesis {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn spoken_texts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn last_params(&self) -> Option<VoiceParams> {
        self.calls.lock().unwrap().last().map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl SpeechSynthesis for FakeSynthesis {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), params.clone()));
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Tts("scripted failure".to_string()))
        } else {
            Ok(vec![0u8; 64])
        }
    }
}

/// Audio sink that hands out unbound playback handles
pub struct FakeSink {
    /// Finish each playback immediately; disable to simulate long replies
    pub auto_finish: bool,
    pub handles: Mutex<Vec<PlaybackHandle>>,
    pub played: AtomicU32,
}

impl FakeSink {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            auto_finish: true,
            handles: Mutex::new(Vec::new()),
            played: AtomicU32::new(0),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            auto_finish: false,
            handles: Mutex::new(Vec::new()),
            played: AtomicU32::new(0),
        })
    }

    pub fn play_count(&self) -> u32 {
        self.played.load(Ordering::SeqCst)
    }

    pub fn last_handle(&self) -> Option<PlaybackHandle> {
        self.handles.lock().unwrap().last().cloned()
    }
}

impl AudioSink for FakeSink {
    fn play(&self, _mp3: &[u8]) -> Result<PlaybackHandle> {
        let handle = PlaybackHandle::unbound();
        self.played.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().unwrap().push(handle.clone());
        if self.auto_finish {
            handle.finish();
        }
        Ok(handle)
    }
}

/// Status collaborator that records every update
#[derive(Default)]
pub struct RecordingStatus {
    pub updates: Mutex<Vec<(EngineStatus, Option<String>, Option<String>)>>,
}

impl RecordingStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<EngineStatus> {
        self.updates.lock().unwrap().iter().map(|(s, _, _)| *s).collect()
    }

    pub fn replies(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, _, reply)| reply.clone())
            .collect()
    }
}

impl StatusSink for RecordingStatus {
    fn update(&self, status: EngineStatus, transcript_preview: Option<&str>, reply: Option<&str>) {
        self.updates.lock().unwrap().push((
            status,
            transcript_preview.map(String::from),
            reply.map(String::from),
        ));
    }
}

/// STT boundary stub for the cloud adapter (never reached in most tests)
pub struct StubTranscriber;

#[async_trait]
impl SpeechToText for StubTranscriber {
    async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Recognizer that plays back a script of events on start
pub struct ScriptedRecognizer {
    pub script: Vec<RecognizerEvent>,
    pub paused: Arc<AtomicBool>,
    pub stopped: Arc<AtomicBool>,
}

impl ScriptedRecognizer {
    pub fn with_script(script: Vec<RecognizerEvent>) -> Self {
        Self {
            script,
            paused: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl LocalRecognizer for ScriptedRecognizer {
    fn start(&mut self) -> Result<tokio::sync::mpsc::Receiver<RecognizerEvent>> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let script = self.script.clone();
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Everything needed to drive an orchestrator by hand
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub events: tokio::sync::mpsc::Receiver<EngineEvent>,
    pub completion: Arc<FakeCompletion>,
    pub synthesis: Arc<FakeSynthesis>,
    pub sink: Arc<FakeSink>,
    pub status: Arc<RecordingStatus>,
}

impl Harness {
    /// Drain and dispatch pipeline events until the engine goes quiet
    pub async fn pump(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(300), self.events.recv()).await
        {
            self.orchestrator.handle_event(event);
        }
    }
}

/// Build a headless engine around scripted collaborators
pub fn harness(
    completion: Arc<FakeCompletion>,
    synthesis: Arc<FakeSynthesis>,
    sink: Arc<FakeSink>,
    recognizer: Option<Box<dyn LocalRecognizer>>,
) -> Harness {
    let config = test_config();
    let status = RecordingStatus::new();
    let net = Arc::new(RequestClient::new());

    let capabilities = DeviceCapabilities {
        native_echo_cancellation: false,
        local_recognizer: recognizer.is_some(),
    };

    let device = recognizer.map(|r| DeviceAdapter::new(r, &config.stt));
    let cloud = CloudAdapter::new(
        Arc::new(StubTranscriber),
        Arc::clone(&net),
        config.retry.clone(),
        &config.stt,
        &config.capture,
        &config.vad,
    );
    let strategy = TranscriptionStrategy::select(capabilities, device, cloud);

    let mut orchestrator = Orchestrator::new(
        config,
        capabilities,
        strategy,
        completion.clone(),
        synthesis.clone(),
        sink.clone(),
        status.clone(),
        net,
    );
    let events = orchestrator.take_events().expect("fresh engine");

    Harness {
        orchestrator,
        events,
        completion,
        synthesis,
        sink,
        status,
    }
}
