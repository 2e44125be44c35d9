//! Call session state
//!
//! One [`CallSession`] per active conversation. All mutation happens through
//! the orchestrator; other components only read, or hold a [`Generation`]
//! token to validate their async results against.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::completion::{ChatMessage, Role};

/// Monotonic counter identifying the current epoch of a session.
///
/// Every async result capable of mutating session state captures the value
/// at submission time and no-ops on arrival if it has since advanced. This
/// replaces a lock: in-flight network work cannot be aborted server-side,
/// but it can be made inert.
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Create a counter starting at zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current epoch
    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance to a new epoch, invalidating everything captured before.
    /// Returns the new value.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether a captured value still names the current epoch
    #[must_use]
    pub fn is_current(&self, captured: u64) -> bool {
        self.current() == captured
    }
}

/// Conversation states, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call, or between turns
    Idle,
    /// Capturing user speech
    Listening,
    /// A chunk is at the transcription boundary
    Transcribing,
    /// The transcript is at the completion boundary
    Generating,
    /// Assistant reply is playing
    Speaking,
}

/// What the host platform can do, probed at session start
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCapabilities {
    /// Hardware echo cancellation; when absent, on-device recognition is
    /// paused while the assistant speaks
    pub native_echo_cancellation: bool,

    /// A platform speech recognizer is available for the on-device adapter
    pub local_recognizer: bool,
}

/// One completed exchange
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    /// What the user said
    pub user_text: String,

    /// What the assistant replied
    pub assistant_text: String,

    /// When the user utterance was accepted
    pub started_at: DateTime<Utc>,

    /// When the reply was produced
    pub completed_at: DateTime<Utc>,

    /// Epoch the turn was produced under
    pub generation: u64,
}

/// Bounded recent history, used as completion context
#[derive(Debug)]
pub struct TurnHistory {
    turns: VecDeque<ConversationTurn>,
    capacity: usize,
}

impl TurnHistory {
    /// Create a history keeping the last `capacity` turns
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a completed turn, evicting the oldest beyond capacity
    pub fn push(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    /// Flatten the history into completion messages, oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            messages.push(ChatMessage {
                role: Role::User,
                content: turn.user_text.clone(),
            });
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: turn.assistant_text.clone(),
            });
        }
        messages
    }

    /// Number of retained turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turns are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The most recent turn, if any
    #[must_use]
    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.back()
    }
}

/// One active conversation
#[derive(Debug)]
pub struct CallSession {
    /// Opaque call identifier, passed in from the owning session
    pub id: Uuid,

    /// Current pipeline state
    pub state: CallState,

    /// Muted sessions capture audio but send nothing to transcription
    pub is_muted: bool,

    /// Whether user speech may interrupt assistant playback
    pub barge_in_allowed: bool,

    /// Platform capability flags
    pub capabilities: DeviceCapabilities,

    /// Recent exchanges, completion context
    pub history: TurnHistory,

    generation: Generation,
    started_at: Instant,
}

impl CallSession {
    /// Start a session
    #[must_use]
    pub fn new(capabilities: DeviceCapabilities, history_turns: usize, barge_in_allowed: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CallState::Idle,
            is_muted: false,
            barge_in_allowed,
            capabilities,
            history: TurnHistory::new(history_turns),
            generation: Generation::new(),
            started_at: Instant::now(),
        }
    }

    /// Token other components capture to validate async results
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation.clone()
    }

    /// Current epoch value
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.current()
    }

    /// How long the call has been running
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
