use std::sync::Mutex;

/// Half-duplex admission gate: one complete turn (STT → decide →
/// respond) at a time per session.
///
/// Speech that arrives while a turn is in flight is deliberately
/// dropped, not queued, so the device never hears replies to commands
/// it spoke over.  A rejected stream is still drained from the wire so
/// framing stays intact.
pub struct InputGate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    busy: bool,
    stream_active: bool,
    drop_stream: bool,
}

/// Outcome of [`InputGate::start_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAdmission {
    /// Collect audio for this stream.
    Accepted,
    /// Drain this stream from the wire but do not buffer it.
    Rejected,
}

/// Outcome of [`InputGate::end_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDecision {
    /// The stream was collected normally; enqueue it.
    Accept,
    /// The stream was rejected at admission; discard it.
    Drop,
    /// `END` arrived without an active stream.
    Ignore,
}

impl InputGate {
    pub fn new() -> Self {
        InputGate {
            state: Mutex::new(GateState::default()),
        }
    }

    /// A new inbound stream begins.  Rejected when a turn is in flight
    /// or another stream is already active; the rejected stream is
    /// tracked so its audio and `END` can be drained.
    pub fn start_stream(&self) -> StreamAdmission {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.busy || s.stream_active {
            s.stream_active = true;
            s.drop_stream = true;
            StreamAdmission::Rejected
        } else {
            s.stream_active = true;
            s.drop_stream = false;
            StreamAdmission::Accepted
        }
    }

    /// Whether `AUDIO` payloads of the current stream should be buffered.
    pub fn can_accept_audio(&self) -> bool {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.stream_active && !s.drop_stream
    }

    /// The current stream ends; reports whether it was collected,
    /// dropped, or never existed.
    pub fn end_stream(&self) -> EndDecision {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !s.stream_active {
            return EndDecision::Ignore;
        }
        let dropped = s.drop_stream;
        s.stream_active = false;
        s.drop_stream = false;
        if dropped {
            EndDecision::Drop
        } else {
            EndDecision::Accept
        }
    }

    /// Mark the start of a turn.  Held until [`Self::mark_idle`].
    pub fn mark_busy(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).busy = true;
    }

    /// Mark the end of a turn.
    pub fn mark_idle(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).busy = false;
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).busy
    }

    /// Guard that releases the busy flag on every exit path of a turn.
    pub fn busy_guard(&self) -> BusyGuard<'_> {
        self.mark_busy();
        BusyGuard { gate: self }
    }
}

impl Default for InputGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the gate's busy flag when dropped.
pub struct BusyGuard<'a> {
    gate: &'a InputGate,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.gate.mark_idle();
    }
}
