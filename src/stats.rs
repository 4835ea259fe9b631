use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

/// Lock-free performance counters, shared across all sessions.
///
/// The only process-wide mutable state besides the external clients.
#[derive(Debug, Default)]
pub struct Stats {
    pub connections: AtomicU64,
    pub frames_received: AtomicU64,
    pub audio_bytes_received: AtomicU64,
    pub commands_sent: AtomicU64,
    pub audio_replies_sent: AtomicU64,
    pub stt_requests: AtomicU64,
    pub stt_micros: AtomicU64,
    pub llm_requests: AtomicU64,
    pub llm_micros: AtomicU64,
    pub tts_requests: AtomicU64,
    pub tts_micros: AtomicU64,
    pub queue_drops: AtomicU64,
    pub gate_rejects: AtomicU64,
    pub errors: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline(always)]
    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame(&self, audio_bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes_received
            .fetch_add(audio_bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_audio_reply(&self) {
        self.audio_replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_stt(&self, elapsed: Duration) {
        self.stt_requests.fetch_add(1, Ordering::Relaxed);
        self.stt_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_llm(&self, elapsed: Duration) {
        self.llm_requests.fetch_add(1, Ordering::Relaxed);
        self.llm_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tts(&self, elapsed: Duration) {
        self.tts_requests.fetch_add(1, Ordering::Relaxed);
        self.tts_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_gate_reject(&self) {
        self.gate_rejects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            audio_bytes_received: self.audio_bytes_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            audio_replies_sent: self.audio_replies_sent.load(Ordering::Relaxed),
            stt_requests: self.stt_requests.load(Ordering::Relaxed),
            stt_micros: self.stt_micros.load(Ordering::Relaxed),
            llm_requests: self.llm_requests.load(Ordering::Relaxed),
            llm_micros: self.llm_micros.load(Ordering::Relaxed),
            tts_requests: self.tts_requests.load(Ordering::Relaxed),
            tts_micros: self.tts_micros.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            gate_rejects: self.gate_rejects.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Final summary printed on shutdown.
    pub fn print_summary(&self) {
        let s = self.snapshot();
        info!("==================================================");
        info!("Performance statistics");
        info!(
            connections = s.connections,
            frames = s.frames_received,
            audio_mb = format!("{:.2}", s.audio_bytes_received as f64 / 1_000_000.0),
            "inbound"
        );
        info!(
            commands = s.commands_sent,
            audio_replies = s.audio_replies_sent,
            "outbound"
        );
        info!(
            stt = format!("{} (avg {:.2}s)", s.stt_requests, avg_secs(s.stt_micros, s.stt_requests)),
            llm = format!("{} (avg {:.2}s)", s.llm_requests, avg_secs(s.llm_micros, s.llm_requests)),
            tts = format!("{} (avg {:.2}s)", s.tts_requests, avg_secs(s.tts_micros, s.tts_requests)),
            "turn stages"
        );
        info!(
            queue_drops = s.queue_drops,
            gate_rejects = s.gate_rejects,
            errors = s.errors,
            "pressure"
        );
        info!("==================================================");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub frames_received: u64,
    pub audio_bytes_received: u64,
    pub commands_sent: u64,
    pub audio_replies_sent: u64,
    pub stt_requests: u64,
    pub stt_micros: u64,
    pub llm_requests: u64,
    pub llm_micros: u64,
    pub tts_requests: u64,
    pub tts_micros: u64,
    pub queue_drops: u64,
    pub gate_rejects: u64,
    pub errors: u64,
}

fn avg_secs(micros: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        micros as f64 / requests as f64 / 1_000_000.0
    }
}

/// Background stats reporter task.
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled - park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = stats.snapshot();

    loop {
        tokio::time::sleep(interval).await;
        let now = stats.snapshot();
        info!(
            frames = now.frames_received - last.frames_received,
            commands = now.commands_sent - last.commands_sent,
            audio_replies = now.audio_replies_sent - last.audio_replies_sent,
            stt = now.stt_requests - last.stt_requests,
            queue_drops = now.queue_drops - last.queue_drops,
            gate_rejects = now.gate_rejects - last.gate_rejects,
            errors = now.errors - last.errors,
            "interval stats"
        );
        last = now;
    }
}
