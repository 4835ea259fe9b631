/// Per-connection session: a reader task driving the protocol state
/// machine and one STT worker task driving turn execution.
///
/// The reader is the only code that reads the socket; the worker owns
/// response writes.  Both share the send lock (the reader uses it only
/// for PONG acks).
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::acceptor::AppContext;
use crate::agent::AgentAdapter;
use crate::audio;
use crate::dispatch::{Dispatcher, Mode};
use crate::gate::{EndDecision, InputGate, StreamAdmission};
use crate::protocol::PacketType;
use crate::queue::{Job, JobQueue, PushOutcome};
use crate::robot::RobotAdapter;
use crate::stats::Stats;
use crate::stt::Transcriber;
use crate::text::clean_text;

/// Utterances shorter than this are handled by the unsure policy.
const MIN_UTTERANCE_SECS: f32 = 0.45;

/// Worker poll interval; bounds how long shutdown can go unnoticed.
const WORKER_POLL: Duration = Duration::from_secs(1);

/// Cadence of the session status log line.
const STATUS_LOG_EVERY: Duration = Duration::from_secs(10);

/// Bounded wait for the worker to drain after disconnect.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════
//  Shared per-session state
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct TurnState {
    sid: u64,
    servo_angle: i32,
}

/// Mutable state shared between the reader and the worker.
#[derive(Debug)]
pub struct SessionShared {
    state: Mutex<TurnState>,
}

impl SessionShared {
    pub fn new() -> Self {
        SessionShared {
            state: Mutex::new(TurnState {
                sid: 0,
                servo_angle: crate::command::SERVO_CENTER,
            }),
        }
    }

    /// Allocate the next utterance id.
    pub fn next_sid(&self) -> u64 {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.sid += 1;
        s.sid
    }

    pub fn current_sid(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sid
    }

    pub fn servo_angle(&self) -> i32 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .servo_angle
    }

    pub fn set_servo_angle(&self, angle: i32) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .servo_angle = angle;
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session entry point
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<AppContext>,
) -> anyhow::Result<()> {
    ctx.stats.record_connection();
    set_keepalive(&stream);

    let (read_half, write_half) = stream.into_split();
    let mut reader = crate::protocol::FrameReader::new(read_half, ctx.config.socket_timeout());
    let sink = Arc::new(crate::protocol::FrameSink::new(write_half));

    let gate = Arc::new(InputGate::new());
    let queue = Arc::new(JobQueue::new(ctx.config.stt_queue_size));
    let shared = Arc::new(SessionShared::new());
    let mode = Arc::new(Mutex::new(ctx.config.default_mode));

    let dispatcher = Dispatcher::new(
        mode.clone(),
        RobotAdapter::new(ctx.catalog.clone(), Some(ctx.llm.clone())),
        AgentAdapter::new(ctx.llm.clone(), ctx.brain.clone(), ctx.info.clone()),
        ctx.synthesizer.clone(),
        ctx.stats.clone(),
        ctx.config.max_chunks,
    );

    let status_task = tokio::spawn(status_loop(
        peer,
        mode.clone(),
        gate.clone(),
        queue.clone(),
        ctx.transcriber.clone(),
    ));

    let worker_task = tokio::spawn(stt_worker(
        queue.clone(),
        gate.clone(),
        shared.clone(),
        dispatcher,
        sink.clone(),
        ctx.transcriber.clone(),
        ctx.stats.clone(),
    ));

    reader_loop(&mut reader, peer, &ctx, &gate, &queue, &shared, &sink).await;

    // Disconnect: stop auxiliaries, drain the worker, close the socket.
    status_task.abort();
    queue.push(Job::Shutdown);
    let worker_abort = worker_task.abort_handle();
    if tokio::time::timeout(WORKER_JOIN_TIMEOUT, worker_task).await.is_err() {
        warn!(peer = %peer, "worker did not drain in time - aborting");
        worker_abort.abort();
    }

    Ok(())
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "failed to set TCP keepalive");
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Reader task: protocol state machine
// ═══════════════════════════════════════════════════════════════════════

async fn reader_loop(
    reader: &mut crate::protocol::FrameReader<tokio::net::tcp::OwnedReadHalf>,
    peer: SocketAddr,
    ctx: &Arc<AppContext>,
    gate: &InputGate,
    queue: &JobQueue,
    shared: &SessionShared,
    sink: &crate::protocol::FrameSink<OwnedWriteHalf>,
) {
    let max_audio_bytes = ctx.config.max_audio_bytes();
    let mut audio_buf = BytesMut::new();

    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                info!(peer = %peer, reason = %e, "disconnect");
                break;
            }
        };

        let ptype = match frame.packet_type() {
            Some(ptype) => ptype,
            None => {
                warn!(peer = %peer, type_code = format!("0x{:02X}", frame.type_code), "unknown packet type - dropped");
                ctx.stats.record_frame(0);
                continue;
            }
        };
        ctx.stats.record_frame(if ptype == PacketType::Audio {
            frame.payload.len()
        } else {
            0
        });

        match ptype {
            PacketType::Ping => {
                sink.send_pong().await;
            }

            PacketType::Start => match gate.start_stream() {
                StreamAdmission::Accepted => {
                    let sid = shared.next_sid();
                    audio_buf.clear();
                    info!(sid, "START");
                }
                StreamAdmission::Rejected => {
                    ctx.stats.record_gate_reject();
                    debug!("START rejected - turn in flight, draining stream");
                }
            },

            PacketType::Audio => {
                if gate.can_accept_audio() {
                    audio_buf.extend_from_slice(&frame.payload);
                    if audio_buf.len() > max_audio_bytes {
                        warn!(bytes = audio_buf.len(), "audio buffer over cap - forcing END");
                        finish_stream(gate, queue, shared, &ctx.stats, &mut audio_buf);
                    }
                }
            }

            PacketType::End => {
                finish_stream(gate, queue, shared, &ctx.stats, &mut audio_buf);
            }

            // Server → device codes arriving inbound are protocol noise.
            PacketType::Cmd
            | PacketType::AudioOut
            | PacketType::AudioOutEnd
            | PacketType::Pong => {
                debug!(peer = %peer, ptype = ?ptype, "out-of-state packet dropped");
            }
        }
    }
}

/// Close out the current inbound stream (real or synthetic `END`).
fn finish_stream(
    gate: &InputGate,
    queue: &JobQueue,
    shared: &SessionShared,
    stats: &Stats,
    audio_buf: &mut BytesMut,
) {
    match gate.end_stream() {
        EndDecision::Accept => {
            let sid = shared.current_sid();
            let pcm = audio_buf.split().freeze();
            info!(
                sid,
                bytes = pcm.len(),
                secs = format!("{:.2}", audio::pcm16_duration_secs(pcm.len())),
                "END"
            );
            gate.mark_busy();
            if queue.push(Job::Utterance { sid, pcm }) == PushOutcome::DroppedOldest {
                stats.record_queue_drop();
            }
        }
        EndDecision::Drop => {
            debug!("dropped stream discarded");
            audio_buf.clear();
        }
        EndDecision::Ignore => {
            audio_buf.clear();
        }
    }
}

/// Periodic one-line session health log.
async fn status_loop(
    peer: SocketAddr,
    mode: Arc<Mutex<Mode>>,
    gate: Arc<InputGate>,
    queue: Arc<JobQueue>,
    transcriber: Arc<dyn Transcriber>,
) {
    let mut interval = tokio::time::interval(STATUS_LOG_EVERY);
    interval.tick().await; // immediate first tick
    loop {
        interval.tick().await;
        let mode = *mode.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            peer = %peer,
            mode = %mode,
            busy = gate.is_busy(),
            queue_depth = queue.len(),
            stt_loaded = transcriber.is_loaded(),
            "session status"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  STT worker task: turn execution
// ═══════════════════════════════════════════════════════════════════════

async fn stt_worker(
    queue: Arc<JobQueue>,
    gate: Arc<InputGate>,
    shared: Arc<SessionShared>,
    mut dispatcher: Dispatcher,
    sink: Arc<crate::protocol::FrameSink<OwnedWriteHalf>>,
    transcriber: Arc<dyn Transcriber>,
    stats: Arc<Stats>,
) {
    loop {
        let job = match queue.pop(WORKER_POLL).await {
            Some(job) => job,
            None => continue,
        };
        match job {
            Job::Shutdown => break,
            Job::Utterance { sid, pcm } => {
                let _busy = gate.busy_guard();
                run_turn(
                    sid,
                    &pcm,
                    &mut dispatcher,
                    &shared,
                    &sink,
                    transcriber.as_ref(),
                    &stats,
                )
                .await;
            }
        }
    }
    debug!("stt worker stopped");
}

async fn run_turn(
    sid: u64,
    pcm: &[u8],
    dispatcher: &mut Dispatcher,
    shared: &SessionShared,
    sink: &crate::protocol::FrameSink<OwnedWriteHalf>,
    transcriber: &dyn Transcriber,
    stats: &Stats,
) {
    let secs = audio::pcm16_duration_secs(pcm.len());
    if secs < MIN_UTTERANCE_SECS {
        debug!(sid, secs = format!("{secs:.2}"), "utterance too short");
        dispatcher.handle_unsure(sid, sink).await;
        return;
    }

    let samples = audio::pcm16le_to_f32(pcm);
    let qc = audio::quality(&samples);
    debug!(
        sid,
        rms_db = format!("{:.1}", qc.rms_db),
        peak = format!("{:.3}", qc.peak),
        clip = format!("{:.2}%", qc.clip_ratio),
        "QC"
    );
    if qc.is_silence() {
        dispatcher.handle_unsure(sid, sink).await;
        return;
    }

    let mut prepared = audio::trim_energy(
        &samples,
        audio::SAMPLE_RATE,
        audio::TRIM_TOP_DB,
        audio::INBOUND_TRIM_PAD_MS,
    );
    audio::normalize_to_dbfs(
        &mut prepared,
        audio::INBOUND_TARGET_DBFS,
        audio::TTS_MAX_GAIN_DB,
    );

    let stt_start = Instant::now();
    let text = match transcriber.transcribe(&prepared).await {
        Ok(raw) => {
            stats.record_stt(stt_start.elapsed());
            clean_text(&raw)
        }
        Err(e) => {
            warn!(sid, error = %e, "transcription failed - job skipped");
            stats.record_error();
            return;
        }
    };

    if text.is_empty() {
        info!(sid, "STT: (empty/filtered)");
    } else {
        info!(sid, text = %text, mode = %dispatcher.mode(), "STT");
    }

    dispatcher.handle_utterance(sid, &text, shared, sink).await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests: a scripted mock device driving a real loopback session
// ═══════════════════════════════════════════════════════════════════════
