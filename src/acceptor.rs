use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::brain::{AgentBrain, InfoServices};
use crate::config::Config;
use crate::llm::LlmClient;
use crate::robot::CompiledCommand;
use crate::stats::Stats;
use crate::stt::Transcriber;
use crate::tts::Synthesizer;

/// Pause after an OS-level accept error before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Immutable application wiring handed to every session: read-only
/// config plus the shared external clients and counters.
pub struct AppContext {
    pub config: Arc<Config>,
    pub stats: Arc<Stats>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub llm: Arc<LlmClient>,
    pub brain: Arc<Mutex<AgentBrain>>,
    pub info: Arc<InfoServices>,
    pub catalog: Arc<Vec<CompiledCommand>>,
}

/// Accept loop: one spawned session per connection.  A failing session
/// is logged and closed; a failing accept backs off and continues.
pub async fn run(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr = ctx.config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, mode = %ctx.config.default_mode, "server listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "connected");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = crate::session::run_session(stream, peer, ctx).await {
                        warn!(peer = %peer, error = %e, "session error");
                    }
                    info!(peer = %peer, "disconnected");
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
