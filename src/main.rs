mod acceptor;
mod agent;
mod audio;
mod brain;
mod command;
mod config;
mod dispatch;
mod gate;
mod llm;
mod protocol;
mod queue;
mod robot;
mod session;
mod stats;
mod stt;
mod text;
mod tts;

use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{info, warn};

use acceptor::AppContext;
use brain::{AgentBrain, InfoServices, Personality};
use config::Config;
use llm::LlmClient;
use stats::Stats;
use stt::HttpTranscriber;
use tts::HttpSynthesizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
                tracing_subscriber::EnvFilter::new(level)
            }),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Arc::new(Config::parse());

    info!(
        listen = config.listen_addr(),
        default_mode = %config.default_mode,
        stt_model = %config.stt_model,
        device = %config.stt_device,
        llm_model = %config.llm_model,
        voice = %config.tts_voice,
        "esp-voice-bridge starting"
    );

    let stats = Stats::new();

    let llm = Arc::new(LlmClient::new(
        &config.llm_base_url,
        &config.llm_model,
        config.llm_think,
    ));
    if let Err(e) = llm
        .ensure_available(
            config.llm_auto_start,
            &config.llm_start_command,
            config.llm_startup_timeout(),
        )
        .await
    {
        warn!(error = %e, "LLM not available - robot falls back to the catalog, agent to canned replies");
    }

    let transcriber = Arc::new(HttpTranscriber::new(
        &config.stt_base_url,
        &config.stt_model,
        &config.stt_language,
    ));
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.tts_base_url, &config.tts_voice));

    let brain = Arc::new(Mutex::new(AgentBrain::new(
        &config.assistant_name,
        Personality::parse(&config.personality),
        &config.snapshot_dir,
    )));
    let info_services = Arc::new(InfoServices::new(
        &config.weather_api_key,
        &config.weather_location,
    ));
    let catalog = Arc::new(robot::load_catalog(&config.commands_file));

    info!(
        assistant = %config.assistant_name,
        personality = %config.personality,
        commands = catalog.len(),
        "assistant ready"
    );

    tokio::spawn(stats::stats_reporter(
        stats.clone(),
        config.stats_interval_secs,
    ));

    let ctx = Arc::new(AppContext {
        config,
        stats: stats.clone(),
        transcriber,
        synthesizer,
        llm,
        brain,
        info: info_services,
        catalog,
    });

    tokio::select! {
        result = acceptor::run(ctx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received - shutting down");
        }
    }

    stats.print_summary();
    Ok(())
}
