//! Headless core binary: binds the IPC sockets and runs the orchestrator
//! until Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lumina_core::command::RuleBasedClassifier;
use lumina_core::config::{CoreConfig, default_config_path};
use lumina_core::ipc::{EgressSocket, Endpoint, IpcListener, run_ingress};
use lumina_core::llm::LlmClient;
use lumina_core::memory::InMemoryStore;
use lumina_core::stt::HttpSttVendor;
use lumina_core::tts::HttpTts;
use lumina_core::{Orchestrator, OrchestratorDeps};

/// Channel depth between the ingress socket and the STT loop.
const INGRESS_CHANNEL_SIZE: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::load(Path::new(&path))?,
        None => default_config_path()
            .filter(|path| path.exists())
            .map(|path| CoreConfig::load(&path))
            .transpose()?
            .unwrap_or_default(),
    };
    config.apply_env();
    config
        .validate()
        .context("startup configuration invalid; refusing to accept audio")?;

    // Everything fatal happens before the first frame: bind all three
    // sockets, then build the vendor clients.
    let audio_listener = IpcListener::bind(&Endpoint::parse(&config.ipc.audio_socket)).await?;
    let result_listener = IpcListener::bind(&Endpoint::parse(&config.ipc.stt_result_socket)).await?;
    let tts_listener = IpcListener::bind(&Endpoint::parse(&config.ipc.tts_socket)).await?;

    let llm = LlmClient::new(&config.llm)?;
    let tts = Arc::new(HttpTts::new(&config.tts)?);
    let memory = Arc::new(InMemoryStore::new(&config.memory));
    let vendor = HttpSttVendor::new(&config.stt)?;

    let stt_egress = EgressSocket::new("stt-results");
    let tts_egress = EgressSocket::new("tts-audio");

    let (orchestrator, sentence_rx) = Orchestrator::new(
        config,
        OrchestratorDeps {
            llm,
            tts,
            memory,
            commands: Arc::new(RuleBasedClassifier),
            tts_egress: Arc::clone(&tts_egress),
            stt_egress: Arc::clone(&stt_egress),
        },
    );
    let cancel = orchestrator.cancel_token();

    tokio::spawn(Arc::clone(&stt_egress).serve(result_listener, cancel.clone()));
    tokio::spawn(Arc::clone(&tts_egress).serve(tts_listener, cancel.clone()));

    let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);
    tokio::spawn(run_ingress(audio_listener, ingress_tx, cancel.clone()));

    let runner = tokio::spawn(orchestrator.run(ingress_rx, sentence_rx, vendor));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();
    let _ = runner.await;
    Ok(())
}
