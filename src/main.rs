use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::future::join;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use converge::call::{CallPhase, CallSessionManager};
use converge::events::{CallEvent, EventBus};
use converge::media::rtc::{RtcConfig, RtcFactory};
use converge::media::MediaFactory;
use converge::signaling::{MemoryStore, SignalingStore};

/// Log level for the demo
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Loopback call demo: a caller and a callee in the same process rendezvous
/// through an in-memory signaling store and negotiate a real peer connection
/// over host candidates.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(version, about = "Two-party call signaling demo", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Seconds to wait for the connection before giving up
    #[arg(short = 't', long, value_name = "SECS", default_value = "30")]
    timeout_secs: u64,

    /// Use the default STUN servers instead of host-only candidates
    #[arg(long)]
    stun: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting converge demo v{}", env!("CARGO_PKG_VERSION"));

    let config = if args.stun {
        RtcConfig::default()
    } else {
        // both peers share a host, so host candidates are sufficient
        RtcConfig::host_only()
    };

    let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());
    let media: Arc<dyn MediaFactory> = Arc::new(RtcFactory::new(config));

    let caller_events = Arc::new(EventBus::new());
    let callee_events = Arc::new(EventBus::new());
    spawn_event_logger("caller", &caller_events);
    spawn_event_logger("callee", &callee_events);

    let caller = CallSessionManager::new(store.clone(), media.clone(), caller_events);
    let callee = CallSessionManager::new(store, media, callee_events);

    let id = caller.start_call().await?;
    tracing::info!("call id ready to share: {id}");

    callee.join_call(id.as_str()).await?;

    let caller_phases = caller
        .phase_watch()
        .await
        .ok_or_else(|| anyhow::anyhow!("caller session vanished"))?;
    let callee_phases = callee
        .phase_watch()
        .await
        .ok_or_else(|| anyhow::anyhow!("callee session vanished"))?;

    let deadline = Duration::from_secs(args.timeout_secs);
    let connected = tokio::time::timeout(
        deadline,
        join(
            wait_for_connected(caller_phases),
            wait_for_connected(callee_phases),
        ),
    )
    .await;

    match connected {
        Ok(_) => tracing::info!("both peers connected"),
        Err(_) => tracing::warn!("connection not established within {deadline:?}"),
    }

    caller.end_call().await?;
    callee.end_call().await?;
    tracing::info!("demo finished");

    Ok(())
}

async fn wait_for_connected(mut phases: watch::Receiver<CallPhase>) {
    loop {
        let phase = *phases.borrow_and_update();
        if phase >= CallPhase::Connected {
            return;
        }
        if phases.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_event_logger(side: &'static str, events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                CallEvent::Error { kind, detail } => {
                    tracing::warn!("[{side}] error ({kind}): {detail}")
                }
                other => tracing::info!("[{side}] event: {other:?}"),
            }
        }
    });
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "converge=error,webrtc=error",
        LogLevel::Warn => "converge=warn,webrtc=error",
        LogLevel::Info => "converge=info,webrtc=error",
        LogLevel::Debug => "converge=debug,webrtc=warn",
        LogLevel::Trace => "converge=trace,webrtc=info",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
