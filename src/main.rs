pub mod config;
pub mod controller;
pub mod dispatch;
pub mod fault;
pub mod session;
pub mod status;

use crate::config::PendantConfig;
use crate::controller::controller_handle::source_for;
use crate::controller::{ControlState, ControllerHandle};
use crate::dispatch::DispatcherHandle;
use crate::fault::fault_channel;
use crate::session::{MqttTransport, SessionManager, SessionState};
use crate::status::StatusReflector;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = PendantConfig::default_path();
    let config = PendantConfig::load(&config_path)?;

    let cancel = CancellationToken::new();
    let (faults, mut fault_signal) = fault_channel();
    let (reflector, status_rx) = StatusReflector::new();
    let (intent_tx, intent_rx) = mpsc::channel(config.dispatch.intent_buffer);
    let (command_tx, command_rx) = mpsc::channel(config.dispatch.command_buffer);

    // Session first, so the dispatcher sees its state from the start
    let transport = MqttTransport::new(config.session.clone());
    let manager = SessionManager::new(
        config.session.clone(),
        Box::new(transport),
        command_rx,
        reflector,
        faults.clone(),
    );
    let session_rx = manager.state();
    let session_task = manager.spawn(cancel.clone());

    let mut dispatcher = DispatcherHandle::spawn(
        &config.dispatch,
        intent_rx,
        command_tx,
        session_rx.clone(),
        cancel.clone(),
    );

    let controller = ControllerHandle::spawn(
        source_for(&config.device),
        &config.device,
        config.control.clone(),
        intent_tx,
        status_rx,
        faults,
        cancel.clone(),
    );
    let observer = tokio::spawn(log_transitions(
        controller.state(),
        session_rx,
        cancel.clone(),
    ));

    info!("Pendant running");
    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            None
        }
        condition = fault_signal.wait() => Some(condition),
    };

    cancel.cancel();
    controller.join().await;
    dispatcher.join().await;
    if let Err(e) = session_task.await {
        error!("Session task panicked: {}", e);
    }
    let _ = observer.await;

    match fatal {
        Some(condition) => Err(eyre!("Fatal: {}", condition)),
        None => {
            info!("Pendant stopped");
            Ok(())
        }
    }
}

/// Logs control mode and session phase changes
async fn log_transitions(
    mut control: watch::Receiver<ControlState>,
    mut session: watch::Receiver<SessionState>,
    cancel: CancellationToken,
) {
    let (mut mode, mut feed, mut axes) = {
        let state = control.borrow();
        (state.mode, state.feed_override_percent, state.active_axes)
    };
    let mut phase = session.borrow().phase;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = control.borrow_and_update().clone();
                if state.mode != mode {
                    info!("Control mode {:?} -> {:?}", mode, state.mode);
                    mode = state.mode;
                }
                if state.feed_override_percent != feed || state.active_axes != axes {
                    feed = state.feed_override_percent;
                    axes = state.active_axes;
                    debug!("Feed override {}%, axes {:?}", feed, axes);
                }
            }
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = session.borrow_and_update().clone();
                if state.phase != phase {
                    debug!(
                        "Session phase {:?} (epoch {}, retries {})",
                        state.phase, state.epoch, state.retry_count
                    );
                    phase = state.phase;
                }
            }
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|value| value.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
