//! Run flag shared between the watch loop and the signal handler.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cleared once to ask the watch loop to stop.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl Default for RunFlag {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clear `flag` on Ctrl-C, or on SIGTERM where available.
pub fn install_interrupt_handler(flag: RunFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        info!("interrupt received, shutting down");
        flag.stop();
    })
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!("cannot listen for Ctrl-C: {e}");
                        term.recv().await;
                    }
                }
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            ctrl_c_only().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    ctrl_c_only().await;
}

async fn ctrl_c_only() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
