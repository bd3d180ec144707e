//! Ctrl-C routing.
//!
//! Once tokio has installed its SIGINT handler it stays for the life of the
//! process, so the default "interrupt kills the process" is gone after the
//! first `ctrl_c()` is polled. One watcher task owns the signal instead:
//! while a [`Capture`] is held the interrupt goes to its holder, otherwise
//! the process ends with [`INTERRUPTED_EXIT`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    LazyLock,
};

use tokio::sync::Notify;

/// 128 + SIGINT, what a shell reports for a process killed by Ctrl-C.
pub const INTERRUPTED_EXIT: i32 = 130;

static CAPTURED: AtomicBool = AtomicBool::new(false);
static HANDOFF: LazyLock<Notify> = LazyLock::new(Notify::new);

/// Start the watcher. Call once, from inside the runtime.
pub fn spawn_watcher() {
    tokio::spawn(async {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Ctrl-C handling unavailable: {}", e);
                return;
            }
            if CAPTURED.load(Ordering::SeqCst) {
                HANDOFF.notify_one();
            } else {
                tracing::error!("Interrupted.");
                std::process::exit(INTERRUPTED_EXIT);
            }
        }
    });
}

/// While held, Ctrl-C wakes [`Capture::interrupted`] instead of ending the
/// process.
pub struct Capture(());

pub fn capture() -> Capture {
    CAPTURED.store(true, Ordering::SeqCst);
    Capture(())
}

impl Capture {
    pub async fn interrupted(&self) {
        HANDOFF.notified().await
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        CAPTURED.store(false, Ordering::SeqCst);
    }
}
