//! Hardware-event thread.
//!
//! Stands in for the device layer's notification context: readiness reports
//! are queued over a channel and delivered to the core from a dedicated
//! thread, independent of the thread handling user commands.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use audio_route::Context;

/// Messages accepted by the event thread.
#[derive(Debug)]
pub(crate) enum HardwareMessage {
    Notify { kind: u32, id: u32, payload: u32 },
    /// Reply once everything queued before it was delivered.
    Flush(Sender<()>),
    Shutdown,
}

/// Handle for feeding the event thread.
pub(crate) struct HardwareHandle {
    tx: Sender<HardwareMessage>,
    join: Option<JoinHandle<()>>,
}

impl HardwareHandle {
    pub(crate) fn notify(&self, kind: u32, id: u32, payload: u32) {
        if self
            .tx
            .send(HardwareMessage::Notify { kind, id, payload })
            .is_err()
        {
            tracing::warn!(kind, id, "hardware event thread gone; notification dropped");
        }
    }

    /// Block until queued notifications were dispatched.
    pub(crate) fn flush(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(HardwareMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    pub(crate) fn stop(mut self) {
        let _ = self.tx.send(HardwareMessage::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("hardware event thread panicked");
            }
        }
    }
}

pub(crate) fn spawn_event_thread(ctx: Arc<Context>) -> HardwareHandle {
    let (tx, rx) = crossbeam_channel::unbounded();
    let join = std::thread::Builder::new()
        .name("hw-events".to_string())
        .spawn(move || event_loop(ctx, rx))
        .map_err(|err| tracing::error!(error = %err, "failed to spawn hardware event thread"))
        .ok();
    HardwareHandle { tx, join }
}

fn event_loop(ctx: Arc<Context>, rx: Receiver<HardwareMessage>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            HardwareMessage::Notify { kind, id, payload } => {
                match ctx.notify(kind, id, payload) {
                    Ok(handlers) => tracing::debug!(kind, id, handlers, "hardware event delivered"),
                    Err(err) => tracing::warn!(kind, id, error = %err, "hardware event rejected"),
                }
            }
            HardwareMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            HardwareMessage::Shutdown => break,
        }
    }
    tracing::debug!("hardware event thread exiting");
}
