//! Engine event dispatcher thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use super::EngineEvent;
use crate::controller::AccelController;

/// How long to wait for an event before checking for shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    /// Shutdown signal sender
    shutdown: Sender<()>,
    /// Dispatcher thread handle
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the dispatcher to stop
    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }

    /// Check if still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct Dispatcher {
    controller: Arc<AccelController>,
    events: Receiver<EngineEvent>,
    shutdown: Receiver<()>,
}

impl Dispatcher {
    fn run(&self) {
        info!("Engine event dispatcher started");
        let mut handled: u64 = 0;

        loop {
            if self.shutdown.try_recv().is_ok() {
                break;
            }

            match self.events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    self.controller.handle_event(event);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Engine event channel closed");
                    break;
                }
            }
        }

        // Drain events the engine already delivered
        for event in self.events.try_iter() {
            self.controller.handle_event(event);
            handled += 1;
        }
        info!(events = handled, "Engine event dispatcher stopped");
    }
}

/// Spawn the thread applying engine events to `controller`.
pub fn spawn_dispatcher(
    controller: Arc<AccelController>,
    events: Receiver<EngineEvent>,
) -> io::Result<DispatcherHandle> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
    let dispatcher = Dispatcher {
        controller,
        events,
        shutdown: shutdown_rx,
    };

    let thread = thread::Builder::new()
        .name("accel-dispatch".to_string())
        .spawn(move || dispatcher.run())?;

    Ok(DispatcherHandle {
        shutdown: shutdown_tx,
        thread: Some(thread),
    })
}
