use crate::error::{MemoryError, Result};
use crate::manager::MemoryManager;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Background thread driving [`MemoryManager::check_zone`] on an interval.
///
/// Dropping the handle asks the thread to stop without waiting for it; use
/// [`MemoryMonitor::stop`] to wait with a bound.
#[derive(Debug)]
pub struct MemoryMonitor {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MemoryManager {
    pub fn spawn_monitor(&self, interval: Duration) -> std::io::Result<MemoryMonitor> {
        let (stop, stopped) = mpsc::channel::<()>();
        let manager = self.clone();
        let thread = std::thread::Builder::new()
            .name("tidemark-memory-monitor".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match manager.check_zone() {
                    Ok(0) => {}
                    Ok(freed) => tracing::debug!(
                        target: "tidemark.memory",
                        freed,
                        "monitor cycle freed memory"
                    ),
                    Err(MemoryError::Interrupted { .. }) => break,
                    Err(err) => tracing::warn!(
                        target: "tidemark.memory",
                        error = %err,
                        "memory check cycle failed"
                    ),
                }
            })?;

        Ok(MemoryMonitor {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl MemoryMonitor {
    /// Stop the monitor and wait up to `timeout` for its thread to exit.
    pub fn stop(mut self, timeout: Duration) -> Result<()> {
        self.stop.take();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        let started = Instant::now();
        while !thread.is_finished() {
            if started.elapsed() >= timeout {
                return Err(MemoryError::Timeout {
                    what: "memory monitor shutdown",
                    waited: started.elapsed(),
                });
            }
            std::thread::sleep(JOIN_POLL);
        }
        if thread.join().is_err() {
            tracing::error!(target: "tidemark.memory", "memory monitor thread panicked");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        // Disconnecting the channel is the stop signal.
        self.stop.take();
    }
}
