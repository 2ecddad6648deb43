use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

/// Periodic keep-alive timer.
///
/// Runs `tick` every `interval` on its own thread until stopped or
/// dropped. The first failing tick disables the timer; the session itself
/// is left alone.
pub struct KeepAlive {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start<F>(interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("rtsp-keepalive".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = tick() {
                                tracing::debug!(error = %e, "keep-alive failed, disabling timer");
                                return;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;

        tracing::debug!(?interval, "keep-alive armed");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Whether the timer thread is still running.
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}
