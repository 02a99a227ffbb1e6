//! Scheduled periodic task on a dedicated thread.
//!
//! Used by store polling and by timed cache clearing. A tick runs to
//! completion before the next one is scheduled; stopping only prevents
//! future ticks.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

enum Control {
    Interval(Duration),
    Stop,
}

/// Handle to a periodic task. Dropping it stops the task.
pub struct Periodic {
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    /// Spawn a thread running `task` every `interval`.
    pub fn start<F>(name: &str, interval: Duration, task: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = channel::unbounded::<Control>();
        let handle = thread::Builder::new()
            .name(format!("nutflow-{name}"))
            .spawn(move || {
                let mut interval = interval;
                loop {
                    channel::select! {
                        recv(rx) -> msg => match msg {
                            Ok(Control::Interval(d)) => interval = d,
                            Ok(Control::Stop) | Err(_) => break,
                        },
                        default(interval) => task(),
                    }
                }
            })
            .ok();

        Self {
            control: tx,
            handle,
        }
    }

    /// Change the period. Takes effect after the current wait.
    pub fn set_interval(&self, interval: Duration) {
        let _ = self.control.send(Control::Interval(interval));
    }

    /// Stop future ticks. An in-flight tick completes.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Whether the worker thread is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a configured number of seconds into a period.
///
/// Non-positive values mean "disabled".
pub fn period_from_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs.unsigned_abs()))
}
