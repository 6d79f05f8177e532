//! Background drivers for [`MqttClient::process`].
//!
//! Both workers tick the client every `poll_interval` until stopped. They only differ
//! in where they run: [`MqttClient::spawn_worker`] on a dedicated thread and
//! [`spawn_tokio_worker`] as a task on the current tokio runtime.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use super::client::MqttClient;
use super::transport::Transport;

/// Handle to a worker thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stops the worker and waits for its current tick to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            // a panicking listener already reported itself
            let _ = join.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport + 'static> MqttClient<T> {
    /// Drives the client from a dedicated thread.
    pub fn spawn_worker(&self) -> io::Result<WorkerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let client = self.clone();
        let stop_flag = Arc::clone(&stop);
        let interval = self.options().poll_interval();
        let join = thread::Builder::new()
            .name(format!("mqtt-{}", self.client_id()))
            .spawn(move || {
                debug!(client_id = client.client_id(), "worker started");
                while !stop_flag.load(Ordering::Acquire) {
                    client.process();
                    thread::sleep(interval);
                }
                debug!(client_id = client.client_id(), "worker stopped");
            })?;
        Ok(WorkerHandle {
            stop,
            join: Some(join),
        })
    }
}

/// Drives the client from a tokio task. Abort the returned handle to stop it.
///
/// `process` never blocks, so it runs directly on the runtime.
#[cfg(feature = "tokio-worker")]
pub fn spawn_tokio_worker<T: Transport + 'static>(
    client: MqttClient<T>,
) -> tokio::task::JoinHandle<()> {
    let period = client.options().poll_interval().max(std::time::Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            client.process();
        }
    })
}
