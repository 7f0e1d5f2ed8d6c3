// SPDX-License-Identifier: Apache-2.0

//! Runs the configured targets.
//!
//! Every target gets its own task that polls on the target's refresh interval. Polls
//! do blocking file I/O and run via spawn_blocking, one at a time per target. A
//! separate task removes snapshot files no target uses anymore.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::check::{CheckOutcome, Target};
use crate::config::LogtailConfig;
use crate::persistence::{InactiveFiles, hash_with_len};
use crate::sink::{LogValue, Sink};

/// Sink shared by the tasks of all targets.
pub struct SharedSink<S>(Arc<StdMutex<S>>);

impl<S> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S: Sink> SharedSink<S> {
    pub fn new(sink: S) -> Self {
        Self(Arc::new(StdMutex::new(sink)))
    }

    /// Run `f` with the sink locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.0.lock().ok().map(|mut s| f(&mut *s))
    }
}

impl<S: Sink> Sink for SharedSink<S> {
    fn send(&mut self, value: &LogValue<'_>) -> Result<(), BoxError> {
        let mut sink = self
            .0
            .lock()
            .map_err(|e| -> BoxError { format!("sink lock poisoned: {e}").into() })?;
        sink.send(value)
    }
}

pub struct LogtailReceiver {
    config: LogtailConfig,
    targets: Vec<Target>,
}

impl LogtailReceiver {
    pub fn new(config: LogtailConfig) -> Result<Self, BoxError> {
        config.validate().map_err(|e| -> BoxError { e.into() })?;

        let targets = config
            .targets
            .iter()
            .map(|t| {
                Target::new(config.destination.clone(), t.clone()).map_err(|e| -> BoxError {
                    format!("Failed to set up target \"{}\": {e}", t.key).into()
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { config, targets })
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Spawn one task per target plus the snapshot collector into `task_set`.
    pub async fn start<S: Sink + 'static>(
        self,
        sink: SharedSink<S>,
        task_set: &mut JoinSet<Result<(), BoxError>>,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        info!(
            destination = %self.config.destination,
            targets = self.targets.len(),
            "Starting log tailing"
        );

        let active: HashSet<PathBuf> = self
            .targets
            .iter()
            .filter_map(|t| t.persistent_path())
            .collect();
        let snapshot_dirs: HashSet<PathBuf> = self
            .targets
            .iter()
            .filter_map(|t| t.config().persistent_dir.as_ref())
            .map(|root| root.join(hash_with_len(&self.config.destination)))
            .collect();

        if !snapshot_dirs.is_empty() {
            let interval = Duration::from_secs(self.config.gc_interval.max(1));
            let cancel = cancel.clone();
            task_set.spawn(async move {
                collect_inactive(snapshot_dirs, active, interval, cancel).await;
                Ok(())
            });
        }

        for target in self.targets {
            let sink = sink.clone();
            let cancel = cancel.clone();
            task_set.spawn(async move { run_target(target, sink, cancel).await });
        }

        Ok(())
    }
}

async fn run_target<S: Sink + 'static>(
    mut target: Target,
    sink: SharedSink<S>,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let key = target.key().to_string();
    let mut interval = tokio::time::interval(target.config().refresh_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(key = %key, path = %target.config().source.path_display(), "Target started");

    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = interval.tick() => {
                let mut poll_sink = sink.clone();
                let (returned, outcome) = tokio::task::spawn_blocking(move || {
                    let outcome = target.check(&mut poll_sink);
                    (target, outcome)
                })
                .await
                .map_err(|e| -> BoxError {
                    error!(key = %key, error = %e, "Poll task failed");
                    e.into()
                })?;
                target = returned;

                match outcome {
                    CheckOutcome::Done { jumped: true } => {
                        info!(key = %key, "Skipped part of the backlog to stay within max_delay");
                    }
                    CheckOutcome::Done { .. } | CheckOutcome::Suppressed(_) => {}
                    CheckOutcome::Failed(e) if e.is_transient() => {
                        warn!(key = %key, error = %e, "Target is not supported, will keep trying");
                    }
                    CheckOutcome::Failed(e) => {
                        error!(key = %key, error = %e, "Target is not supported");
                    }
                }
            }
        }
    }

    // Make the latest position durable before exiting
    let target = tokio::task::spawn_blocking(move || {
        target.persist();
        target
    })
    .await?;
    debug!(key = %target.key(), "Target stopped");
    Ok(())
}

async fn collect_inactive(
    dirs: HashSet<PathBuf>,
    active: HashSet<PathBuf>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut gc = InactiveFiles::new();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = interval.tick() => {
                let now = chrono::Utc::now().timestamp();
                for dir in &dirs {
                    match gc.schedule_unused(dir, &active, now) {
                        Ok(0) => {}
                        Ok(n) => debug!(dir = ?dir, scheduled = n, "Found unused persistent files"),
                        Err(e) => warn!(dir = ?dir, error = %e, "Cannot list persistent files"),
                    }
                }
                let removed = gc.collect(now);
                if !removed.is_empty() {
                    info!(removed = removed.len(), "Removed inactive persistent files");
                }
            }
        }
    }
}
