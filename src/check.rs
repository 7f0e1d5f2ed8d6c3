// SPDX-License-Identifier: Apache-2.0

//! A configured target and its per-poll bookkeeping: restoring progress, count mode
//! rollback and error suppression.

use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{ItemMode, LogSource, RotationMode, TargetConfig, split_logrt_path};
use crate::driver::{PollContext, PollOutcome, process_logrt};
use crate::error::{Error, Result};
use crate::input::file::{
    DirectoryFinder, FileFinder, FileSet, LineMatcher, ReadContext, SingleFileFinder,
    TextEncoding,
};
use crate::persistence::{JsonFilePersister, Persister, persistent_file_path};
use crate::sink::{ItemState, LogValue, Sink, ValueFlags};
use crate::state::TailState;

/// Consecutive failures tolerated before one is reported.
pub const MAX_SUPPRESSED_ERRORS: u32 = 2;

/// Result of checking a target once.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The poll completed.
    Done { jumped: bool },
    /// The poll failed, the failure is not reported yet.
    Suppressed(Error),
    /// The failure should be reported. The target stays active.
    Failed(Error),
}

impl CheckOutcome {
    pub fn is_reported_error(&self) -> bool {
        matches!(self, CheckOutcome::Failed(_))
    }
}

/// A tailed target.
pub struct Target {
    config: TargetConfig,
    destination: String,
    rotation: RotationMode,
    finder: Box<dyn FileFinder>,
    matcher: LineMatcher,
    encoding: TextEncoding,
    persister: Option<Box<dyn Persister>>,
    pub state: TailState,
}

impl Target {
    /// Build a target from its configuration. Persistent state is stored under the
    /// configured directory if there is one.
    pub fn new(destination: impl Into<String>, config: TargetConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let destination = destination.into();

        let finder: Box<dyn FileFinder> = match &config.source {
            LogSource::Log { path } => Box::new(SingleFileFinder::new(path.clone())),
            LogSource::LogRt { path } => {
                let (dir, pattern) = split_logrt_path(path)?;
                Box::new(DirectoryFinder::new(dir, &pattern)?)
            }
        };

        let persister: Option<Box<dyn Persister>> = match &config.persistent_dir {
            Some(root) => Some(Box::new(JsonFilePersister::open(
                root,
                &destination,
                &config.key,
            )?)),
            None => None,
        };

        Self::with_parts(destination, config, finder, persister)
    }

    /// Build a target around a given finder and persister.
    pub fn with_parts(
        destination: impl Into<String>,
        config: TargetConfig,
        finder: Box<dyn FileFinder>,
        persister: Option<Box<dyn Persister>>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;

        let matcher = LineMatcher::new(&config.pattern, config.output_template())?;
        let encoding = TextEncoding::from_name(&config.encoding)?;
        let rotation = config.rotation_mode();
        let state = TailState::new(config.skip_existing);

        Ok(Self {
            config,
            destination: destination.into(),
            rotation,
            finder,
            matcher,
            encoding,
            persister,
            state,
        })
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Where the snapshot of this target lives, if it persists progress.
    pub fn persistent_path(&self) -> Option<PathBuf> {
        self.config
            .persistent_dir
            .as_ref()
            .map(|root| persistent_file_path(root, &self.destination, &self.config.key))
    }

    /// Poll the target once, sending values to `sink`.
    pub fn check(&mut self, sink: &mut dyn Sink) -> CheckOutcome {
        if self.state.is_new && self.state.files.is_empty() {
            self.restore();
        }

        let count_mode = self.config.mode == ItemMode::Count;
        let mut budget = self.config.budget();
        let dispatched_before = budget.dispatched;
        let cursor_before = self.state.cursor;

        let persister = match &mut self.persister {
            Some(p) if !count_mode => Some(&mut **p as &mut dyn Persister),
            _ => None,
        };

        let mut ctx = PollContext {
            read: ReadContext {
                destination: &self.destination,
                key: &self.config.key,
                matcher: &self.matcher,
                encoding: &self.encoding,
                mode: self.config.mode,
            },
            rotation: self.rotation,
            max_delay: self.config.max_delay,
            is_logrt: self.config.source.is_logrt(),
            persister,
        };

        let PollOutcome {
            mut files,
            jumped,
            result,
        } = process_logrt(
            self.finder.as_mut(),
            &mut self.state,
            &mut budget,
            &mut ctx,
            sink,
        );

        // Lines already went out, the list describing them must be kept
        if !count_mode {
            if let Some(files) = files.take() {
                self.state.files = files;
            }
        }

        match result {
            Ok(()) => {
                self.state.error_count = 0;

                if count_mode {
                    let count = (dispatched_before - budget.dispatched).to_string();
                    let mut value = LogValue::line(
                        &self.destination,
                        &self.config.key,
                        &count,
                        self.state.cursor.lastlogsize,
                    );
                    value.mtime = Some(self.state.cursor.mtime);
                    value.flags = ValueFlags {
                        persistent: true,
                        count: true,
                    };

                    match sink.send(&value) {
                        Ok(()) => self.commit_count(files),
                        // Skipped data is gone whether or not the count got through
                        Err(_) if jumped => self.commit_count(files),
                        Err(e) => {
                            debug!(key = %self.config.key, error = %e, "Sink rejected count, rolling back");
                            self.state.cursor = cursor_before;
                        }
                    }
                }

                self.state.is_new = false;
                CheckOutcome::Done { jumped }
            }
            Err(e) => {
                if count_mode {
                    self.state.cursor = cursor_before;
                }

                if matches!(e, Error::Config(_) | Error::Regex(_)) {
                    return self.report(e, sink);
                }

                self.state.error_count += 1;
                if self.state.error_count <= MAX_SUPPRESSED_ERRORS {
                    debug!(
                        key = %self.config.key,
                        error_count = self.state.error_count,
                        error = %e,
                        "Suppressing error"
                    );
                    return CheckOutcome::Suppressed(e);
                }

                self.report(e, sink)
            }
        }
    }

    fn commit_count(&mut self, files: Option<FileSet>) {
        if let Some(files) = files {
            self.state.files = files;
        }
        self.persist();
    }

    /// Report `e` as the target state and remember where reading stands.
    fn report(&mut self, e: Error, sink: &mut dyn Sink) -> CheckOutcome {
        self.state.error_count = 0;
        warn!(key = %self.config.key, error = %e, "Target became not supported");

        let message = e.to_string();
        let mut value = LogValue::line(
            &self.destination,
            &self.config.key,
            &message,
            self.state.cursor.lastlogsize,
        );
        value.state = ItemState::NotSupported;
        value.mtime = Some(self.state.cursor.mtime);
        if let Err(send_err) = sink.send(&value) {
            debug!(key = %self.config.key, error = %send_err, "Cannot send target state");
        }

        self.persist();
        CheckOutcome::Failed(e)
    }

    /// Save the current progress, if the target persists it.
    pub fn persist(&mut self) {
        let snapshot = self.state.snapshot();
        if let Some(persister) = self.persister.as_mut() {
            if let Err(e) = persister.write(&snapshot) {
                warn!(key = %self.config.key, error = %e, "Cannot save progress");
            }
        }
    }

    fn restore(&mut self) {
        let Some(persister) = self.persister.as_ref() else {
            return;
        };

        match persister.read() {
            Ok(Some(snapshot)) => match self.state.restore(&self.config.key, &snapshot) {
                Ok(_) => info!(
                    key = %self.config.key,
                    lastlogsize = self.state.cursor.lastlogsize,
                    mtime = self.state.cursor.mtime,
                    "Restored progress from persistent file"
                ),
                Err(e) => warn!(key = %self.config.key, error = %e, "Cannot restore progress"),
            },
            Ok(None) => debug!(key = %self.config.key, "No persistent progress"),
            Err(e) => warn!(key = %self.config.key, error = %e, "Cannot read persistent file"),
        }
    }

    /// The snapshot file is no longer needed, e.g. the target was removed.
    pub fn forget(&mut self) -> Result<()> {
        match self.persister.as_mut() {
            Some(p) => p.remove(),
            None => Ok(()),
        }
    }
}
