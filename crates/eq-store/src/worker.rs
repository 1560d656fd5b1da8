//! Background compaction of sealed raw segments.
//!
//! Sealing hands the new segment id over a channel; the worker compacts
//! segments one at a time, in the order they were sealed. Closing the
//! sending side makes the worker finish its queue and exit.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::StoreInner;

pub(crate) struct CompactionWorker {
    thread: Option<JoinHandle<()>>,
}

impl CompactionWorker {
    pub(crate) fn start(inner: Arc<StoreInner>, jobs: Receiver<u64>) -> Result<Self> {
        let thread = thread::Builder::new()
            .name("eq-compactor".to_string())
            .spawn(move || {
                for id in jobs {
                    match inner.compact_segment(id) {
                        Ok(Some(_)) => {}
                        Ok(None) => debug!(segment = id, "nothing to compact"),
                        // The segment stays raw and queryable; a later
                        // `compact` run or retention pass retries it.
                        Err(e) => warn!(segment = id, error = %e, "background compaction failed"),
                    }
                }
                debug!("compaction worker exiting");
            })?;
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the worker to drain its queue. The sender must already be
    /// dropped, or this blocks forever.
    pub(crate) fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("compaction worker panicked");
            }
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
