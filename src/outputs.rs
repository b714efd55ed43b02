//! Output aggregation.
//!
//! Every task reports exactly one outcome through [`OutputSink::add`], the single write
//! path. The in-process sink is a plain vector; the pool sink is a channel whose
//! receiving side lives with the controller, which files each outcome into the slot of
//! its submission index. Reading back always yields submission order, whatever order
//! workers finished in.

use crate::task::TaskOutcome;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Append-only destination for task outcomes.
pub trait OutputSink {
    /// Record the outcome of the task submitted at `index`.
    fn add(&mut self, index: usize, outcome: TaskOutcome);
}

/// Outcomes collected in the caller's own process.
#[derive(Debug, Default)]
pub struct InProcessOutputs {
    outcomes: Vec<(usize, TaskOutcome)>,
}

impl InProcessOutputs {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            outcomes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Drain into submission order.
    pub fn into_outcomes(mut self) -> Vec<TaskOutcome> {
        self.outcomes.sort_by_key(|(index, _)| *index);
        self.outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

impl OutputSink for InProcessOutputs {
    fn add(&mut self, index: usize, outcome: TaskOutcome) {
        self.outcomes.push((index, outcome));
    }
}

/// Sending half of the cross-process aggregator, one clone per dispatcher thread.
#[derive(Debug, Clone)]
pub struct ChannelOutputs {
    tx: Sender<(usize, TaskOutcome)>,
}

impl OutputSink for ChannelOutputs {
    fn add(&mut self, index: usize, outcome: TaskOutcome) {
        // The collector only disappears once the run is over; late outcomes are moot.
        let _ = self.tx.send((index, outcome));
    }
}

/// What [`OutputCollector::recv_timeout`] observed.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// An outcome for this index arrived; duplicates are reported but not filed.
    Outcome(usize),
    /// Nothing arrived in time.
    Timeout,
    /// Every sender is gone.
    Disconnected,
}

/// Receiving half of the cross-process aggregator, owned by the controller.
#[derive(Debug)]
pub struct OutputCollector {
    rx: Receiver<(usize, TaskOutcome)>,
    slots: Vec<Option<TaskOutcome>>,
}

/// Create a channel-backed aggregator sized for `task_count` tasks.
pub fn channel(task_count: usize) -> (ChannelOutputs, OutputCollector) {
    let (tx, rx) = mpsc::channel();
    let mut slots = Vec::with_capacity(task_count);
    slots.resize_with(task_count, || None);
    (
        ChannelOutputs { tx },
        OutputCollector { rx, slots },
    )
}

impl OutputCollector {
    /// Wait up to `timeout` for the next outcome and file it.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match self.rx.recv_timeout(timeout) {
            Ok((index, outcome)) => {
                self.file(index, outcome);
                Received::Outcome(index)
            }
            Err(RecvTimeoutError::Timeout) => Received::Timeout,
            Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
        }
    }

    fn file(&mut self, index: usize, outcome: TaskOutcome) {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(outcome),
            Some(_) => {
                tracing::warn!(index, "Duplicate outcome ignored");
            }
            None => {
                tracing::warn!(index, slots = self.slots.len(), "Outcome for unknown task ignored");
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&TaskOutcome> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Number of tasks this collector expects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Outcomes in submission order, or `None` while any slot is still empty.
    pub fn into_outcomes(self) -> Option<Vec<TaskOutcome>> {
        self.slots.into_iter().collect()
    }
}
