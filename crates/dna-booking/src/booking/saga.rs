//! Ordered compensation log for workflows spanning several stores.

use tracing::{debug, warn};

use super::repository::RepositoryError;

type Compensation<'a> = Box<dyn FnOnce() -> Result<(), RepositoryError> + 'a>;

/// Forward steps register their undo action here; `unwind` runs them newest first.
pub(crate) struct Compensations<'a> {
    workflow: &'static str,
    steps: Vec<(String, Compensation<'a>)>,
}

impl<'a> Compensations<'a> {
    pub(crate) fn new(workflow: &'static str) -> Self {
        Self {
            workflow,
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(
        &mut self,
        label: impl Into<String>,
        undo: impl FnOnce() -> Result<(), RepositoryError> + 'a,
    ) {
        self.steps.push((label.into(), Box::new(undo)));
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    /// Drops the registered undo actions; the forward steps stand.
    pub(crate) fn commit(self) {
        debug!(workflow = self.workflow, steps = self.steps.len(), "workflow committed");
    }

    /// Runs every undo action in reverse order. Failures are logged and counted, never
    /// raised, so they cannot mask the error that triggered the unwind.
    pub(crate) fn unwind(self) -> usize {
        let workflow = self.workflow;
        let mut failures = 0;
        for (label, undo) in self.steps.into_iter().rev() {
            if let Err(err) = undo() {
                failures += 1;
                warn!(workflow, step = %label, error = %err, "compensation failed");
            } else {
                debug!(workflow, step = %label, "compensated");
            }
        }
        failures
    }
}
