use std::ops::Deref;

use jobhub_queue::ProgressReporter;

/// What a handler receives: its decoded arguments plus the reporter for the
/// instance being executed.
///
/// Derefs to [`ProgressReporter`], so `ctx.append_log(..)` and
/// `ctx.interrupted()` work directly.
#[derive(Debug)]
pub struct JobContext<A> {
    pub args: A,
    reporter: ProgressReporter,
}

impl<A> JobContext<A> {
    pub fn new(args: A, reporter: ProgressReporter) -> Self {
        Self { args, reporter }
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn into_parts(self) -> (A, ProgressReporter) {
        (self.args, self.reporter)
    }
}

impl<A> Deref for JobContext<A> {
    type Target = ProgressReporter;

    fn deref(&self) -> &Self::Target {
        &self.reporter
    }
}
