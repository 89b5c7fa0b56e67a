use anyhow::{bail, Result};
use tracing::debug;

/// End-of-run notification hook. The workflow calls this once per run with
/// a short summary; delivery is site-specific and pluggable via the
/// `notification_method` config option.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &str) -> Result<()>;
}

/// Default notifier: discards the summary.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, summary: &str) -> Result<()> {
        debug!("Notification suppressed (method \"none\"): {summary}");
        Ok(())
    }
}

pub fn build_notifier(method: &str) -> Result<Box<dyn Notifier>> {
    match method {
        "none" => Ok(Box::new(NoopNotifier)),
        other => bail!("Unknown notification method {other:?}"),
    }
}
