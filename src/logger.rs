/// Line-oriented log sink injected into the pipelines.
pub trait PatchLogger: Send + Sync {
    fn log(&self, message: &str);
}

/// Discards everything. The default for library callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl PatchLogger for NoopLogger {
    fn log(&self, _message: &str) {}
}

/// Forwards every line to the installed `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl PatchLogger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::info!("{message}");
    }
}
