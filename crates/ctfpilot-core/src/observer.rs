/// Host callbacks. They run on the run task and must not block.
pub trait RunObserver: Send + Sync {
    fn on_flag_found(&self, _run_id: &str, _flag: &str) {}

    /// Called for completed and failed runs. Failed runs report no flags.
    fn on_complete(&self, _run_id: &str, _success: bool, _flags: &[String]) {}

    fn on_cancelled(&self, _run_id: &str, _flags: &[String]) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
