use super::ThreadId;
use crate::errors::SpawnError;
use crate::runtime::{self, Runtime};

/// Thread factory with per-thread settings.
///
/// ```no_run
/// use simple_threads::{Runtime, SchedulerConfig, ThreadBuilder};
///
/// let rt = Runtime::new(SchedulerConfig::cooperative());
/// rt.initialize().unwrap();
/// let id = ThreadBuilder::new()
///     .name("worker")
///     .stack_size(64 * 1024)
///     .spawn_on(&rt, || simple_threads::yield_now())
///     .unwrap();
/// assert_eq!(rt.thread_name(id).as_deref(), Some("worker"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ThreadBuilder {
    stack_size: Option<usize>,
    name: Option<String>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack size in bytes; the runtime's configured size if unset.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn on `runtime`.
    pub fn spawn_on<F>(self, runtime: &Runtime, f: F) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        runtime.inner().spawn(f, self.name, self.stack_size)
    }

    /// Spawn on the runtime active on the calling OS thread.
    pub fn spawn<F>(self, f: F) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + 'static,
    {
        runtime::try_with_active(|rt| rt.spawn(f, self.name, self.stack_size))
            .unwrap_or(Err(SpawnError::NotInitialized))
    }
}
