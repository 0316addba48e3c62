use tokio::task::AbortHandle;
use tokio::task::JoinHandle;

/// Aborts every task it holds when dropped. Every connection task and
/// every Supervisor-managed upstream task is wrapped in one of these, so
/// tearing down a session or an `UpstreamClient` is just dropping the
/// handle rather than manually tracking every spawned task.
#[derive(Debug)]
pub struct AbortOnDrop {
    abort_handle: Vec<AbortHandle>,
}

impl AbortOnDrop {
    pub fn new<T: Send + 'static>(handle: JoinHandle<T>) -> Self {
        let abort_handle = vec![handle.abort_handle()];
        Self { abort_handle }
    }

    pub fn is_finished(&self) -> bool {
        for task in &self.abort_handle {
            if !task.is_finished() {
                return false;
            }
        }
        true
    }

    pub fn add_task<T: Send + 'static>(&mut self, handle: JoinHandle<T>) {
        self.abort_handle.push(handle.abort_handle());
    }
}

impl core::ops::Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.abort_handle {
            task.abort();
        }
    }
}

impl<T: Send + 'static> From<JoinHandle<T>> for AbortOnDrop {
    fn from(value: JoinHandle<T>) -> Self {
        Self::new(value)
    }
}
