use std::{ops::Deref, sync::Arc};

use tokio::sync::{futures::Notified, Notify, Semaphore};

#[derive(Debug)]
pub(crate) struct WaitGroupInner {
    sem: Semaphore,
    count: u32,
}

impl WaitGroupInner {
    pub(crate) fn done(&self) {
        self.sem.add_permits(1);
    }
    pub(crate) async fn wait(
        &self,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, tokio::sync::AcquireError> {
        self.sem.acquire_many(self.count).await
    }
}

/// Cooperative shutdown handle for a background task: the owner calls
/// `signal` then `wait`; the task watches `captured` and calls `done` when
/// it has finished its in-flight unit.
#[derive(Debug, Clone)]
pub(crate) struct Closer(Arc<CloserInner>);

#[derive(Debug)]
struct CloserInner {
    wait_group: WaitGroupInner,
    notify: Notify,
}

impl Closer {
    pub(crate) fn new(count: u32) -> Self {
        Self(
            CloserInner {
                wait_group: WaitGroupInner {
                    sem: Semaphore::new(0),
                    count,
                },
                notify: Notify::new(),
            }
            .into(),
        )
    }

    pub(crate) fn signal(&self) {
        self.0.notify.notify_one();
    }

    pub(crate) fn captured(&self) -> Notified<'_> {
        self.0.notify.notified()
    }

    pub(crate) async fn signal_and_wait(&self) {
        self.signal();
        let _ = self.wait().await;
    }
}

impl Deref for Closer {
    type Target = WaitGroupInner;

    fn deref(&self) -> &Self::Target {
        &self.0.wait_group
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Closer;

    #[tokio::test]
    async fn test_closer_round_trip() {
        let closer = Closer::new(1);
        let task_closer = closer.clone();
        let handle = tokio::spawn(async move {
            task_closer.captured().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            task_closer.done();
        });
        closer.signal_and_wait().await;
        handle.await.unwrap();
    }
}
