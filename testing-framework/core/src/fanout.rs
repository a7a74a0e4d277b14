//! Error-group style fan-out over a [`JoinSet`]: the first failure aborts the
//! remaining tasks, panics surface as errors, and dropping the group cancels
//! everything it spawned.

use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use futures::FutureExt as _;
use tokio::task::{JoinError, JoinSet};

pub struct ErrGroup<T, E> {
    tasks: JoinSet<Result<T, E>>,
}

impl<T, E> Default for ErrGroup<T, E>
where
    T: Send + 'static,
    E: From<TaskPanicked> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned task panicked or was aborted by the runtime.
#[derive(Debug, thiserror::Error)]
#[error("task failed: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

impl<T, E> ErrGroup<T, E>
where
    T: Send + 'static,
    E: From<TaskPanicked> + Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(TaskPanicked {
                        message: panic_message(panic),
                    }
                    .into())
                })
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every task. On the first error the siblings are aborted and
    /// drained before the error is returned. Results are in completion order.
    pub async fn wait(mut self) -> Result<Vec<T>, E> {
        let mut outputs = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match flatten(joined) {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(err) => {
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return Err(err);
                }
            }
        }
        Ok(outputs)
    }
}

fn flatten<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<Option<T>, E>
where
    E: From<TaskPanicked>,
{
    match joined {
        Ok(outcome) => outcome.map(Some),
        Err(join_err) if join_err.is_cancelled() => Ok(None),
        Err(join_err) => Err(TaskPanicked {
            message: join_err.to_string(),
        }
        .into()),
    }
}

/// Attempts to turn a panic payload into a readable string for diagnostics.
#[must_use]
pub fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic.downcast::<String>().map_or_else(
        |panic| {
            panic.downcast::<&'static str>().map_or_else(
                |_| "unknown panic".to_owned(),
                |message| (*message).to_owned(),
            )
        },
        |message| *message,
    )
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{ErrGroup, TaskPanicked};

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    enum TestError {
        #[error("boom")]
        Boom,
        #[error("panicked: {0}")]
        Panicked(String),
    }

    impl From<TaskPanicked> for TestError {
        fn from(value: TaskPanicked) -> Self {
            Self::Panicked(value.message)
        }
    }

    #[tokio::test]
    async fn collects_every_success() {
        let mut group = ErrGroup::<u32, TestError>::new();
        for i in 0..4 {
            group.spawn(async move { Ok(i) });
        }

        let mut outputs = group.wait().await.expect("all tasks succeed");
        outputs.sort_unstable();
        assert_eq!(outputs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn first_error_aborts_siblings() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut group = ErrGroup::<(), TestError>::new();

        let flag = Arc::clone(&finished);
        group.spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        group.spawn(async { Err(TestError::Boom) });

        assert_eq!(group.wait().await, Err(TestError::Boom));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let mut group = ErrGroup::<(), TestError>::new();
        group.spawn(async { panic!("chain exploded") });

        assert_eq!(
            group.wait().await,
            Err(TestError::Panicked("chain exploded".to_owned()))
        );
    }
}
