//! Detached background work
//!
//! Post-commit side effects (publishing runtime endpoints, asynchronous
//! upstream validation) run on their own task with their own session. They
//! may outlive the request that submitted them; failures and panics end up
//! in the log and the [`TaskNotifier`], never in the caller.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::errors::Result;
use crate::storage::{Session, Store};

/// Receives the outcome of failed background tasks
#[async_trait]
pub trait TaskNotifier: Send + Sync + std::fmt::Debug {
    /// `subject` is the id the task works on (runtime service, upstream)
    async fn notify_failure(&self, task: &str, subject: &str, message: &str);
}

/// Notifier writing a structured warning keyed by subject
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl TaskNotifier for LogNotifier {
    async fn notify_failure(&self, task: &str, subject: &str, message: &str) {
        warn!(task = %task, subject = %subject, reason = %message, "Background task failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner {
    store: Store,
    notifier: Arc<dyn TaskNotifier>,
}

impl TaskRunner {
    pub fn new(store: Store, notifier: Arc<dyn TaskNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Open a session and run `work` with it on a detached task.
    ///
    /// The work owns the session and commits it; a session dropped without
    /// commit rolls back. The returned handle may be ignored.
    pub async fn submit<F, Fut>(&self, name: &'static str, subject: impl Into<String>, work: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(Session) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let session = self.store.begin().await?;
        let subject = subject.into();
        let notifier = self.notifier.clone();
        let span = info_span!("task", task = name, subject = %subject);

        let task = async move {
            match AssertUnwindSafe(work(session)).catch_unwind().await {
                Ok(Ok(())) => info!("Background task completed"),
                Ok(Err(e)) => {
                    error!(error = %e, "Background task failed");
                    notifier.notify_failure(name, &subject, &e.to_string()).await;
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "Background task panicked");
                    notifier.notify_failure(name, &subject, &format!("panicked: {}", message)).await;
                }
            }
        };
        Ok(tokio::spawn(task.instrument(span)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RouteplaneError;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<(String, String, String)>>);

    #[async_trait]
    impl TaskNotifier for Recorder {
        async fn notify_failure(&self, task: &str, subject: &str, message: &str) {
            self.0.lock().unwrap().push((task.to_string(), subject.to_string(), message.to_string()));
        }
    }

    fn runner() -> (TaskRunner, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (TaskRunner::new(Store::memory(), recorder.clone()), recorder)
    }

    #[tokio::test]
    async fn successful_task_is_not_reported() {
        let (runner, recorder) = runner();
        let handle = runner.submit("noop", "s1", |session| async move { session.commit().await }).await.unwrap();
        handle.await.unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_reaches_notifier() {
        let (runner, recorder) = runner();
        let handle = runner
            .submit("publish", "rs-1", |_session| async move { Err(RouteplaneError::validation("bad endpoint")) })
            .await
            .unwrap();
        handle.await.unwrap();
        let reports = recorder.0.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "publish");
        assert_eq!(reports[0].1, "rs-1");
        assert!(reports[0].2.contains("bad endpoint"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let (runner, recorder) = runner();
        let handle = runner
            .submit("explode", "u-1", |_session| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap();
        assert!(handle.await.is_ok());
        let reports = recorder.0.lock().unwrap();
        assert!(reports[0].2.contains("boom"));
    }

    #[traced_test]
    #[tokio::test]
    async fn log_notifier_keys_warning_by_subject() {
        LogNotifier.notify_failure("upstream_validate", "u-42", "backend down").await;
        assert!(logs_contain("Background task failed"));
        assert!(logs_contain("u-42"));
    }
}
