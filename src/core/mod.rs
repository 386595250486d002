pub mod commands;
pub mod readiness;
pub mod telemetry;

use tokio::task::JoinHandle;
use tracing::error;

/// Waits for a background task, logging a panic or abort instead of
/// dropping it. Returns the task's output when it finished normally.
pub async fn join_task<T>(name: &str, handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(output) => Some(output),
        Err(e) => {
            error!(task = name, "Task failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    async fn test_join_task_returns_output() {
        let handle = tokio::spawn(async { 7u64 });
        assert_eq!(join_task("telemetry", handle).await, Some(7));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_join_task_logs_panics() {
        let handle = tokio::spawn(async { panic!("request loop blew up") });
        assert_eq!(join_task::<()>("requests", handle).await, None);
        assert!(logs_contain("Task failed"));
        assert!(logs_contain("requests"));
    }
}
