use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Signal of stop shared between an owner and the tasks it spawned
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            token: CancellationToken::new(),
        }
    }

    /// A signal stopped together with this one, but cancellable on its own.
    pub fn child(&self) -> SignalOfStop {
        SignalOfStop {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_cancellation(&self) {
        self.token.cancelled().await
    }

    /// Run `fut` until it completes or the signal fires.
    pub async fn select<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Spawn `fut` on the runtime, dropping it when the signal fires.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let sos = self.clone();
        tokio::spawn(async move { sos.select(fut).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_select_completes_before_cancel() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_cancel_stops_spawned_task() {
        let sos = SignalOfStop::new();
        let handle = sos.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        sos.cancel();
        assert!(sos.cancelled());
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = SignalOfStop::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.cancelled());

        let other = parent.child();
        parent.cancel();
        other.wait_cancellation().await;
        assert!(other.cancelled());
    }
}
