//! Cancellation signal combinators
//!
//! A single invocation can be aborted from more than one place (the caller's
//! own token and the progress tracker's token). `CombinedSignal` merges any
//! number of `CancellationToken`s into one that fires when *any* of them does.

use futures::future::select_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A token that is cancelled as soon as any of its sources is cancelled.
///
/// Cancelling the combined token never propagates back to the sources.
/// If a source is already cancelled at construction time the combined token
/// starts out cancelled. With two or more live sources a small watcher task
/// is spawned on the current tokio runtime; it is aborted when the signal is
/// dropped.
#[derive(Debug)]
pub struct CombinedSignal {
    token: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl CombinedSignal {
    pub fn any_of<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        let sources: Vec<CancellationToken> = sources.into_iter().collect();

        if sources.iter().any(CancellationToken::is_cancelled) {
            let token = CancellationToken::new();
            token.cancel();
            return Self {
                token,
                watcher: None,
            };
        }

        match sources.len() {
            0 => Self {
                token: CancellationToken::new(),
                watcher: None,
            },
            1 => Self {
                token: sources[0].child_token(),
                watcher: None,
            },
            _ => {
                let token = CancellationToken::new();
                let combined = token.clone();
                let watcher = tokio::spawn(async move {
                    let waits = sources
                        .into_iter()
                        .map(|source| Box::pin(source.cancelled_owned()));
                    tokio::select! {
                        _ = select_all(waits) => combined.cancel(),
                        _ = combined.cancelled() => {}
                    }
                });
                Self {
                    token,
                    watcher: Some(watcher),
                }
            }
        }
    }

    /// Token handed to the process primitive
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for CombinedSignal {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_either_source_aborts() {
        let external = CancellationToken::new();
        let internal = CancellationToken::new();
        let signal = CombinedSignal::any_of([external.clone(), internal.clone()]);
        assert!(!signal.is_cancelled());

        internal.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert!(!external.is_cancelled());

        let external = CancellationToken::new();
        let internal = CancellationToken::new();
        let signal = CombinedSignal::any_of([external.clone(), internal.clone()]);
        external.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
        assert!(!internal.is_cancelled());
    }

    #[tokio::test]
    async fn test_pre_cancelled_source_is_reflected_immediately() {
        let external = CancellationToken::new();
        external.cancel();

        let signal = CombinedSignal::any_of([external, CancellationToken::new()]);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_does_not_propagate_to_sources() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let signal = CombinedSignal::any_of([a.clone(), b.clone()]);

        signal.cancel();
        assert!(signal.is_cancelled());
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn test_single_source_uses_child_token() {
        let only = CancellationToken::new();
        let signal = CombinedSignal::any_of([only.clone()]);
        assert!(signal.watcher.is_none());

        only.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_no_sources_never_fires_on_its_own() {
        let signal = CombinedSignal::any_of(Vec::new());
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
    }
}
