//! Single-resolution result channel between an attempt and its caller.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{HandshakeError, Result};

/// Creates a linked resolver and outcome.
pub(crate) fn channel<T>() -> (Resolver<T>, Outcome<T>) {
    let (tx, rx) = oneshot::channel();
    (Resolver { tx: Some(tx) }, Outcome { rx })
}

/// The attempt's side. Resolves the pending caller at most once.
///
/// 尝试一方持有的句柄，最多只能完成一次。
pub(crate) struct Resolver<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Resolver<T> {
    /// Delivers the result. A second call is refused with `AlreadyResolved`.
    pub(crate) fn resolve(&mut self, result: Result<T>) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            warn!("attempt outcome resolved twice");
            return Err(HandshakeError::AlreadyResolved);
        };
        if tx.send(result).is_err() {
            debug!("caller stopped waiting for the attempt outcome");
        }
        Ok(())
    }
}

/// The caller's side.
pub(crate) struct Outcome<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Outcome<T> {
    /// Waits for the attempt. A resolver dropped without resolving yields
    /// `Aborted`.
    pub(crate) async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or(Err(HandshakeError::Aborted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let (mut resolver, outcome) = channel::<u32>();
        resolver.resolve(Ok(7)).unwrap();
        assert!(matches!(
            resolver.resolve(Ok(8)),
            Err(HandshakeError::AlreadyResolved)
        ));
        assert_eq!(outcome.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropped_resolver_aborts_the_caller() {
        let (resolver, outcome) = channel::<u32>();
        drop(resolver);
        assert!(matches!(outcome.wait().await, Err(HandshakeError::Aborted)));
    }

    #[tokio::test]
    async fn resolving_after_the_caller_left_is_not_an_error() {
        let (mut resolver, outcome) = channel::<u32>();
        drop(outcome);
        assert!(resolver.resolve(Err(HandshakeError::ServerFull)).is_ok());
    }
}
