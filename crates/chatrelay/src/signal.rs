//! One-shot gate marking that streaming output has ended.

use tokio_util::sync::CancellationToken;

/// Monotonic, idempotent `Unset -> Set` gate.
///
/// Set by the backend when generation finishes, or early by the disconnect
/// monitor. Clones share the same gate.
#[derive(Debug, Clone, Default)]
pub struct CompletionSignal {
    token: CancellationToken,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the gate is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_is_idempotent() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_set());
        signal.set();
        signal.set();
        assert!(signal.is_set());
    }

    #[tokio::test]
    async fn clones_observe_the_same_gate() {
        let signal = CompletionSignal::new();
        let setter = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            setter.set();
        });
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_set());
    }
}
