//! Watch registration handles.

use crate::error::{Result, TxError};
use tokio::sync::oneshot;

/// A registered watch: resolves exactly once when the watched key's remote
/// value changes, independent of the registering transaction's outcome.
///
/// Dropping the handle abandons interest; the sender side fails silently.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<()>,
}

impl Watch {
    /// Builds the firing side and the caller-held handle.
    pub fn channel() -> (oneshot::Sender<()>, Watch) {
        let (tx, rx) = oneshot::channel();
        (tx, Watch { rx })
    }

    /// Waits for the watched key to change. Fails with
    /// [`TxError::Cancelled`] if the remote store drops the watch without
    /// firing it.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| TxError::Cancelled)
    }
}
