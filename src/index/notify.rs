//! Change notification
//!
//! Channel indexes push the set of channels that advanced onto a bounded
//! queue. A full queue applies backpressure to the poller rather than
//! dropping notifications.

use tokio::sync::mpsc;

use crate::types::ChannelSet;

pub type ChangeReceiver = mpsc::Receiver<ChannelSet>;

#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    tx: mpsc::Sender<ChannelSet>,
}

impl ChangeNotifier {
    pub fn channel(capacity: usize) -> (Self, ChangeReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A notifier nobody listens to
    pub fn disconnected() -> Self {
        let (notifier, _rx) = Self::channel(1);
        notifier
    }

    pub async fn notify(&self, channels: ChannelSet) {
        if let Err(e) = self.tx.send(channels).await {
            tracing::debug!(channels = ?e.0, "Change listener gone, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_delivers_in_order() {
        let (notifier, mut rx) = ChangeNotifier::channel(4);
        notifier.notify(ChannelSet::from(["a".to_string()])).await;
        notifier.notify(ChannelSet::from(["b".to_string()])).await;

        assert!(rx.recv().await.unwrap().contains("a"));
        assert!(rx.recv().await.unwrap().contains("b"));
    }

    #[tokio::test]
    async fn test_notify_without_listener_does_not_fail() {
        ChangeNotifier::disconnected()
            .notify(ChannelSet::from(["a".to_string()]))
            .await;
    }
}
