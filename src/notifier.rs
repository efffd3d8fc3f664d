use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::event::ClientEvent;

/// Fan-out of [`ClientEvent`]s to every connected foreground context.
///
/// Delivery is best effort. Nobody listening is not an error, and a
/// subscriber that falls behind loses the oldest events; it is expected to
/// resynchronize with a status query.
#[derive(Clone, Debug)]
pub struct ClientNotifier {
    sender: broadcast::Sender<ClientEvent>,
}

impl ClientNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers the event reached.
    pub fn broadcast(&self, event: ClientEvent) -> usize {
        match self.sender.send(event) {
            Ok(reached) => reached,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "no connected clients");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ClientNotifier {
    fn default() -> Self {
        Self::new(crate::BROADCAST_CAPACITY)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<ClientEvent>,
}

impl Subscription {
    /// Next event, skipping past any gap. `None` once the notifier is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleared() -> ClientEvent {
        ClientEvent::AiRequestQueueCleared { queue_length: 0 }
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_event() {
        let notifier = ClientNotifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        assert_eq!(notifier.connected_clients(), 2);

        assert_eq!(notifier.broadcast(cleared()), 2);

        assert_eq!(a.recv().await, Some(cleared()));
        assert_eq!(b.recv().await, Some(cleared()));
    }

    #[test]
    fn broadcasting_without_clients_is_fine() {
        let notifier = ClientNotifier::new(8);
        assert_eq!(notifier.broadcast(cleared()), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_latest() {
        let notifier = ClientNotifier::new(2);
        let mut slow = notifier.subscribe();
        for n in 0..5 {
            notifier.broadcast(ClientEvent::AiRequestQueueCleared { queue_length: n });
        }

        assert_eq!(
            slow.recv().await,
            Some(ClientEvent::AiRequestQueueCleared { queue_length: 3 })
        );
        assert_eq!(
            slow.try_recv(),
            Some(ClientEvent::AiRequestQueueCleared { queue_length: 4 })
        );
        assert_eq!(slow.try_recv(), None);
    }

    #[tokio::test]
    async fn closed_notifier_ends_subscription() {
        let notifier = ClientNotifier::new(2);
        let mut sub = notifier.subscribe();
        drop(notifier);
        assert_eq!(sub.recv().await, None);
    }
}
