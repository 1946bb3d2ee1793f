use tokio::sync::broadcast;

/// Receiving side of a shutdown request.
///
/// Resolves when [`ShutdownSender::send_signal`] is called or when the sender
/// is dropped.
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx), ShutdownSignal { rx })
    }

    pub async fn recv(&mut self) {
        let _ = self.rx.recv().await;
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_clones() {
        let (tx, mut signal) = ShutdownSignal::new();
        let mut other = signal.clone();
        tx.send_signal();
        signal.recv().await;
        other.recv().await;
    }

    #[tokio::test]
    async fn dropped_sender_resolves() {
        let (tx, mut signal) = ShutdownSignal::new();
        drop(tx);
        signal.recv().await;
    }
}
