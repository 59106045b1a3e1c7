use async_channel::Receiver;
use tokio::select;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::messages::PushEvent;

/// Per-subscriber queue depth. A subscriber that falls further behind than
/// this loses the oldest updates; state deltas are idempotent and
/// last-write-wins, so catching up on the newer ones is enough.
const SUBSCRIBER_BUFFER: usize = 256;

/// Subscription handle shared with the push sessions.
#[derive(Debug, Clone)]
pub struct PushBusHandle {
    sender: broadcast::Sender<String>,
}

impl PushBusHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

pub fn new_bus() -> PushBusHandle {
    let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
    PushBusHandle { sender }
}

/// Worker draining the managers' delta channel: serialize each event once
/// and fan it out to every connected subscriber.
pub async fn run(cancel: CancellationToken, receiver: Receiver<PushEvent>, bus: PushBusHandle) {
    info!("Starting push bus worker");

    loop {
        select! {
            _ = cancel.cancelled() => break,

            event = receiver.recv() => match event {
                Err(_) => break,
                Ok(event) => {
                    let payload = event.to_json().to_string();
                    // Err just means nobody is connected right now.
                    let _ = bus.sender.send(payload);
                }
            },
        }
    }

    info!("Push bus worker stopped");
}
