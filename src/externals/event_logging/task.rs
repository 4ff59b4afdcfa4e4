use tokio::sync::broadcast::Receiver;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::status_event::StatusEvent;

/// Task: log every status event until cancelled or the supervisor is gone.
#[tracing::instrument(skip_all)]
pub async fn task_status_event_logging(token: CancellationToken, rx_status: Receiver<StatusEvent>) {
    info!("Started.");
    let mut events = BroadcastStream::new(rx_status);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            event = events.next() => match event {
                Some(Ok(event)) => info!("Got status event: {}", event),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!("Fell behind, missed {} status events.", missed);
                }
                None => {
                    debug!("Status channel closed.");
                    break;
                }
            }
        };
    }
}
