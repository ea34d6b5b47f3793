//! Synthetic per-participant number stream, used to exercise the relay
//! without a physical device.

use std::time::Duration;

use relay_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// `"<index>,<bits>"` with the byte rendered as eight binary digits
pub fn format_sample(index: u64, bits: u8) -> String {
    format!("{},{:08b}", index, bits)
}

/// Emit one sample per `interval` until `cancel` fires or the participant goes away.
pub fn spawn(
    tx: mpsc::UnboundedSender<ServerEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut index: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    index += 1;
                    let sample = format_sample(index, rand::random::<u8>());
                    if tx.send(ServerEvent::RandomNumber(sample)).is_err() {
                        break;
                    }
                }
            }
        }
        debug!(samples = index, "Random number generator stopped");
    });
}
