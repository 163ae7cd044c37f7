use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capture::frame::FramePayload;
use crate::display::FrameView;
use crate::registry::CameraId;

use super::slot::{Counter, SlotCounters};

/// Push preview frames to the view until the queue closes or we are cancelled.
pub async fn run_preview(
    alias: CameraId,
    rx: flume::Receiver<FramePayload>,
    view: Arc<dyn FrameView>,
    counters: Arc<SlotCounters>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = rx.recv_async() => match payload {
                Ok(payload) => payload,
                Err(_) => break,
            },
        };
        view.show_frame(&alias, &payload);
        counters.incr(Counter::PreviewShown);
    }
    debug!("{}: preview consumer stopped", alias);
}
