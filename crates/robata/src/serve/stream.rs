use std::pin::Pin;
use std::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;
use crate::request::Generation;

/// # GenerationStream
///
/// Per-step [`Generation`] records of one request, in order.
///
/// The stream ends after the record carrying the completed generation, or
/// early if the batch holding the request failed. Dropping the stream cancels
/// the request; it leaves the active batch at the next step boundary.
pub struct GenerationStream {
    request_id: Uuid,
    receiver: mpsc::UnboundedReceiver<Generation>,
}

impl GenerationStream {
    pub(crate) fn new(request_id: Uuid, receiver: mpsc::UnboundedReceiver<Generation>) -> Self {
        Self { request_id, receiver }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }
}

impl Stream for GenerationStream {
    type Item = Generation;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_recv(cx)
    }
}
