use tokio::sync::mpsc;
use uuid::Uuid;
use crate::request::{Generation, GenerationRequest};

/// A validated request waiting for admission, with the channel its records go to.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    request: GenerationRequest,
    sender: mpsc::UnboundedSender<Generation>,
    input_length: Option<usize>,
}

impl PendingRequest {
    pub(crate) fn new(
        request: GenerationRequest,
        sender: mpsc::UnboundedSender<Generation>,
    ) -> Self {
        Self { request, sender, input_length: None }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.request.id
    }

    pub(crate) fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// Prompt length after truncation, once measured.
    pub(crate) fn input_length(&self) -> Option<usize> {
        self.input_length
    }

    pub(crate) fn set_input_length(&mut self, input_length: usize) {
        self.input_length = Some(input_length);
    }

    /// Whether the client dropped its stream before admission.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn into_parts(self) -> (GenerationRequest, mpsc::UnboundedSender<Generation>) {
        (self.request, self.sender)
    }
}
