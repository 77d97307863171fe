//! The terminal stage: owns the request table and drives a `Transport`
//! directly. Every other middleware stage eventually bottoms out here.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::middleware::Stage;
use crate::model::{Event, Request, RequestId, RequestState};
use crate::state::ClientState;
use crate::transport::Transport;

pub struct HttpMiddleware {
    state: ClientState,
    transport: Box<dyn Transport>,
}

impl HttpMiddleware {
    pub fn new(transport: Box<dyn Transport>, concurrency: usize) -> Self {
        HttpMiddleware { state: ClientState::new(concurrency), transport }
    }

    pub fn active_request_ids(&self) -> Vec<RequestId> {
        self.state.non_terminal_ids()
    }
}

impl Stage for HttpMiddleware {
    fn enqueue(&mut self, mut request: Request) -> RequestId {
        request.state = RequestState::Enqueued;
        self.state.insert_request(request)
    }

    fn tick(&mut self, config: &ClientConfig) -> Result<bool> {
        self.transport.event_loop_tick(&mut self.state, config)
    }

    fn pending_event(&mut self, id: RequestId) -> Option<Event> {
        self.state.pending(id).highest_priority()
    }

    fn acknowledge(&mut self, id: RequestId, event: Event) {
        self.state.pending_mut(id).clear(event);
        if event == Event::Finished {
            if let Some(req) = self.state.request_mut(id) {
                req.state = RequestState::Finished;
            }
        }
    }

    fn request(&self, id: RequestId) -> Option<&Request> {
        self.state.request(id)
    }

    fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.state.request_mut(id)
    }

    fn active_ids(&self) -> Vec<RequestId> {
        self.state.non_terminal_ids()
    }

    fn take_body_chunk(&mut self, id: RequestId) -> Vec<u8> {
        self.state.connection_mut(id).map(|c| c.take_body_buffer()).unwrap_or_default()
    }
}
