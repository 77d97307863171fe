//! Shared bookkeeping owned exclusively by the Client: the request table, the
//! connection table, per-request pending-event flags, and the concurrency-cap
//! slice used to decide which ENQUEUED requests get to start.

use std::collections::HashMap;

use crate::model::{Connection, PendingEvents, Request, RequestId, RequestState};

pub struct ClientState {
    pub concurrency: usize,
    requests: HashMap<RequestId, Request>,
    connections: HashMap<RequestId, Connection>,
    pending: HashMap<RequestId, PendingEvents>,
    order: Vec<RequestId>,
}

impl ClientState {
    pub fn new(concurrency: usize) -> Self {
        ClientState {
            concurrency: concurrency.max(1),
            requests: HashMap::new(),
            connections: HashMap::new(),
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn insert_request(&mut self, request: Request) -> RequestId {
        let id = request.id;
        self.order.push(id);
        self.requests.insert(id, request);
        self.pending.insert(id, PendingEvents::default());
        id
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    pub fn request_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&id)
    }

    pub fn connection(&self, id: RequestId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: RequestId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn insert_connection(&mut self, conn: Connection) {
        self.connections.insert(conn.request_id, conn);
    }

    /// Releases the connection record for a request that has reached a terminal
    /// state. Safe to call more than once.
    pub fn release_connection(&mut self, id: RequestId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn pending(&self, id: RequestId) -> PendingEvents {
        self.pending.get(&id).copied().unwrap_or_default()
    }

    pub fn pending_mut(&mut self, id: RequestId) -> &mut PendingEvents {
        self.pending.entry(id).or_default()
    }

    pub fn any_pending(&self, ids: &[RequestId]) -> bool {
        ids.iter().any(|id| self.pending(*id).any())
    }

    /// All request ids in enqueue order.
    pub fn all_ids(&self) -> &[RequestId] {
        &self.order
    }

    pub fn non_terminal_ids(&self) -> Vec<RequestId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.requests.get(id).is_some_and(|r| !r.state.is_terminal()))
            .collect()
    }

    /// The set of requests that are allowed to make network progress right now:
    /// every request already past ENQUEUED, plus as many still-ENQUEUED requests
    /// as fit in the remaining concurrency slots, in enqueue order.
    pub fn active_slice(&self) -> Vec<RequestId> {
        let mut active = Vec::new();
        let mut enqueued_waiting = Vec::new();
        for &id in &self.order {
            let Some(req) = self.requests.get(&id) else { continue };
            if req.state.is_terminal() {
                continue;
            }
            if req.state == RequestState::Enqueued {
                enqueued_waiting.push(id);
            } else {
                active.push(id);
            }
        }
        let remaining = self.concurrency.saturating_sub(active.len());
        active.extend(enqueued_waiting.into_iter().take(remaining));
        active
    }

    /// Requests matching any of `states`, or every non-terminal request if
    /// `states` is empty/`None`.
    pub fn requests_in_states(&self, states: Option<&[RequestState]>) -> Vec<RequestId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.requests
                    .get(id)
                    .is_some_and(|r| states.map_or(true, |s| s.contains(&r.state)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn req(url: &str) -> Request {
        Request::new(Method::GET, url, http::HeaderMap::new(), None).unwrap()
    }

    #[test]
    fn active_slice_respects_concurrency_cap() {
        let mut state = ClientState::new(2);
        let ids: Vec<_> = (0..4)
            .map(|i| {
                let mut r = req(&format!("http://example.com/{i}"));
                r.state = RequestState::Enqueued;
                state.insert_request(r)
            })
            .collect();
        let active = state.active_slice();
        assert_eq!(active.len(), 2);
        assert_eq!(&active[..], &ids[..2]);
    }

    #[test]
    fn active_slice_counts_in_flight_requests_against_the_cap() {
        let mut state = ClientState::new(1);
        let mut first = req("http://example.com/a");
        first.state = RequestState::Sent;
        let first_id = state.insert_request(first);

        let mut second = req("http://example.com/b");
        second.state = RequestState::Enqueued;
        state.insert_request(second);

        let active = state.active_slice();
        assert_eq!(active, vec![first_id]);
    }

    #[test]
    fn terminal_requests_are_excluded() {
        let mut state = ClientState::new(5);
        let mut r = req("http://example.com/a");
        r.state = RequestState::Finished;
        state.insert_request(r);
        assert!(state.active_slice().is_empty());
        assert!(state.non_terminal_ids().is_empty());
    }
}
