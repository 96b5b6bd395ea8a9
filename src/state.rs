use std::sync::Arc;

use crate::{
    collab::SessionManager,
    executor::{Executor, InFlight},
    store::DocumentStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: DocumentStore,
    pub executor: Arc<Executor>,
    pub in_flight: InFlight,
    pub sessions: Arc<SessionManager>,
    pub history_limit: u32,
}
