//! Process-wide shared state: the store, the session table and the
//! script supervisor, bundled so sessions and hosts can reach them.

use crate::db::Store;
use crate::session::SessionRegistry;
use crate::supervisor::Supervisor;
use slog::Logger;
use std::sync::Arc;

pub struct Game {
    pub logger: Logger,
    pub store: Store,
    pub sessions: Arc<SessionRegistry>,
    pub supervisor: Supervisor,
}

impl Game {
    pub fn new(store: Store, logger: Logger) -> Arc<Game> {
        let sessions = Arc::new(SessionRegistry::new());
        let supervisor = Supervisor::new(store.clone(), sessions.clone(), logger.clone());
        Arc::new(Game {
            logger,
            store,
            sessions,
            supervisor,
        })
    }
}
