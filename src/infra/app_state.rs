use std::{fmt, sync::Arc};

use crate::auth::TokenVerifier;
use crate::infra::config::Config;
use crate::infra::websocket::ConnectionManager;
use crate::store::ScanStore;

/// Service object constructed once at startup and handed by reference to
/// every handler. Lifecycle is explicit: built in `main`, torn down via
/// `ConnectionManager::close_all` on shutdown.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ScanStore>,
    pub manager: Arc<ConnectionManager>,
    pub config: Arc<Config>,
    pub token_verifier: Arc<dyn TokenVerifier>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
