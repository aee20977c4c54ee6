use relay_core::{Relay, WriterConfig};
use session_auth::TokenConfig;
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) storage: Storage,
    pub(crate) relay: Relay,
    pub(crate) tokens: TokenConfig,
    pub(crate) writer: WriterConfig,
}
