use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use shared::domain::UserId;
use storage::{PersistentStore, SqliteStore};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::info;
use url::Url;

pub mod backoff;
pub mod closed_set;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod credential;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod quota;
pub mod reconciler;
pub mod rest;
pub mod swapanza;
pub mod timer;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionPhase, ConnectionState, SocketKey};
pub use credential::Credential;
pub use engine::{ChatEngine, ClientEvent, EngineConfig, EngineDeps, EngineHandle, SignOutReason};
pub use error::{CredentialError, EngineError, SendError, SessionCommandError};
pub use swapanza::{SessionEndReason, SessionEvent, SessionPhase, SessionState};

/// Starts an engine against a real server, backed by the SQLite store.
///
/// A `credential` passed in is stored for later runs; without one the stored
/// credential is used.
pub async fn start_client(
    settings: &ClientSettings,
    local_user: UserId,
    credential: Option<Credential>,
) -> Result<(EngineHandle, broadcast::Receiver<ClientEvent>, JoinHandle<()>)> {
    let database_url = config::prepare_store_url(&settings.store_path)?;
    let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::new(&database_url).await?);

    let credential = match credential {
        Some(credential) => {
            store
                .set(credential::TOKEN_KEY, credential.token())
                .await
                .context("failed to store credential")?;
            credential
        }
        None => credential::load_credential(store.as_ref())
            .await?
            .ok_or_else(|| anyhow!(CredentialError::Missing))?,
    };

    let server_url = Url::parse(&settings.server_url)
        .with_context(|| format!("invalid server url: {}", settings.server_url))?;
    let deps = EngineDeps {
        api: Arc::new(rest::RestClient::new(server_url, credential.clone())),
        connector: Arc::new(transport::TungsteniteConnector),
        store,
    };
    let config = EngineConfig::from_settings(settings, local_user)?;
    info!(server_url = %settings.server_url, user_id = local_user.0, "starting chat client");
    ChatEngine::spawn(config, credential, deps).await
}
