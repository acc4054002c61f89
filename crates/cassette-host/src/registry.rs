//! Cassette registry. Keeps loaded cassettes and routes messages to them.
//!
//! Each cassette sits behind its own mutex, so a slow cassette only blocks
//! callers of that cassette. The registry-wide lock is held just long enough
//! to look an entry up. Guest calls run on the blocking pool, never on a
//! runtime worker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::cassette::Cassette;
use crate::error::CassetteError;
use crate::loader::CassetteLoader;
use crate::normalize::NormalizedMessage;
use crate::source::CassetteSource;

/// A registered cassette with the name it was loaded under.
struct LoadedCassette {
    name: String,
    cassette: Arc<Mutex<Cassette>>,
}

/// Loaded cassettes, indexed by cassette id.
pub struct CassetteRegistry {
    loader: CassetteLoader,
    cassettes: RwLock<HashMap<String, LoadedCassette>>,
    /// Ids in load order, for broadcasts.
    order: RwLock<Vec<String>>,
}

impl CassetteRegistry {
    pub fn new(loader: CassetteLoader) -> Self {
        Self {
            loader,
            cassettes: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Load a cassette and register it, returning its id.
    pub async fn load(&self, source: &CassetteSource) -> Result<String, CassetteError> {
        let cassette = self.loader.load(source).await?;
        Ok(self.insert(cassette).await)
    }

    /// Register an already loaded cassette.
    pub async fn insert(&self, cassette: Cassette) -> String {
        let id = cassette.id().to_string();
        let name = cassette.name().to_string();

        {
            let mut cassettes = self.cassettes.write().await;
            cassettes.insert(
                id.clone(),
                LoadedCassette {
                    name: name.clone(),
                    cassette: Arc::new(Mutex::new(cassette)),
                },
            );
        }
        self.order.write().await.push(id.clone());

        tracing::info!(cassette = %id, name = %name, "cassette registered");
        id
    }

    /// Remove a cassette; its instance is released once no call holds it.
    pub async fn unload(&self, id: &str) -> Result<(), CassetteError> {
        let removed = {
            let mut cassettes = self.cassettes.write().await;
            cassettes
                .remove(id)
                .ok_or_else(|| CassetteError::NotFound(id.to_string()))?
        };
        self.order.write().await.retain(|existing| existing != id);

        tracing::info!(cassette = %id, name = %removed.name, "cassette unloaded");
        Ok(())
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.cassettes.read().await.contains_key(id)
    }

    pub async fn loaded_count(&self) -> usize {
        self.cassettes.read().await.len()
    }

    /// `(id, name)` of every cassette, in load order.
    pub async fn loaded_cassettes(&self) -> Vec<(String, String)> {
        let order = self.order.read().await;
        let cassettes = self.cassettes.read().await;
        order
            .iter()
            .filter_map(|id| cassettes.get(id).map(|c| (id.clone(), c.name.clone())))
            .collect()
    }

    /// Shared handle to one cassette.
    pub async fn get(&self, id: &str) -> Result<Arc<Mutex<Cassette>>, CassetteError> {
        self.cassettes
            .read()
            .await
            .get(id)
            .map(|c| Arc::clone(&c.cassette))
            .ok_or_else(|| CassetteError::NotFound(id.to_string()))
    }

    /// Route a client message to one cassette.
    pub async fn send(&self, id: &str, message: &str) -> Result<NormalizedMessage, CassetteError> {
        let cassette = self.get(id).await?;
        send_blocking(cassette, message.to_string()).await
    }

    /// Send a message to every cassette in load order.
    pub async fn broadcast(&self, message: &str) -> Vec<(String, NormalizedMessage)> {
        let targets: Vec<(String, Arc<Mutex<Cassette>>)> = {
            let order = self.order.read().await;
            let cassettes = self.cassettes.read().await;
            order
                .iter()
                .filter_map(|id| {
                    cassettes
                        .get(id)
                        .map(|c| (id.clone(), Arc::clone(&c.cassette)))
                })
                .collect()
        };

        let mut responses = Vec::with_capacity(targets.len());
        for (id, cassette) in targets {
            let response = match send_blocking(cassette, message.to_string()).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(cassette = %id, "broadcast failed: {e}");
                    NormalizedMessage::notice(e.notice_text())
                }
            };
            tracing::debug!(cassette = %id, "broadcast answered");
            responses.push((id, response));
        }
        responses
    }
}

/// Run one `send` on the blocking pool, holding the cassette's lock there.
async fn send_blocking(
    cassette: Arc<Mutex<Cassette>>,
    message: String,
) -> Result<NormalizedMessage, CassetteError> {
    tokio::task::spawn_blocking(move || cassette.blocking_lock().send(&message))
        .await
        .map_err(|e| CassetteError::PluginRuntimeFault(format!("cassette task failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::EventDeduplicator;
    use crate::test_fixtures::{self as fixtures, source};

    async fn registry_with_two() -> (CassetteRegistry, String, String) {
        let registry = CassetteRegistry::new(CassetteLoader::default());
        let echo = registry
            .load(&source(fixtures::echo(), "echo.wasm"))
            .await
            .unwrap();
        let quiet = registry
            .load(&source(fixtures::echo_without_close(), "quiet.wasm"))
            .await
            .unwrap();
        (registry, echo, quiet)
    }

    #[tokio::test]
    async fn test_load_and_list_in_order() {
        let (registry, echo, quiet) = registry_with_two().await;
        assert_eq!(registry.loaded_count().await, 2);
        assert!(registry.is_loaded(&echo).await);
        assert_eq!(
            registry.loaded_cassettes().await,
            vec![(echo, "Echo".to_string()), (quiet, "Quiet".to_string())]
        );
    }

    #[tokio::test]
    async fn test_same_file_gets_distinct_ids() {
        let registry = CassetteRegistry::new(CassetteLoader::default());
        let a = registry
            .load(&source(fixtures::echo(), "echo.wasm"))
            .await
            .unwrap();
        let b = registry
            .load(&source(fixtures::echo(), "echo.wasm"))
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.loaded_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_load_registers_nothing() {
        let registry = CassetteRegistry::new(CassetteLoader::default());
        let err = registry
            .load(&source(fixtures::without_req(), "noreq.wasm"))
            .await
            .unwrap_err();
        assert!(matches!(err, CassetteError::MissingRequiredExport(_)));
        assert_eq!(registry.loaded_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let (registry, echo, quiet) = registry_with_two().await;

        let reply = registry.send(&echo, r#"["CLOSE","s"]"#).await.unwrap();
        assert_eq!(reply.as_notice(), Some("closed"));

        let replies = registry.broadcast(r#"["CLOSE","s"]"#).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, echo);
        assert_eq!(replies[0].1.as_notice(), Some("closed"));
        assert_eq!(
            replies[1],
            (quiet, NormalizedMessage::notice("Close not implemented"))
        );
    }

    #[tokio::test]
    async fn test_send_leaves_cassette_unlocked() {
        let (registry, echo, _) = registry_with_two().await;
        let event = r#"["EVENT","sub1",{"id":"e1","pubkey":"p","kind":1}]"#;
        assert_eq!(registry.send(&echo, event).await.unwrap().to_wire(), event);

        let cassette = registry.get(&echo).await.unwrap();
        let guard = cassette.try_lock().expect("lock released after send");
        assert_eq!(guard.deduplicator().map(EventDeduplicator::len), Some(1));
    }

    #[tokio::test]
    async fn test_unload() {
        let (registry, echo, quiet) = registry_with_two().await;
        registry.unload(&echo).await.unwrap();
        assert!(!registry.is_loaded(&echo).await);
        assert_eq!(registry.loaded_cassettes().await.len(), 1);
        assert_eq!(registry.broadcast(r#"["CLOSE","s"]"#).await[0].0, quiet);

        let err = registry.unload(&echo).await.unwrap_err();
        assert!(matches!(err, CassetteError::NotFound(_)));
        let err = registry.send(&echo, "[]").await.unwrap_err();
        assert_eq!(err.to_string(), format!("cassette not found: {echo}"));
    }
}
