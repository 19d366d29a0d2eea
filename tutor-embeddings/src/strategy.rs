//! Strategy selection between the remote and local embedding variants
//! (`spec.md` §4.4.3).

use crate::model::{EmbeddingModel, Health};
use std::sync::Arc;
use tutor_config::EmbeddingStrategyKind;
use tutor_types::{Result, TutorError};

/// Holds a configured default strategy, a fallback flag, and a sovereign
/// flag, and resolves which model backs each call.
pub struct StrategyManager {
    remote: Option<Arc<dyn EmbeddingModel>>,
    local: Arc<dyn EmbeddingModel>,
    default: EmbeddingStrategyKind,
    fallback_enabled: bool,
    sovereign_mode: bool,
}

impl StrategyManager {
    /// # Panics
    /// Panics if `sovereign_mode` is true and `default` is
    /// [`EmbeddingStrategyKind::Remote`] — that combination must be
    /// rejected at configuration-validation time
    /// ([`tutor_config::TutorConfig::validate`]), never reach here.
    #[must_use]
    pub fn new(
        remote: Option<Arc<dyn EmbeddingModel>>,
        local: Arc<dyn EmbeddingModel>,
        default: EmbeddingStrategyKind,
        fallback_enabled: bool,
        sovereign_mode: bool,
    ) -> Self {
        assert!(
            !(sovereign_mode && default == EmbeddingStrategyKind::Remote),
            "sovereign_mode forbids a remote default strategy"
        );
        Self {
            remote,
            local,
            default,
            fallback_enabled,
            sovereign_mode,
        }
    }

    /// Resolves the model to use for this call: the configured default if
    /// healthy, otherwise local if fallback is enabled and sovereign mode
    /// does not forbid it (`spec.md` §4.4.3).
    ///
    /// # Errors
    /// Returns [`TutorError::Unavailable`] if the default is unhealthy (or
    /// unconfigured) and no fallback is permitted.
    pub async fn resolve(&self) -> Result<Arc<dyn EmbeddingModel>> {
        match self.default {
            EmbeddingStrategyKind::Local => Ok(self.local.clone()),
            EmbeddingStrategyKind::Remote => {
                if self.sovereign_mode {
                    // Defense in depth: even if misconfiguration slipped
                    // past `TutorConfig::validate`, sovereign mode must
                    // never let a call reach the remote strategy.
                    return Ok(self.local.clone());
                }
                // No remote model was ever constructed (e.g. no endpoint
                // configured) is treated the same as an unhealthy remote:
                // the strategy manager's job is to pick a working model,
                // not to distinguish "never wired up" from "down".
                let healthy_remote = match &self.remote {
                    Some(remote) if remote.health().await == Health::Ok => Some(remote.clone()),
                    _ => None,
                };
                if let Some(remote) = healthy_remote {
                    return Ok(remote);
                }
                if self.fallback_enabled {
                    tracing::warn!("remote embedding unavailable; falling back to local strategy");
                    Ok(self.local.clone())
                } else {
                    Err(TutorError::Unavailable(
                        "remote embedding strategy unavailable and fallback not permitted".into(),
                    ))
                }
            }
        }
    }

    /// Embeds `text` using whichever strategy [`Self::resolve`] selects.
    ///
    /// # Errors
    /// Propagates [`Self::resolve`] errors, or [`TutorError::Embedding`] if
    /// the selected model fails.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.resolve().await?;
        model.embed(text).await.map_err(|e| TutorError::Embedding(e.to_string()))
    }

    #[must_use]
    pub fn sovereign_mode(&self) -> bool {
        self.sovereign_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalEmbedding;
    use async_trait::async_trait;

    struct AlwaysUnhealthy(Arc<LocalEmbedding>);

    #[async_trait]
    impl EmbeddingModel for AlwaysUnhealthy {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0.embed(text).await
        }
        fn dimension(&self) -> usize {
            self.0.dimension()
        }
        async fn health(&self) -> Health {
            Health::Unhealthy
        }
        fn model_id(&self) -> &str {
            "always-unhealthy"
        }
    }

    #[tokio::test]
    async fn falls_back_to_local_when_remote_unhealthy() {
        let local = Arc::new(LocalEmbedding::default_local());
        let remote: Arc<dyn EmbeddingModel> = Arc::new(AlwaysUnhealthy(local.clone()));
        let manager = StrategyManager::new(
            Some(remote),
            local.clone(),
            EmbeddingStrategyKind::Remote,
            true,
            false,
        );
        let resolved = manager.resolve().await.unwrap();
        assert_eq!(resolved.model_id(), local.model_id());
    }

    #[tokio::test]
    async fn sovereign_mode_refuses_remote_even_with_fallback() {
        let local = Arc::new(LocalEmbedding::default_local());
        let remote: Arc<dyn EmbeddingModel> = Arc::new(AlwaysUnhealthy(local.clone()));
        let manager = StrategyManager::new(
            Some(remote),
            local,
            EmbeddingStrategyKind::Local,
            true,
            true,
        );
        assert!(manager.resolve().await.is_ok());
        assert!(manager.sovereign_mode());
    }

    struct AlwaysHealthyRemote(Arc<LocalEmbedding>);

    #[async_trait]
    impl EmbeddingModel for AlwaysHealthyRemote {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0.embed(text).await
        }
        fn dimension(&self) -> usize {
            self.0.dimension()
        }
        async fn health(&self) -> Health {
            Health::Ok
        }
        fn model_id(&self) -> &str {
            "always-healthy-remote"
        }
    }

    #[tokio::test]
    async fn sovereign_mode_never_selects_a_healthy_remote() {
        let local = Arc::new(LocalEmbedding::default_local());
        let remote: Arc<dyn EmbeddingModel> = Arc::new(AlwaysHealthyRemote(local.clone()));
        // Bypasses the constructor assert deliberately to test the
        // defense-in-depth branch inside `resolve`.
        let manager = StrategyManager {
            remote: Some(remote),
            local: local.clone(),
            default: EmbeddingStrategyKind::Remote,
            fallback_enabled: true,
            sovereign_mode: true,
        };
        let resolved = manager.resolve().await.unwrap();
        assert_eq!(resolved.model_id(), local.model_id());
    }
}
