//! Multi-tag management.
//!
//! A [`TagManager`] owns any number of independent [`Tag`]s keyed by
//! identifier. Each tag has its own driver task, generations and state;
//! the manager only adds lookup, a shared registry and transport creation
//! through an injected [`TransportFactory`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info};

use weartag_types::TagIdentity;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::ConnectionEvents;
use crate::protocol::KindRegistry;
use crate::registry::TagRegistry;
use crate::session::TagState;
use crate::tag::Tag;
use crate::transport::TransportFactory;

/// Manager for many tags.
pub struct TagManager {
    tags: RwLock<HashMap<String, Arc<Tag>>>,
    transports: Arc<dyn TransportFactory>,
    registry: Arc<dyn TagRegistry>,
    kinds: Arc<KindRegistry>,
    config: EngineConfig,
}

impl std::fmt::Debug for TagManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TagManager {
    /// Create a manager with the default configuration.
    pub fn new(transports: Arc<dyn TransportFactory>, registry: Arc<dyn TagRegistry>) -> Self {
        Self::with_config(transports, registry, EngineConfig::default())
    }

    /// Create a manager with a custom configuration.
    pub fn with_config(
        transports: Arc<dyn TransportFactory>,
        registry: Arc<dyn TagRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            tags: RwLock::new(HashMap::new()),
            transports,
            registry,
            kinds: Arc::new(KindRegistry::with_defaults()),
            config,
        }
    }

    /// Use a custom kind table for tags created from now on.
    #[must_use]
    pub fn with_kinds(mut self, kinds: Arc<KindRegistry>) -> Self {
        self.kinds = kinds;
        self
    }

    /// The manager configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared registry.
    pub fn registry(&self) -> &Arc<dyn TagRegistry> {
        &self.registry
    }

    /// Get the tag for `identity`, creating it on first use.
    ///
    /// A tag the registry already knows starts `PreConnected` even when
    /// the identity still carries a pairing code.
    pub async fn add(&self, identity: &TagIdentity) -> Result<Arc<Tag>> {
        let identifier = identity.identifier().to_string();
        if let Some(tag) = self.tags.read().await.get(&identifier) {
            return Ok(Arc::clone(tag));
        }

        let identity = match self.registry.get(&identifier)? {
            Some(known) => known.with_display_name(preferred_name(identity, &known)),
            None => identity.clone(),
        };

        let mut tags = self.tags.write().await;
        let tag = tags.entry(identifier.clone()).or_insert_with(|| {
            debug!(tag = %identifier, "Adding tag");
            Arc::new(
                Tag::builder(identity.clone(), self.transports.transport_for(&identity))
                    .registry(Arc::clone(&self.registry))
                    .kinds(Arc::clone(&self.kinds))
                    .config(self.config.clone())
                    .build(),
            )
        });
        Ok(Arc::clone(tag))
    }

    /// Start connecting to a tag, adding it first if needed.
    #[tracing::instrument(skip(self, identity), fields(tag = %identity.identifier()))]
    pub async fn connect(&self, identity: &TagIdentity) -> Result<ConnectionEvents> {
        let tag = self.add(identity).await?;
        info!("Connecting");
        tag.connect().await
    }

    /// Look up a managed tag.
    pub async fn tag(&self, identifier: &str) -> Option<Arc<Tag>> {
        self.tags.read().await.get(identifier).cloned()
    }

    /// Disconnect one tag.
    pub async fn disconnect(&self, identifier: &str) -> Result<()> {
        let tag = self
            .tag(identifier)
            .await
            .ok_or_else(|| Error::tag_not_found(identifier))?;
        tag.disconnect().await;
        Ok(())
    }

    /// Disconnect every managed tag concurrently.
    pub async fn disconnect_all(&self) {
        let tags: Vec<Arc<Tag>> = self.tags.read().await.values().cloned().collect();
        join_all(tags.iter().map(|tag| tag.disconnect())).await;
    }

    /// Disconnect a tag, stop managing it and remove it from the registry.
    ///
    /// Returns whether the registry knew the tag.
    pub async fn forget(&self, identifier: &str) -> Result<bool> {
        let tag = self.tags.write().await.remove(identifier);
        if let Some(tag) = tag {
            tag.disconnect().await;
        }
        self.registry.remove(identifier)
    }

    /// Whether the registry knows the tag.
    pub fn is_known(&self, identifier: &str) -> Result<bool> {
        self.registry.is_known(identifier)
    }

    /// Every tag in the registry.
    pub fn known_tags(&self) -> Result<Vec<TagIdentity>> {
        self.registry.all()
    }

    /// Identifiers of managed tags.
    pub async fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tags.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of every managed tag.
    pub async fn states(&self) -> HashMap<String, TagState> {
        self.tags
            .read()
            .await
            .iter()
            .map(|(id, tag)| (id.clone(), tag.state()))
            .collect()
    }

    /// Number of tags currently connected.
    pub async fn connected_count(&self) -> usize {
        self.tags
            .read()
            .await
            .values()
            .filter(|tag| tag.state().is_connected())
            .count()
    }
}

/// Name to keep for a known tag: the advertised one unless it is blank.
fn preferred_name<'a>(advertised: &'a TagIdentity, known: &'a TagIdentity) -> &'a str {
    if advertised.display_name().is_empty() {
        known.display_name()
    } else {
        advertised.display_name()
    }
}
