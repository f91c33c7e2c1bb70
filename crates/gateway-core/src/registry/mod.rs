//! Read-only portal registries with short-lived caching.
//!
//! Application, load balancer, and blockchain records are owned by external
//! stores; this module exposes them through repository traits and a caching
//! [`Registry`] facade. Application and load balancer records are cached for
//! 60 seconds in the shared cache; blockchains are loaded once at startup
//! into an in-process index keyed by both hex id and path alias.

pub mod postgres;

use crate::{
    cache::{keys, RelayCache},
    types::{Application, Blockchain, LoadBalancer},
};
use ahash::AHashMap;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from record resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("application {0} not found")]
    UnknownApplication(String),

    #[error("load balancer {0} not found")]
    UnknownLoadBalancer(String),

    /// Every application the load balancer references failed verification.
    #[error("load balancer {0} has no resolvable applications")]
    EmptyLoadBalancer(String),

    #[error("unknown blockchain {0}")]
    UnknownBlockchain(String),

    /// The backing store failed; surfaces as an internal error when it
    /// prevents application resolution.
    #[error("repository unavailable: {0}")]
    Repository(String),
}

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn application(&self, id: &str) -> Result<Option<Application>, RegistryError>;
}

#[async_trait]
pub trait LoadBalancerRepository: Send + Sync {
    async fn load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>, RegistryError>;
}

#[async_trait]
pub trait BlockchainRepository: Send + Sync {
    /// All blockchain descriptors. Called once at startup.
    async fn blockchains(&self) -> Result<Vec<Blockchain>, RegistryError>;
}

/// Caching facade over the portal repositories.
pub struct Registry {
    applications: Arc<dyn ApplicationRepository>,
    load_balancers: Arc<dyn LoadBalancerRepository>,
    cache: RelayCache,
    /// Blockchains indexed by lowercase id and alias. Swapped wholesale on
    /// reload, read lock-free on every request.
    chains: ArcSwap<AHashMap<String, Arc<Blockchain>>>,
}

impl Registry {
    /// Loads the blockchain index and wires the repositories.
    ///
    /// # Errors
    /// Fails when the blockchain repository is unreachable; the gateway
    /// cannot route without chain descriptors.
    pub async fn new(
        applications: Arc<dyn ApplicationRepository>,
        load_balancers: Arc<dyn LoadBalancerRepository>,
        blockchains: Arc<dyn BlockchainRepository>,
        cache: RelayCache,
    ) -> Result<Self, RegistryError> {
        let index = Self::index(blockchains.blockchains().await?);
        debug!(chains = index.len(), "blockchain index loaded");

        Ok(Self { applications, load_balancers, cache, chains: ArcSwap::from_pointee(index) })
    }

    fn index(blockchains: Vec<Blockchain>) -> AHashMap<String, Arc<Blockchain>> {
        let mut index = AHashMap::new();
        for chain in blockchains {
            let chain = Arc::new(chain);
            index.insert(chain.id.to_lowercase(), Arc::clone(&chain));
            for alias in &chain.aliases {
                index.insert(alias.to_lowercase(), Arc::clone(&chain));
            }
        }
        index
    }

    /// Resolves a blockchain by hex id or path/host alias, case-insensitive.
    pub fn blockchain(&self, key: &str) -> Result<Arc<Blockchain>, RegistryError> {
        self.chains
            .load()
            .get(&key.to_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBlockchain(key.to_string()))
    }

    /// Fetches an application, serving from cache when the record is fresh.
    ///
    /// A cache hit makes zero repository calls; a miss makes exactly one,
    /// followed by one cache write with the 60 second record TTL.
    pub async fn application(&self, id: &str) -> Result<Application, RegistryError> {
        let key = keys::application(id);
        if let Some(app) = self.cache.get_json::<Application>(&key).await {
            return Ok(app);
        }

        let app = self
            .applications
            .application(id)
            .await?
            .ok_or_else(|| RegistryError::UnknownApplication(id.to_string()))?;

        self.cache.set_json(&key, &app, keys::RECORD_TTL).await;
        Ok(app)
    }

    /// Fetches a load balancer record with the same caching discipline as
    /// [`Registry::application`].
    pub async fn load_balancer(&self, id: &str) -> Result<LoadBalancer, RegistryError> {
        let key = keys::load_balancer(id);
        if let Some(lb) = self.cache.get_json::<LoadBalancer>(&key).await {
            return Ok(lb);
        }

        let lb = self
            .load_balancers
            .load_balancer(id)
            .await?
            .ok_or_else(|| RegistryError::UnknownLoadBalancer(id.to_string()))?;

        self.cache.set_json(&key, &lb, keys::RECORD_TTL).await;
        Ok(lb)
    }

    /// Resolves a load balancer to one application, drawn uniformly at
    /// random from the subset verified to exist. Referenced applications
    /// that fail to resolve are dropped silently; zero survivors is a
    /// terminal configuration error.
    pub async fn resolve_load_balancer(&self, id: &str) -> Result<Application, RegistryError> {
        let lb = self.load_balancer(id).await?;

        let mut verified = Vec::with_capacity(lb.application_ids.len());
        for app_id in &lb.application_ids {
            match self.application(app_id).await {
                Ok(app) => verified.push(app),
                Err(e) => {
                    warn!(lb = %id, app = %app_id, error = %e, "dropping unresolvable application");
                }
            }
        }

        verified
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| RegistryError::EmptyLoadBalancer(id.to_string()))
    }
}
