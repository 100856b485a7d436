//! Provider registry and the single entry point callers use.
//!
//! The gateway owns one adapter per [`ProviderId`], routes each request to
//! the provider it names (or the default), and validates requests before
//! any backend is contacted. It never retries and never falls back to a
//! different provider.

use std::collections::HashMap;
use std::sync::Arc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::RwLock;

use crate::config::{GatewayConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::prompt::{ContextRetriever, PromptAssembler};
use crate::providers::ProviderAdapter;
use crate::request::{
  ChatRequest, ChatResponse, Envelope, GenerationRequest, GenerationResponse,
  HealthStatus, RequestContext,
};
use crate::{ModelInfo, ProviderId};

pub struct Gateway
{   adapters: RwLock<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>
  , default_provider: ProviderId
}

impl Gateway
{   /// Empty gateway; adapters are added with [`Gateway::register`]
    pub fn new(default_provider: ProviderId) -> Self
    {   Gateway
        {   adapters: RwLock::new(HashMap::new())
          , default_provider
        }
    }

    /// Build every configured adapter. Adapters that fail to build are
    /// skipped with a warning; it is an error if none are left or the
    /// default provider is among the failures.
    pub fn from_config(
      config: GatewayConfig
    , retriever: Option<Arc<dyn ContextRetriever>>
    ) -> Result<Self>
    {   debug!("Building gateway for {} providers", config.providers.len());
        let mut assembler = PromptAssembler::new()
          .with_default_dialect(config.default_dialect);
        if let Some(retriever) = retriever
        {   assembler = assembler.with_retriever(retriever);
        }

        let mut adapters = HashMap::new();
        for settings in config.providers
        {   let provider = settings.provider_id();
            if adapters.contains_key(&provider)
            {   warn!("{} configured more than once, keeping the first", provider);
                continue;
            }
            match settings.build(assembler.clone())
            {   Ok(adapter) => {
                  info!("Registered {} provider", provider);
                  adapters.insert(provider, adapter);
                }
              , Err(e) => warn!("Skipping {} provider: {}", provider, e)
            }
        }

        if adapters.is_empty()
        {   error!("No provider could be configured");
            return Err(Error::Configuration(
              "no provider could be configured".to_string()
            ));
        }
        if !adapters.contains_key(&config.default_provider)
        {   error!("Default provider {} is not available", config.default_provider);
            return Err(Error::ProviderNotConfigured(config.default_provider));
        }

        Ok(Gateway
        {   adapters: RwLock::new(adapters)
          , default_provider: config.default_provider
        })
    }

    /// Add or replace the adapter for its provider. Returns the adapter
    /// it replaced, which the caller is responsible for closing.
    pub async fn register(
      &self
    , adapter: Arc<dyn ProviderAdapter>
    ) -> Option<Arc<dyn ProviderAdapter>>
    {   let provider = adapter.provider_id();
        debug!("Registering {} provider", provider);
        self.adapters.write().await.insert(provider, adapter)
    }

    pub fn default_provider(&self) -> ProviderId
    {   self.default_provider
    }

    /// Registered providers, in a stable order
    pub async fn providers(&self) -> Vec<ProviderId>
    {   let mut providers: Vec<ProviderId>
          = self.adapters.read().await.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Provider a request will be routed to
    pub fn route(&self, requested: Option<ProviderId>) -> ProviderId
    {   requested.unwrap_or(self.default_provider)
    }

    async fn adapter(&self, provider: ProviderId) -> Result<Arc<dyn ProviderAdapter>>
    {   self.adapters.read().await
          .get(&provider)
          .cloned()
          .ok_or_else(|| {
            warn!("No adapter registered for {}", provider);
            Error::ProviderNotConfigured(provider)
          })
    }

    pub async fn generate_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>
    {   if req.prompt.trim().is_empty()
        {   return Err(Error::InvalidRequest("prompt is required".to_string()));
        }
        let provider = self.route(req.provider);
        debug!("generate_sql routed to {}", provider);
        self.adapter(provider).await?.generate_sql(ctx, req).await
    }

    pub async fn fix_sql(
      &self
    , ctx: &RequestContext
    , req: &GenerationRequest
    ) -> Result<GenerationResponse>
    {   if req.query.trim().is_empty()
        {   return Err(Error::InvalidRequest(
              "query is required for a fix".to_string()
            ));
        }
        if req.error_message.trim().is_empty()
        {   return Err(Error::InvalidRequest(
              "error_message is required for a fix".to_string()
            ));
        }
        let provider = self.route(req.provider);
        debug!("fix_sql routed to {}", provider);
        self.adapter(provider).await?.fix_sql(ctx, req).await
    }

    pub async fn chat(
      &self
    , ctx: &RequestContext
    , req: &ChatRequest
    ) -> Result<ChatResponse>
    {   if req.prompt.trim().is_empty()
        {   return Err(Error::InvalidRequest("prompt is required".to_string()));
        }
        let provider = self.route(req.provider);
        debug!("chat routed to {}", provider);
        self.adapter(provider).await?.chat(ctx, req).await
    }

    /// Health of one provider; `Unknown` when it is not registered
    pub async fn get_health(
      &self
    , ctx: &RequestContext
    , provider: ProviderId
    ) -> HealthStatus
    {   match self.adapter(provider).await
        {   Ok(adapter) => adapter.get_health(ctx).await
          , Err(e) => HealthStatus::unknown(provider, e.to_string())
        }
    }

    /// Probe every registered provider concurrently
    pub async fn all_health(&self, ctx: &RequestContext) -> Vec<HealthStatus>
    {   let adapters = self.snapshot().await;
        join_all(adapters.iter().map(|adapter| adapter.get_health(ctx))).await
    }

    pub async fn is_available(
      &self
    , ctx: &RequestContext
    , provider: ProviderId
    ) -> bool
    {   match self.adapter(provider).await
        {   Ok(adapter) => adapter.is_available(ctx).await
          , Err(_) => false
        }
    }

    pub async fn list_models(
      &self
    , ctx: &RequestContext
    , provider: ProviderId
    ) -> Result<Vec<ModelInfo>>
    {   self.adapter(provider).await?.list_models(ctx).await
    }

    /// Models across all providers; a provider that fails to list is
    /// left out.
    pub async fn all_models(&self, ctx: &RequestContext) -> Vec<ModelInfo>
    {   let adapters = self.snapshot().await;
        let listings = join_all(
          adapters.iter().map(|adapter| adapter.list_models(ctx))
        ).await;

        adapters.iter()
          .zip(listings)
          .flat_map(|(adapter, listing)| match listing
          {   Ok(models) => models
            , Err(e) => {
                warn!("Skipping models of {}: {}", adapter.provider_id(), e);
                vec![]
              }
          })
          .collect()
    }

    /// Swap in new settings for the provider they name
    pub async fn update_provider_config(
      &self
    , settings: ProviderSettings
    ) -> Result<()>
    {   let provider = settings.provider_id();
        info!("Updating {} configuration", provider);
        self.adapter(provider).await?.update_config(settings)
    }

    /// Run independent generation requests concurrently. A failed request
    /// yields an error envelope without affecting the others.
    pub async fn generate_batch(
      &self
    , ctx: &RequestContext
    , requests: &[GenerationRequest]
    ) -> Vec<Envelope<GenerationResponse>>
    {   debug!("Generating batch of {}", requests.len());
        join_all(requests.iter().map(|req| async move {
          let result = self.generate_sql(ctx, req).await;
          Envelope::from_result(result, Some(self.route(req.provider)))
        })).await
    }

    /// Close every adapter. All adapters are closed even when one fails;
    /// the first failure is returned.
    pub async fn close(&self) -> Result<()>
    {   debug!("Closing gateway");
        let adapters = self.snapshot().await;
        let mut outcome = Ok(());
        for adapter in adapters
        {   if let Err(e) = adapter.close().await
            {   error!("Closing {} failed: {}", adapter.provider_id(), e);
                if outcome.is_ok()
                {   outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Adapters sorted by provider, detached from the lock
    async fn snapshot(&self) -> Vec<Arc<dyn ProviderAdapter>>
    {   let adapters = self.adapters.read().await;
        let mut providers: Vec<&ProviderId> = adapters.keys().collect();
        providers.sort();
        providers.into_iter()
          .filter_map(|p| adapters.get(p).cloned())
          .collect()
    }
}

impl std::fmt::Debug for Gateway
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {   f.debug_struct("Gateway")
          .field("default_provider", &self.default_provider)
          .finish_non_exhaustive()
    }
}
