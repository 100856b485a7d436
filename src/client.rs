use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use log::{debug, error, info};

use crate::config::ProviderSettings;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::request::{
  ChatRequest, ChatResponse, Envelope, GenerationRequest, GenerationResponse,
  HealthStatus, RequestContext,
};
use crate::{ModelInfo, ProviderId};

/// Union of all commands the gateway task handles
pub enum GatewayCommand
{   Generate
    {   ctx: RequestContext
      , request: GenerationRequest
      , reply: oneshot::Sender<Envelope<GenerationResponse>>
    }
  , Fix
    {   ctx: RequestContext
      , request: GenerationRequest
      , reply: oneshot::Sender<Envelope<GenerationResponse>>
    }
  , Chat
    {   ctx: RequestContext
      , request: ChatRequest
      , reply: oneshot::Sender<Envelope<ChatResponse>>
    }
  , /// One provider, or every registered provider when `None`
    Health
    {   ctx: RequestContext
      , provider: Option<ProviderId>
      , reply: oneshot::Sender<Vec<HealthStatus>>
    }
  , ListModels
    {   ctx: RequestContext
      , provider: Option<ProviderId>
      , reply: oneshot::Sender<Envelope<Vec<ModelInfo>>>
    }
  , UpdateConfig
    {   settings: ProviderSettings
      , reply: oneshot::Sender<Result<()>>
    }
  , Shutdown
    {   reply: oneshot::Sender<Result<()>>
    }
}

/// Channel front-end for a [`Gateway`] - owns the task.
///
/// Every method queues a command and hands back the receiver for its
/// reply, so callers never wait on a backend to enqueue work.
pub struct GatewayClient
{   tx: mpsc::UnboundedSender<GatewayCommand>
  , _task_handle: tokio::task::JoinHandle<()>
}

impl GatewayClient
{   /// Spawn the gateway task. Must be called inside a tokio runtime.
    pub fn new(gateway: Gateway) -> Self
    {   debug!("Creating GatewayClient with task ownership");
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(gateway);
        let _task_handle = tokio::spawn(async move {
          run_gateway_loop(gateway, rx).await
        });

        GatewayClient
        {   tx
          , _task_handle
        }
    }

    fn queue(&self, cmd: GatewayCommand) -> Result<()>
    {   self.tx.send(cmd).map_err(|_| {
          error!("Gateway channel closed");
          Error::Transport("gateway task has shut down".to_string())
        })
    }

    /// Generate SQL - returns almost immediately
    pub fn generate_sql(
      &self
    , ctx: RequestContext
    , request: GenerationRequest
    ) -> Result<oneshot::Receiver<Envelope<GenerationResponse>>>
    {   debug!("generate_sql queuing command");
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::Generate { ctx, request, reply })?;
        Ok(reply_rx)
    }

    /// Fix SQL - returns almost immediately
    pub fn fix_sql(
      &self
    , ctx: RequestContext
    , request: GenerationRequest
    ) -> Result<oneshot::Receiver<Envelope<GenerationResponse>>>
    {   debug!("fix_sql queuing command");
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::Fix { ctx, request, reply })?;
        Ok(reply_rx)
    }

    pub fn chat(
      &self
    , ctx: RequestContext
    , request: ChatRequest
    ) -> Result<oneshot::Receiver<Envelope<ChatResponse>>>
    {   debug!("chat queuing command");
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::Chat { ctx, request, reply })?;
        Ok(reply_rx)
    }

    pub fn health(
      &self
    , ctx: RequestContext
    , provider: Option<ProviderId>
    ) -> Result<oneshot::Receiver<Vec<HealthStatus>>>
    {   debug!("health queuing command");
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::Health { ctx, provider, reply })?;
        Ok(reply_rx)
    }

    pub fn list_models(
      &self
    , ctx: RequestContext
    , provider: Option<ProviderId>
    ) -> Result<oneshot::Receiver<Envelope<Vec<ModelInfo>>>>
    {   debug!("list_models queuing command");
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::ListModels { ctx, provider, reply })?;
        Ok(reply_rx)
    }

    /// Swap a provider's configuration. Applied in order with other
    /// config updates; requests already running keep their snapshot.
    pub fn update_config(
      &self
    , settings: ProviderSettings
    ) -> Result<oneshot::Receiver<Result<()>>>
    {   debug!("update_config queuing for {}", settings.provider_id());
        let (reply, reply_rx) = oneshot::channel();
        self.queue(GatewayCommand::UpdateConfig { settings, reply })?;
        Ok(reply_rx)
    }

    /// Close every adapter and stop the task
    pub async fn shutdown(self) -> Result<()>
    {   debug!("Shutting down GatewayClient");
        let (reply, reply_rx) = oneshot::channel();
        self.tx.send(GatewayCommand::Shutdown { reply }).map_err(|_| {
          error!("Gateway channel already closed");
          Error::Transport("gateway task already shut down".to_string())
        })?;

        match reply_rx.await
        {   Ok(result) => {
              debug!("Gateway shutdown confirmed");
              result
            }
          , Err(_) => {
              error!("Gateway task ended without confirming shutdown");
              Err(Error::Transport("gateway task ended early".to_string()))
            }
        }
    }
}

/// Main gateway event loop.
///
/// The loop only dispatches: request commands are spawned onto their own
/// task so a slow backend never holds up the queue. Config updates and
/// shutdown are handled inline.
async fn run_gateway_loop(
  gateway: Arc<Gateway>
, mut rx: mpsc::UnboundedReceiver<GatewayCommand>
)
{   debug!("Starting gateway event loop");
    loop
    { tokio::select!
      { Some(cmd) = rx.recv() => match cmd
        {   GatewayCommand::Generate { ctx, request, reply } => {
              debug!("Received Generate");
              let gateway = Arc::clone(&gateway);
              tokio::spawn(async move {
                let provider = gateway.route(request.provider);
                let result = gateway.generate_sql(&ctx, &request).await;
                let _ = reply.send(Envelope::from_result(result, Some(provider)));
              });
            }
          , GatewayCommand::Fix { ctx, request, reply } => {
              debug!("Received Fix");
              let gateway = Arc::clone(&gateway);
              tokio::spawn(async move {
                let provider = gateway.route(request.provider);
                let result = gateway.fix_sql(&ctx, &request).await;
                let _ = reply.send(Envelope::from_result(result, Some(provider)));
              });
            }
          , GatewayCommand::Chat { ctx, request, reply } => {
              debug!("Received Chat");
              let gateway = Arc::clone(&gateway);
              tokio::spawn(async move {
                let provider = gateway.route(request.provider);
                let result = gateway.chat(&ctx, &request).await;
                let _ = reply.send(Envelope::from_result(result, Some(provider)));
              });
            }
          , GatewayCommand::Health { ctx, provider, reply } => {
              debug!("Received Health");
              let gateway = Arc::clone(&gateway);
              tokio::spawn(async move {
                let statuses = match provider
                {   Some(provider) => vec![gateway.get_health(&ctx, provider).await]
                  , None => gateway.all_health(&ctx).await
                };
                let _ = reply.send(statuses);
              });
            }
          , GatewayCommand::ListModels { ctx, provider, reply } => {
              debug!("Received ListModels");
              let gateway = Arc::clone(&gateway);
              tokio::spawn(async move {
                let envelope = match provider
                {   Some(provider) => Envelope::from_result(
                      gateway.list_models(&ctx, provider).await,
                      Some(provider),
                    )
                  , None => Envelope::from_result(
                      Ok(gateway.all_models(&ctx).await),
                      None,
                    )
                };
                let _ = reply.send(envelope);
              });
            }
          , GatewayCommand::UpdateConfig { settings, reply } => {
              debug!("Received UpdateConfig");
              let _ = reply.send(gateway.update_provider_config(settings).await);
            }
          , GatewayCommand::Shutdown { reply } => {
              debug!("Received Shutdown");
              let _ = reply.send(gateway.close().await);
              info!("Gateway task shutting down");
              break;
            }
        }
      , else => {
          debug!("All GatewayClient handles dropped");
          break;
        }
      }
    }
}
