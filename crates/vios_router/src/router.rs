use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::connection::{FrameInbound, FrameOutbound};
use crate::error::{RouteError, RouterError, TransportError};
use crate::grammar::GrammarMapper;
use crate::message::{InstanceId, Message, MessageId, kind};
use crate::registry::SessionRegistry;

struct RouterInner {
    registry: SessionRegistry,
    grammar: GrammarMapper,
    outbound: Mutex<FrameOutbound>,
    config: RouterConfig,
}

/// Routes traffic between the engine transport and registered sessions.
///
/// One router exists per engine connection. It is cheap to clone; every
/// clone shares the same registry, grammar mapper and write half.
///
/// Inbound frames are ingested by [`Router::run`] (usually spawned with
/// [`Router::spawn`]) and delivered to the owning instance's buffer:
/// - `grammarMatch` goes to the session whose vocabulary contains the text
/// - `dictationResult` goes to the active session
/// - anything else goes to the instance named in the frame
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router that writes frames to `writer`.
    pub fn new<W>(writer: W, config: RouterConfig) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Arc::new(RouterInner {
                registry: SessionRegistry::new(config.buffer_capacity),
                grammar: GrammarMapper::new(config.root_instance),
                outbound: Mutex::new(FrameOutbound::new(writer, config.byte_order)),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn grammar(&self) -> &GrammarMapper {
        &self.inner.grammar
    }

    /// Allocate a new instance with an empty buffer and vocabulary.
    pub fn register_instance(&self) -> InstanceId {
        let id = self.inner.registry.register_instance();
        self.inner.grammar.register_instance(id);
        info!(instance_id = %id, "Registered instance");
        id
    }

    /// Forget an exited instance's buffer and vocabulary.
    pub fn unregister_instance(&self, id: InstanceId) {
        self.inner.grammar.remove_instance(id);
        if self.inner.registry.remove_instance(id) {
            info!(instance_id = %id, "Unregistered instance");
        }
    }

    pub fn next_message_id(&self) -> MessageId {
        self.inner.registry.next_message_id()
    }

    /// Spawn the ingestion loop on the runtime.
    pub fn spawn<R>(&self, reader: R) -> JoinHandle<Result<(), TransportError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let router = self.clone();
        tokio::spawn(async move { router.run(reader).await })
    }

    /// Ingest frames from `reader` until the transport fails.
    ///
    /// Malformed and unroutable frames are logged and dropped. The loop only
    /// ends on a transport fault, including the peer closing the stream,
    /// which is reported as [`TransportError::Closed`].
    pub async fn run<R>(&self, reader: R) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let config = &self.inner.config;
        let mut frames = FrameInbound::new(reader, config.byte_order, config.max_frame_len);

        info!(
            root_instance = %config.root_instance,
            byte_order = ?config.byte_order,
            "Router started, ingesting frames"
        );

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "Transport failed, routing stopped");
                    return Err(e);
                }
            };

            match Message::decode_bytes(&frame) {
                Ok(message) => {
                    debug!(message = %message, "Read frame");
                    // Unroutable messages are logged inside dispatch.
                    let _ = self.dispatch(message);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                }
            }

            self.pause().await;
        }

        error!("Transport closed by engine, routing stopped");
        Err(TransportError::Closed)
    }

    /// Decide which instance owns an inbound message.
    pub fn resolve(&self, message: &Message) -> Result<InstanceId, RouteError> {
        match message.kind.as_str() {
            kind::GRAMMAR_MATCH => self
                .inner
                .grammar
                .resolve_instance(&message.args)
                .ok_or_else(|| RouteError::NoMatch {
                    text: message.args.clone(),
                }),
            kind::DICTATION_RESULT => self
                .inner
                .grammar
                .active()
                .ok_or(RouteError::NoActiveSession),
            _ => message
                .instance()
                .filter(|id| self.inner.registry.contains(*id))
                .ok_or_else(|| RouteError::UnknownInstance(message.instance_id.clone())),
        }
    }

    /// Route a message into its owner's buffer.
    pub fn dispatch(&self, message: Message) -> Result<InstanceId, RouteError> {
        let id = match self.resolve(&message) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, message = %message, "Dropping unroutable message");
                if matches!(e, RouteError::NoMatch { .. }) {
                    debug!(grammar = %self.inner.grammar.dump(), "Grammar at time of drop");
                }
                return Err(e);
            }
        };

        self.inner
            .registry
            .enqueue(id, message)
            .map_err(|_| RouteError::UnknownInstance(id.to_string()))?;

        debug!(instance_id = %id, "Message delivered");
        Ok(id)
    }

    /// Send a message to the engine.
    ///
    /// Concurrent writers are serialized so frames never interleave. Fields
    /// that cannot be framed are rejected before anything is written.
    pub async fn write(&self, message: &Message) -> Result<(), RouterError> {
        message.validate()?;

        let mut outbound = self.inner.outbound.lock().await;
        outbound.send(message).await?;

        debug!(message = %message, "Sent frame");
        Ok(())
    }

    /// Take a message from an instance's buffer. See [`SessionRegistry::dequeue`].
    pub async fn read(
        &self,
        id: InstanceId,
        message_id: Option<MessageId>,
        block: bool,
    ) -> Result<Option<Message>, RouterError> {
        self.inner.registry.dequeue(id, message_id, block).await
    }

    /// Release a read blocked on `id` by queueing a local wakeup message.
    pub fn wakeup(&self, id: InstanceId) -> Result<(), RouterError> {
        let message = Message::new(id, kind::WAKEUP, self.next_message_id(), kind::WAKEUP);
        self.inner.registry.enqueue(id, message)?;
        debug!(instance_id = %id, "Queued wakeup");
        Ok(())
    }

    async fn pause(&self) {
        let pause = self.inner.config.ingest_pause;
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }
}
