use super::{get_panic_message, ChannelError, RequestError, WrappedMessage};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::{fmt::Debug, sync::Arc, time::Duration};
use strata_error::StrataError;
use thiserror::Error;

use super::system::System;

pub trait Message: Debug + Send + 'static {}
impl<M: Debug + Send + 'static> Message for M {}

/// A component is running until its handle (or the system) stops it.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ComponentState {
    Running,
    Stopped,
}

/// A component is a processor of messages run by a [`System`].
/// It owns its state; everything else talks to it through its bounded queue.
/// # Methods
/// - queue_size: capacity of the component's queue; `send` fails when it is full
/// - on_start: called on the component's task before the first message
/// - on_stop: called once the component is cancelled, bounded by `on_stop_timeout`
/// - on_handler_panic: called with the payload when a handler panics
#[async_trait]
pub trait Component: Send + Sized + Debug + 'static {
    fn get_name() -> &'static str;
    fn queue_size(&self) -> usize;
    async fn on_start(&mut self, _ctx: &ComponentContext<Self>) -> () {}
    async fn on_stop(&mut self) -> Result<(), Box<dyn StrataError>> {
        Ok(())
    }
    fn on_stop_timeout(&self) -> Duration {
        Duration::from_secs(6)
    }
    fn on_handler_panic(&mut self, panic: Box<dyn core::any::Any + Send>) {
        tracing::error!(
            component = Self::get_name(),
            "Handler panicked: {:?}",
            get_panic_message(&panic)
        );
        std::panic::resume_unwind(panic);
    }
}

/// A handler is a component that can process messages of a given type.
#[async_trait]
pub trait Handler<M>
where
    Self: Component + Sized + 'static,
{
    type Result: Send + Debug + 'static;

    async fn handle(&mut self, message: M, ctx: &ComponentContext<Self>) -> Self::Result
    // async_trait needs the bound for messages that carry lifetimes.
    where
        M: 'async_trait;
}

/// A stream handler receives the items of a registered stream as messages.
/// Items are forwarded with an awaiting send, so a slow handler throttles the
/// stream instead of dropping its items.
pub trait StreamHandler<M>
where
    Self: Component + 'static + Handler<M>,
    M: Message,
{
    fn register_stream<S>(&self, stream: S, ctx: &ComponentContext<Self>)
    where
        S: Stream + Send + Stream<Item = M> + 'static,
    {
        ctx.system.register_stream(stream, ctx);
    }
}

#[derive(Debug, Error)]
pub enum ConsumeJoinHandleError {
    #[error("Component task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
    #[error("Join handle already consumed")]
    AlreadyConsumed,
}

/// A join handle shared between clones of a component handle. Only the first
/// `consume` awaits the task.
#[derive(Debug, Clone)]
pub(super) struct ConsumableJoinHandle(Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>);

impl ConsumableJoinHandle {
    pub(super) fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        ConsumableJoinHandle(Arc::new(Mutex::new(Some(handle))))
    }

    async fn consume(&self) -> Result<(), ConsumeJoinHandleError> {
        let handle = { self.0.lock().take() };
        match handle {
            Some(handle) => Ok(handle.await?),
            None => Err(ConsumeJoinHandleError::AlreadyConsumed),
        }
    }

    fn is_finished(&self) -> bool {
        self.0
            .lock()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

/// The sending half of a component's queue.
#[derive(Debug)]
pub(crate) struct ComponentSender<C: Component> {
    sender: tokio::sync::mpsc::Sender<WrappedMessage<C>>,
}

impl<C: Component> ComponentSender<C> {
    pub(super) fn new(sender: tokio::sync::mpsc::Sender<WrappedMessage<C>>) -> Self {
        ComponentSender { sender }
    }

    /// Waits for queue capacity. Only fails when the component is gone.
    pub(super) async fn wrap_and_send_waiting<M>(
        &self,
        message: M,
        tracing_context: Option<tracing::Span>,
    ) -> Result<(), ChannelError>
    where
        C: Handler<M>,
        M: Message,
    {
        self.sender
            .send(WrappedMessage::new(message, None, tracing_context))
            .await
            .map_err(|error| ChannelError::SendError(error.to_string()))
    }

    pub(super) async fn wrap_and_request<M>(
        &self,
        message: M,
        tracing_context: Option<tracing::Span>,
    ) -> Result<C::Result, RequestError>
    where
        C: Handler<M>,
        M: Message,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(WrappedMessage::new(message, Some(tx), tracing_context))
            .await
            .map_err(|_| RequestError::SendError)?;

        rx.await.map_err(|_| RequestError::ReceiveError)
    }
}

// Cannot derive, see https://github.com/rust-lang/rust/issues/26925
impl<C: Component> Clone for ComponentSender<C> {
    fn clone(&self) -> Self {
        ComponentSender {
            sender: self.sender.clone(),
        }
    }
}

/// A handle to a running component, used to message, stop and join it.
#[derive(Debug)]
pub struct ComponentHandle<C: Component + Debug> {
    cancellation_token: tokio_util::sync::CancellationToken,
    state: Arc<Mutex<ComponentState>>,
    join_handle: ConsumableJoinHandle,
    sender: ComponentSender<C>,
}

impl<C: Component> Clone for ComponentHandle<C> {
    fn clone(&self) -> Self {
        ComponentHandle {
            cancellation_token: self.cancellation_token.clone(),
            state: self.state.clone(),
            join_handle: self.join_handle.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<C: Component> ComponentHandle<C> {
    pub(super) fn new(
        cancellation_token: tokio_util::sync::CancellationToken,
        join_handle: ConsumableJoinHandle,
        sender: ComponentSender<C>,
    ) -> Self {
        ComponentHandle {
            cancellation_token,
            state: Arc::new(Mutex::new(ComponentState::Running)),
            join_handle,
            sender,
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        self.cancellation_token.cancel();
        *state = ComponentState::Stopped;
    }

    /// Waits for the component's task to exit. Errors if another clone of this
    /// handle already joined.
    pub async fn join(&self) -> Result<(), ConsumeJoinHandleError> {
        self.join_handle.consume().await
    }

    pub fn state(&self) -> ComponentState {
        if self.cancellation_token.is_cancelled() || self.join_handle.is_finished() {
            return ComponentState::Stopped;
        }
        *self.state.lock()
    }

    pub async fn request<M>(
        &self,
        message: M,
        tracing_context: Option<tracing::Span>,
    ) -> Result<C::Result, RequestError>
    where
        C: Handler<M>,
        M: Message,
    {
        self.sender.wrap_and_request(message, tracing_context).await
    }
}

/// Passed to every handler invocation of a component.
pub struct ComponentContext<C>
where
    C: Component + 'static,
{
    pub(crate) system: System,
    pub(crate) sender: ComponentSender<C>,
    pub cancellation_token: tokio_util::sync::CancellationToken,
}
