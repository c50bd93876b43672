use super::{Component, ComponentContext, Handler, Message};
use async_trait::async_trait;
use futures::FutureExt;
use std::{fmt::Debug, panic::AssertUnwindSafe};
use tokio::sync::oneshot;

// The reply channel is typed by both the component and the message, while the
// queue is typed by the component only, so the pair is erased behind
// `HandleableMessage`.
#[derive(Debug)]
pub(crate) struct HandleableMessageImpl<M: Message, Result: Send> {
    message: M,
    // Only `request` provides a reply channel.
    reply_channel: Option<oneshot::Sender<Result>>,
}

impl<M: Message, Result: Send> HandleableMessageImpl<M, Result> {
    pub(super) fn new(message: M, reply_channel: Option<oneshot::Sender<Result>>) -> Self {
        HandleableMessageImpl {
            message,
            reply_channel,
        }
    }
}

/// A type-erased message for component `C`, plus the span to handle it in.
#[derive(Debug)]
pub(crate) struct WrappedMessage<C>
where
    C: Component,
{
    boxed_message: Box<dyn HandleableMessage<C>>,
    tracing_context: Option<tracing::Span>,
}

impl<C: Component> WrappedMessage<C> {
    pub(super) fn new<M>(
        message: M,
        reply_channel: Option<oneshot::Sender<C::Result>>,
        tracing_context: Option<tracing::Span>,
    ) -> Self
    where
        C: Component + Handler<M>,
        M: Message,
    {
        WrappedMessage {
            boxed_message: Box::new(Some(HandleableMessageImpl::new(message, reply_channel))),
            tracing_context,
        }
    }

    pub(super) async fn handle(&mut self, component: &mut C, ctx: &ComponentContext<C>) {
        self.boxed_message.handle_and_reply(component, ctx).await;
    }

    pub(super) fn take_tracing_context(&mut self) -> Option<tracing::Span> {
        self.tracing_context.take()
    }
}

#[async_trait]
pub(super) trait HandleableMessage<C>: Debug + Send
where
    C: Component,
{
    async fn handle_and_reply(&mut self, component: &mut C, ctx: &ComponentContext<C>) -> ();
}

#[async_trait]
impl<C, M> HandleableMessage<C> for Option<HandleableMessageImpl<M, C::Result>>
where
    C: Component + Handler<M>,
    M: Message,
{
    async fn handle_and_reply(&mut self, component: &mut C, ctx: &ComponentContext<C>) -> () {
        let Some(message) = self.take() else {
            return;
        };
        let result = AssertUnwindSafe(component.handle(message.message, ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(result) => {
                if let Some(reply_channel) = message.reply_channel {
                    if reply_channel.send(result).is_err() {
                        tracing::warn!(
                            component = C::get_name(),
                            "Requester went away before the reply was sent"
                        );
                    }
                }
            }
            // The reply channel is dropped with `message`, so a requester sees
            // `RequestError::ReceiveError`.
            Err(panic_value) => component.on_handler_panic(panic_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ComponentSender, System};

    #[derive(Debug)]
    struct Ping;

    #[derive(Debug)]
    struct Boom;

    #[derive(Debug, Default)]
    struct Recorder {
        panics: usize,
    }

    impl Component for Recorder {
        fn get_name() -> &'static str {
            "Recorder"
        }

        fn queue_size(&self) -> usize {
            10
        }

        fn on_handler_panic(&mut self, _panic: Box<dyn std::any::Any + Send>) {
            self.panics += 1;
        }
    }

    #[async_trait]
    impl Handler<Ping> for Recorder {
        type Result = &'static str;

        async fn handle(&mut self, _: Ping, _: &ComponentContext<Self>) -> &'static str {
            "pong"
        }
    }

    #[async_trait]
    impl Handler<Boom> for Recorder {
        type Result = ();

        async fn handle(&mut self, _: Boom, _: &ComponentContext<Self>) {
            panic!("boom");
        }
    }

    fn context() -> ComponentContext<Recorder> {
        let (tx, _) = tokio::sync::mpsc::channel(10);
        ComponentContext {
            system: System::new(),
            sender: ComponentSender::new(tx),
            cancellation_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn dropped_reply_channel_does_not_panic() {
        let mut component = Recorder::default();
        let ctx = context();
        let (tx, rx) = oneshot::channel();
        let mut message = Some(HandleableMessageImpl::new(Ping, Some(tx)));
        drop(rx);
        message.handle_and_reply(&mut component, &ctx).await;
        assert_eq!(component.panics, 0);
    }

    #[tokio::test]
    async fn handler_panics_reach_the_component_and_drop_the_reply() {
        let mut component = Recorder::default();
        let ctx = context();
        let (tx, rx) = oneshot::channel();
        let mut message = Some(HandleableMessageImpl::new(Boom, Some(tx)));
        message.handle_and_reply(&mut component, &ctx).await;
        assert_eq!(component.panics, 1);
        assert!(rx.await.is_err());
    }
}
