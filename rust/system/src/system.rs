use super::executor::ComponentExecutor;
use super::{
    Component, ComponentContext, ComponentHandle, ComponentSender, ConsumableJoinHandle, Handler,
    Message, StreamHandler,
};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::{pin, select};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

struct Inner {
    // Parent of every component's token, so `stop` reaches all of them.
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
}

/// Spawns components onto the ambient tokio runtime and tracks their tasks.
#[derive(Clone)]
pub struct System {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("tasks", &self.inner.tasks.len())
            .field("stopped", &self.inner.cancellation_token.is_cancelled())
            .finish()
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    pub fn new() -> System {
        System {
            inner: Arc::new(Inner {
                cancellation_token: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn start_component<C>(&self, component: C) -> ComponentHandle<C>
    where
        C: Component + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel(component.queue_size());
        let sender = ComponentSender::new(tx);
        let cancel_token = self.inner.cancellation_token.child_token();
        let mut executor =
            ComponentExecutor::new(sender.clone(), cancel_token.clone(), component, self.clone());

        let span = tracing::debug_span!("component", name = C::get_name());
        let join_handle = self
            .inner
            .tasks
            .spawn(async move { executor.run(rx).await }.instrument(span));
        ComponentHandle::new(cancel_token, ConsumableJoinHandle::new(join_handle), sender)
    }

    pub(super) fn register_stream<C, S, M>(&self, stream: S, ctx: &ComponentContext<C>)
    where
        C: StreamHandler<M> + Handler<M>,
        M: Message,
        S: Stream + Send + Stream<Item = M> + 'static,
    {
        let ctx = ComponentContext {
            system: self.clone(),
            sender: ctx.sender.clone(),
            cancellation_token: ctx.cancellation_token.clone(),
        };
        self.inner
            .tasks
            .spawn(async move { stream_loop(stream, &ctx).await });
    }

    /// Cancels every component started by this system.
    pub fn stop(&self) {
        self.inner.cancellation_token.cancel();
        self.inner.tasks.close();
    }

    /// Waits for every component and stream task to exit. Call after `stop`.
    pub async fn join(&self) {
        self.inner.tasks.wait().await;
    }
}

async fn stream_loop<C, S, M>(stream: S, ctx: &ComponentContext<C>)
where
    C: StreamHandler<M> + Handler<M>,
    M: Message,
    S: Stream + Send + Stream<Item = M> + 'static,
{
    pin!(stream);
    loop {
        select! {
            _ = ctx.cancellation_token.cancelled() => {
                break;
            }
            message = stream.next() => {
                match message {
                    Some(message) => {
                        if let Err(err) = ctx.sender.wrap_and_send_waiting(message, None).await {
                            tracing::warn!(
                                component = C::get_name(),
                                "Stopping stream, component is gone: {err}"
                            );
                            break;
                        }
                    }
                    None => {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Slow {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Component for Slow {
        fn get_name() -> &'static str {
            "Slow"
        }

        fn queue_size(&self) -> usize {
            1
        }

        async fn on_start(&mut self, ctx: &ComponentContext<Self>) -> () {
            self.register_stream(futures::stream::iter(0..50_usize), ctx);
        }
    }

    #[async_trait]
    impl Handler<usize> for Slow {
        type Result = ();

        async fn handle(&mut self, _message: usize, _ctx: &ComponentContext<Self>) {
            tokio::task::yield_now().await;
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamHandler<usize> for Slow {}

    #[tokio::test]
    async fn streams_are_not_dropped_by_a_small_queue() {
        let system = System::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _handle = system.start_component(Slow { seen: seen.clone() });
        for _ in 0..1_000 {
            if seen.load(Ordering::SeqCst) == 50 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 50);
        system.stop();
        system.join().await;
    }

    #[tokio::test]
    async fn stopping_the_system_stops_its_components() {
        let system = System::new();
        let handle = system.start_component(Slow {
            seen: Arc::new(AtomicUsize::new(0)),
        });
        system.stop();
        system.join().await;
        assert_eq!(handle.state(), crate::ComponentState::Stopped);
    }
}
