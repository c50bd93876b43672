use super::{system::System, Component, ComponentContext, ComponentSender, WrappedMessage};
use tokio::{select, time::timeout};
use tracing::{Instrument, Span};

/// Runs a component's handlers on its own task, one message at a time.
pub(super) struct ComponentExecutor<C>
where
    C: Component,
{
    sender: ComponentSender<C>,
    cancellation_token: tokio_util::sync::CancellationToken,
    system: System,
    handler: C,
    queue_depth_metric: opentelemetry::metrics::Histogram<u64>,
}

impl<C> ComponentExecutor<C>
where
    C: Component + Send + 'static,
{
    pub(super) fn new(
        sender: ComponentSender<C>,
        cancellation_token: tokio_util::sync::CancellationToken,
        handler: C,
        system: System,
    ) -> Self {
        let max_queue_depth = handler.queue_size().max(10);

        ComponentExecutor {
            sender,
            cancellation_token,
            system,
            handler,
            queue_depth_metric: opentelemetry::global::meter("strata_system")
                .u64_histogram("component_queue_depth")
                .with_description("The depth of the component's message queue")
                .with_boundaries(
                    (0..=10)
                        .map(|i| (i * (max_queue_depth / 10)) as f64)
                        .collect::<Vec<_>>(),
                )
                .build(),
        }
    }

    fn context(&self) -> ComponentContext<C> {
        ComponentContext {
            system: self.system.clone(),
            sender: self.sender.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }

    async fn stop(&mut self) {
        match timeout(self.handler.on_stop_timeout(), self.handler.on_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(component = C::get_name(), "Error while stopping: {err}");
            }
            Err(_) => {
                tracing::error!(
                    component = C::get_name(),
                    "Timed out while stopping {:?}",
                    self.handler
                );
            }
        }
    }

    pub(super) async fn run(&mut self, mut channel: tokio::sync::mpsc::Receiver<WrappedMessage<C>>) {
        let ctx = self.context();
        self.handler.on_start(&ctx).await;

        let attributes = [opentelemetry::KeyValue::new("component_name", C::get_name())];
        loop {
            let queue_depth = channel.max_capacity() - channel.capacity();
            self.queue_depth_metric
                .record(queue_depth as u64, &attributes);

            select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    self.stop().await;
                    break;
                }
                message = channel.recv() => {
                    match message {
                        Some(mut message) => {
                            let span = message
                                .take_tracing_context()
                                .unwrap_or_else(Span::current);
                            message.handle(&mut self.handler, &ctx).instrument(span).await;
                        }
                        None => {
                            // Every sender is gone.
                            self.stop().await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(component = C::get_name(), "Component stopped");
    }
}
