use strata_pipeline::pipeline_service_entrypoint;

#[tokio::main]
async fn main() {
    pipeline_service_entrypoint().await;
}
