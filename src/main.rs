use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use task_farm::client::StreamOrder;
use task_farm::{
    ClientError, Comparison, ControllerConfig, ControllerHandle, Dependency, LocalWorker,
    Properties, Task, TaskClient, WorkError, WorkerId,
};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ControllerConfig::from_env()?;
    let workers: u64 = std::env::var("TASK_FARM_DEMO_WORKERS")
        .unwrap_or_else(|_| "4".to_string())
        .parse()
        .unwrap_or(4);

    eprintln!("Task Farm v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Policy: {:?}", config.queue_policy);
    eprintln!("   Workers: {}", workers);

    let controller = ControllerHandle::spawn(config);
    for id in 0..workers {
        // Every other worker advertises a GPU.
        let mut properties = Properties::new();
        properties.insert("gpu".into(), json!(id % 2 == 1));
        properties.insert("cores".into(), json!(4 + id));
        controller
            .register_worker(WorkerId(id), properties, Arc::new(LocalWorker::new()))
            .await?;
    }

    let client = TaskClient::connect(controller.clone());

    // ── Fan out a map, one element fails ────────────────────────────────
    let squares = client
        .map(
            |args| {
                let n = args.first().and_then(Value::as_i64).unwrap_or_default();
                if n == 3 {
                    return Err(WorkError::failed("three is unlucky"));
                }
                std::thread::sleep(Duration::from_millis(50));
                Ok(json!(n * n))
            },
            vec![(1..=8).map(|n| json!(n)).collect()],
        )
        .await?;

    let mut stream = squares.stream(StreamOrder::Completion);
    while let Some(result) = stream.next().await {
        let result = result?;
        eprintln!(
            "   task {} on engine {:?}: {}",
            result.task_id,
            result.engine_id.map(|w| w.0),
            result.status
        );
    }

    match squares.get(None).await {
        Ok(values) => eprintln!("   squares: {values}"),
        Err(ClientError::Composite(composite)) => {
            eprintln!("   {composite}");
            let values: Vec<&Value> = composite.values().into_iter().map(|(_, v)| v).collect();
            eprintln!("   surviving values: {values:?}");
        }
        Err(e) => return Err(e.into()),
    }

    // ── A GPU-only task with push/pull ──────────────────────────────────
    let gpu_task = Task::call(|ns| {
        let x = ns.get("x").and_then(Value::as_f64).unwrap_or_default();
        ns.insert("y".into(), json!(x * 2.0));
        Ok(Value::Null)
    })
    .push("x", 21.0)
    .pull("y")
    .depend(Dependency::require("gpu", Comparison::Eq, true))
    .retries(2);

    let doubled = client.apply(gpu_task).await?;
    eprintln!("   gpu task pulled: {}", doubled.get(Some(Duration::from_secs(10))).await?);

    let report = client.queue_status(false).await?;
    eprintln!("   queue: {:?}", report.counts());

    controller.shutdown().await?;
    Ok(())
}
