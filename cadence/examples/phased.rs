use std::{sync::Arc, time::Duration};

use cadence::{
    ActivityDef, EngineConfig, Reporter, Scenario, ScenarioController, report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

// A warmup phase at a modest rate, then the main load stepped up twice while
// a background writer keeps going until the main load is done.
async fn phases(c: Arc<ScenarioController>) -> cadence::Result<()> {
    c.run(
        ActivityDef::parse("alias=warmup;driver=diag;op=warm;cycles=2K;threads=4;cyclerate=1000")?,
        Duration::from_secs(30),
    )
    .await?;

    c.start(ActivityDef::parse(
        "alias=writer;driver=diag;op=write;cycles=1B;threads=2;cyclerate=200;delay_ms=1",
    )?)
    .await?;
    c.start(ActivityDef::parse(
        "alias=main;driver=diag;op=read;ratio=3;cycles=40K;threads=auto;cyclerate=2000",
    )?)
    .await?;

    for (rate, threads) in [("4000", "16"), ("8000", "32")] {
        c.wait_millis(3_000).await;
        c.set_param("main", "cyclerate", rate).await?;
        c.set_param("main", "threads", threads).await?;
    }

    c.await_activity("main", Duration::from_secs(120)).await?;
    c.stop("writer").await
}

#[tokio::main]
async fn main() -> cadence::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_target(false)
        .init();

    let result = Scenario::builder()
        .name("phased")
        .procedure(Arc::new(phases))
        .config(
            EngineConfig::builder()
                .progress_interval(Duration::from_secs(2))
                .build(),
        )
        .build()
        .run()
        .await;

    StdoutReporter.report(&result).await
}
