use std::sync::Arc;
use std::time::Duration;

use dagflow::*;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct TripId(u64);

#[derive(Debug, Clone)]
struct Trip {
    driver_id: u64,
    rider_id: u64,
}

#[derive(Debug, Clone)]
struct Driver {
    name: String,
}

#[derive(Debug, Clone)]
struct Rider {
    name: String,
    home_id: u64,
}

#[derive(Debug, Clone)]
struct Location {
    city: String,
}

#[derive(Debug, Clone)]
struct Response {
    driver: String,
    rider: String,
    home_city: String,
}

async fn lookup_delay() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn trip_flow() -> Result<Flow, GraphErrors> {
    Flow::builder("trip-lookup")
        .param(TripId(42))
        .result::<Response>()
        .concurrency(4)
        .emitter(Arc::new(TracingEmitter))
        .task(
            TaskDescriptor::builder(|_ctx, input| async move {
                let id = input.require::<TripId>()?;
                lookup_delay().await;
                Ok(Values::new().with(Trip {
                    driver_id: id.0 * 10,
                    rider_id: id.0 * 100,
                }))
            })
            .name("trip_by_id")
            .input::<TripId>()
            .output::<Trip>()
            .fallible()
            .build(),
        )
        .task(
            TaskDescriptor::builder(|_ctx, input| async move {
                let trip = input.require::<Trip>()?;
                lookup_delay().await;
                Ok(Values::new().with(Driver {
                    name: format!("driver-{}", trip.driver_id),
                }))
            })
            .name("driver_by_id")
            .input::<Trip>()
            .output::<Driver>()
            .fallible()
            .build(),
        )
        .task(
            TaskDescriptor::builder(|_ctx, input| async move {
                let trip = input.require::<Trip>()?;
                lookup_delay().await;
                Ok(Values::new().with(Rider {
                    name: format!("rider-{}", trip.rider_id),
                    home_id: trip.rider_id + 1,
                }))
            })
            .name("rider_by_id")
            .input::<Trip>()
            .output::<Rider>()
            .fallible()
            .build(),
        )
        .task(
            TaskDescriptor::builder(|_ctx, input| async move {
                let rider = input.require::<Rider>()?;
                lookup_delay().await;
                anyhow::bail!("location service unavailable for home {}", rider.home_id)
            })
            .name("location_by_id")
            .input::<Rider>()
            .output::<Location>()
            .fallible()
            .fallback(Fallback::values(Values::new().with(Location {
                city: "unknown".to_string(),
            })))
            .build(),
        )
        .task(
            TaskDescriptor::builder(|_ctx, input| async move {
                let driver = input.require::<Driver>()?;
                let rider = input.require::<Rider>()?;
                let home = input.require::<Location>()?;
                Ok(Values::new().with(Response {
                    driver: driver.name.clone(),
                    rider: rider.name.clone(),
                    home_city: home.city.clone(),
                }))
            })
            .name("build_response")
            .input::<Rider>()
            .input::<Driver>()
            .input::<Location>()
            .output::<Response>()
            .build(),
        )
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DAGFLOW_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let ctx = CancellationToken::new();
    let flow = trip_flow()?;

    println!("=== dependency graph ===");
    print!("{}", flow.graph());

    println!("=== running flow ===");
    let start = std::time::Instant::now();
    let results = flow.run(&ctx).await?;
    println!("elapsed: {:?}", start.elapsed());
    println!("response: {:#?}", results.require::<Response>()?);

    println!("=== running parallel ===");
    let cities = vec!["Amsterdam", "Lisbon", "Osaka"];
    Parallel::builder("warm-caches")
        .emitter(Arc::new(TracingEmitter))
        .task("flush", |_ctx| async {
            info!("flushing stale entries");
            Ok(())
        })
        .slice_with_end(
            "cities",
            cities,
            |_ctx, i, city| async move {
                lookup_delay().await;
                info!(index = i, city, "cache warmed");
                Ok(())
            },
            |_ctx| async {
                info!("every city warmed");
                Ok(())
            },
        )
        .build()?
        .run(&ctx)
        .await?;

    Ok(())
}
