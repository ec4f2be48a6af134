//! Order fulfillment over the in-memory store.
//!
//! Run with: cargo run -p keelson-durable --example order_flow

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use keelson_durable::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    sku: String,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Receipt {
    reservation: String,
    charged_cents: u64,
}

struct Fulfillment;

#[async_trait]
impl Workflow for Fulfillment {
    const NAME: &'static str = "fulfillment";
    type Input = Order;
    type Output = Receipt;

    async fn run(&self, ctx: &WorkflowContext, order: Order) -> Result<Receipt, StepError> {
        let sku = order.sku.clone();
        let quantity = order.quantity as u64;

        let reservation: String = ctx
            .step("reserve-inventory", move || async move {
                Ok::<_, WorkflowError>(format!("res-{}-{}", sku, quantity))
            })
            .await?;

        // Survives restarts: on resume the engine skips straight past this
        ctx.sleep(Duration::from_secs(2)).await?;

        let charged: u64 = ctx
            .step("charge-card", move || async move {
                Ok::<_, WorkflowError>(quantity * 1299)
            })
            .await?;

        Ok(Receipt {
            reservation,
            charged_cents: charged,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,keelson_durable=debug".into()),
        )
        .init();

    let store = Arc::new(InMemoryDurableStore::new());
    let leases = Arc::new(LeaseManager::new(store.clone(), "demo-replica"));

    let registry = WorkflowRegistry::new().with(Fulfillment);
    let runtime = Arc::new(WorkflowRuntime::new(store.clone(), leases.clone(), registry));

    let cron = Arc::new(CronRuntime::new(store.clone(), leases));
    let sweep = cron
        .register("inventory-sweep", "*/5 * * * *", || async {
            info!("sweeping expired reservations");
            Ok(())
        })
        .await?;

    let scheduler = PollScheduler::new(runtime.clone())
        .with_cron(cron.clone())
        .with_config(SchedulerConfig::default().with_poll_interval(Duration::from_millis(100)))
        .start();

    let handle = runtime
        .start::<Fulfillment>(
            "order-1001",
            Order {
                sku: "KEEL-7".into(),
                quantity: 3,
            },
        )
        .await?;

    let receipt: Receipt = handle.result_as(Duration::from_secs(30)).await?;
    info!(?receipt, "order fulfilled");

    // Fire the sweep once by hand instead of waiting for its schedule
    sweep.trigger().await?;
    for firing in sweep.history(5).await? {
        info!(job = %firing.job_name, status = ?firing.status, "cron history");
    }

    scheduler.shutdown().await;
    Ok(())
}
