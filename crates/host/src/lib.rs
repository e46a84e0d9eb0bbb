//! Sample host: wires a consume pipe to the order saga and drives a batch of
//! orders through it.
//!
//! Published messages are fed back into the same pipe through a loopback
//! publisher and held in an outbox until the publishing dispatch succeeded,
//! so a payment is only requested for an order whose state was committed.

pub mod config;
pub mod error;
pub mod orders;
pub mod telemetry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use pipeline::{
    BoxError, ConcurrencyLimitFilter, ConsumeContext, ConsumePipe, InMemoryOutbox, Publisher,
};
use saga::{SagaPipeExt, SagaRepository};
use saga_store::{
    CorrelationId, InMemorySagaStore, PostgresLockStatementProvider, PostgresSagaStore, SagaStore,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::{Config, LogFormat};
pub use error::{HostError, Result};

use orders::{OrderConfirmed, OrderState, OrderSubmitted, PaymentAccepted, PaymentRequested};

/// Opens the saga store named by the configuration.
///
/// Without `DATABASE_URL` the host runs against an in-memory store.
pub async fn open_store(config: &Config) -> Result<Arc<dyn SagaStore>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::info!("DATABASE_URL not set, using the in-memory saga store");
        return Ok(Arc::new(InMemorySagaStore::new()));
    };

    let max_connections = u32::try_from(config.concurrency_limit)
        .unwrap_or(u32::MAX)
        .saturating_add(1);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    let store = PostgresSagaStore::new(pool);
    store.run_migrations().await?;

    let lock_statements = if config.lock_nowait {
        PostgresLockStatementProvider::no_wait()
    } else {
        PostgresLockStatementProvider::new()
    };
    let store = store
        .with_table(&config.saga_table)?
        .with_lock_statements(Arc::new(lock_statements));

    tracing::info!(table = %config.saga_table, "using the PostgreSQL saga store");
    Ok(Arc::new(store))
}

/// The order saga connected to its pipe, plus the confirmation feed.
pub struct OrderHost {
    pipe: ConsumePipe,
    repository: SagaRepository<OrderState>,
    publisher: Arc<dyn Publisher>,
    confirmations: mpsc::UnboundedReceiver<OrderConfirmed>,
    cancellation: CancellationToken,
}

impl OrderHost {
    pub fn new(
        store: Arc<dyn SagaStore>,
        config: &Config,
        cancellation: CancellationToken,
    ) -> Result<Self> {
        let machine = Arc::new(orders::order_machine()?);
        let repository = SagaRepository::new(store, machine, config.repository_settings());

        let pipe = ConsumePipe::new();
        pipe.use_filter(ConcurrencyLimitFilter::new(config.concurrency_limit));
        pipe.use_filter(InMemoryOutbox::new());

        pipe.connect_saga::<OrderSubmitted, _>(&repository);
        pipe.connect_saga::<PaymentAccepted, _>(&repository);
        pipe.connect_handler("payment-gateway", |ctx: ConsumeContext<PaymentRequested>| {
            orders::accept_payment(ctx)
        });

        let (tx, confirmations) = mpsc::unbounded_channel();
        pipe.connect_handler(
            "order-confirmations",
            move |ctx: ConsumeContext<OrderConfirmed>| {
                let tx = tx.clone();
                async move {
                    tx.send(ctx.message().clone())
                        .map_err(|_| BoxError::from("confirmation receiver dropped"))
                }
            },
        );

        let publisher = pipe.loopback(cancellation.clone());
        tracing::info!(
            saga = repository.machine().name(),
            mode = %repository.mode(),
            "order saga connected"
        );

        Ok(Self {
            pipe,
            repository,
            publisher,
            confirmations,
            cancellation,
        })
    }

    pub fn pipe(&self) -> &ConsumePipe {
        &self.pipe
    }

    pub fn repository(&self) -> &SagaRepository<OrderState> {
        &self.repository
    }

    /// Dispatches one order submission and waits for its dispatch to finish.
    pub async fn submit(&self, order: OrderSubmitted) -> Result<()> {
        let context = ConsumeContext::new(order)
            .with_publisher(Arc::clone(&self.publisher))
            .with_cancellation(self.cancellation.clone());
        self.pipe.send(context).await.map_err(|error| {
            if error.is_cancelled() {
                HostError::Cancelled
            } else {
                HostError::Pipe(error)
            }
        })?;
        metrics::counter!("host_orders_submitted_total").increment(1);
        Ok(())
    }

    /// Dispatches all submissions concurrently. Returns the first failure
    /// after every dispatch has finished.
    pub async fn submit_batch(&self, orders: Vec<OrderSubmitted>) -> Result<()> {
        let results = join_all(orders.into_iter().map(|order| self.submit(order))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(failed, "order submissions failed");
        }
        results.into_iter().collect()
    }

    /// Waits until `expected` orders have been confirmed.
    pub async fn await_confirmations(
        &mut self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<OrderConfirmed>> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut confirmed = Vec::with_capacity(expected);
        while confirmed.len() < expected {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => return Err(HostError::Cancelled),
                () = &mut deadline => {
                    return Err(HostError::ConfirmationTimeout {
                        confirmed: confirmed.len(),
                        expected,
                        waited: timeout,
                    });
                }
                next = self.confirmations.recv() => match next {
                    Some(order) => {
                        tracing::debug!(order_number = %order.order_number, "order confirmed");
                        metrics::counter!("host_orders_confirmed_total").increment(1);
                        confirmed.push(order);
                    }
                    None => return Err(HostError::Cancelled),
                },
            }
        }
        Ok(confirmed)
    }
}

/// Builds `count` orders with order numbers unique to this batch.
pub fn sample_orders(count: usize) -> Vec<OrderSubmitted> {
    let batch = CorrelationId::new().as_uuid().simple().to_string();
    let batch = &batch[..8];
    (1..=count)
        .map(|i| OrderSubmitted {
            order_id: CorrelationId::new(),
            order_number: format!("ORD-{batch}-{i:04}"),
            amount_cents: 1_000 + 250 * i as u64,
        })
        .collect()
}

/// Outcome of a host run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    pub confirmed: usize,
    pub elapsed: Duration,
}

/// Submits a batch of sample orders and waits for all of them to be confirmed.
pub async fn run(config: &Config, cancellation: CancellationToken) -> Result<RunSummary> {
    let started = Instant::now();
    let store = open_store(config).await?;
    let mut host = OrderHost::new(store, config, cancellation)?;

    let orders = sample_orders(config.order_count);
    let submitted = orders.len();
    tracing::info!(submitted, "submitting orders");
    host.submit_batch(orders).await?;

    let confirmed = host
        .await_confirmations(submitted, config.confirmation_timeout)
        .await?;

    let summary = RunSummary {
        submitted,
        confirmed: confirmed.len(),
        elapsed: started.elapsed(),
    };
    tracing::info!(
        submitted = summary.submitted,
        confirmed = summary.confirmed,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "all orders confirmed"
    );
    Ok(summary)
}
