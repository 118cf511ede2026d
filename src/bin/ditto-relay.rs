#[cfg(feature = "gateway")]
mod app {
    use std::path::PathBuf;
    use std::sync::Arc;

    use clap::Parser;

    use ditto_relay::adaptor::{AdaptorRegistry, build_http_client};
    use ditto_relay::channel::{ChannelRegistry, ChannelSelector};
    use ditto_relay::clock::{Clock, SystemClock};
    use ditto_relay::config::{Env, RelayConfig};
    use ditto_relay::ledger::QuotaLedger;
    use ditto_relay::observability::Observability;
    use ditto_relay::order::{
        HmacNotificationVerifier, HttpPaymentGateway, KeyedMutexLocker, MemoryOrderStatusCache,
        OrderLocker, OrderStatusCache, PaymentGateway, PaymentService, PaymentServiceParts,
        UnconfiguredPaymentGateway,
    };
    use ditto_relay::pricing::PricingTable;
    use ditto_relay::relay::RelayOrchestrator;
    use ditto_relay::store::{LedgerStore, MemoryStore, OrderStore, TaskStore, UserRecord};
    use ditto_relay::task::{TaskPoller, TaskService};
    use ditto_relay::{RelayHttpState, router};

    type BoxError = Box<dyn std::error::Error>;

    #[derive(Debug, Parser)]
    #[command(name = "ditto-relay", about = "Task relay gateway with quota billing")]
    struct Cli {
        /// Relay config (.toml, .json or .yaml).
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
        /// Persist users, tasks and orders in this sqlite file.
        #[arg(long)]
        sqlite: Option<PathBuf>,
        /// Share order locks and order status across instances.
        #[arg(long)]
        redis: Option<String>,
        #[arg(long, default_value = "ditto_relay")]
        redis_prefix: String,
        /// Dotenv file consulted before the process environment for `*_env` secrets.
        #[arg(long)]
        dotenv: Option<PathBuf>,
        #[arg(long)]
        json_logs: bool,
        #[arg(long)]
        otel: bool,
        #[arg(long)]
        otel_endpoint: Option<String>,
    }

    struct Stores {
        ledger: Arc<dyn LedgerStore>,
        tasks: Arc<dyn TaskStore>,
        orders: Arc<dyn OrderStore>,
    }

    pub async fn run() -> Result<(), BoxError> {
        let cli = Cli::parse();
        let _otel = init_logging(&cli)?;

        let config = RelayConfig::load(&cli.config)?;
        let env = match cli.dotenv.as_deref() {
            Some(path) => Env::load_dotenv(path)?,
            None => Env::default(),
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let observability = Arc::new(Observability::new());
        let stores = open_stores(&cli, &config).await?;

        let registry = Arc::new(ChannelRegistry::new(
            config.resolve_channels(&env)?,
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(QuotaLedger::new(
            stores.ledger.clone(),
            &config.ledger,
            clock.clone(),
            observability.clone(),
        ));
        let tasks = Arc::new(TaskService::new(
            stores.tasks.clone(),
            ledger.clone(),
            observability.clone(),
        ));
        let client = build_http_client(config.relay.upstream_timeout_secs)?;
        let adaptors = Arc::new(AdaptorRegistry::with_defaults(client.clone()));
        let pricing = Arc::new(PricingTable::new(config.pricing.clone()));

        let orchestrator = Arc::new(RelayOrchestrator::new(
            ChannelSelector::new(registry.clone()),
            ledger.clone(),
            tasks.clone(),
            adaptors.clone(),
            pricing.clone(),
            config.relay.clone(),
            observability.clone(),
        ));

        let _poller = config.task_poll.enabled.then(|| {
            Arc::new(TaskPoller::new(
                tasks.clone(),
                registry.clone(),
                adaptors.clone(),
                config.task_poll.clone(),
            ))
            .spawn()
        });

        let mut state = RelayHttpState::new(
            orchestrator,
            config.tokens.clone(),
            observability.clone(),
        );
        if config.payment.enabled {
            let payments = build_payments(
                &cli,
                &config,
                &env,
                stores.orders.clone(),
                ledger,
                pricing,
                clock,
                client,
                observability,
            )?;
            state = state.with_payments(Arc::new(payments));
        }

        let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
        tracing::info!(
            listen = %cli.listen,
            channels = registry.snapshot().len(),
            platforms = ?adaptors.platforms().collect::<Vec<_>>(),
            "ditto-relay listening"
        );
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await?;
        Ok(())
    }

    #[cfg(feature = "otel")]
    fn init_logging(
        cli: &Cli,
    ) -> Result<Option<ditto_relay::telemetry::OtelGuard>, BoxError> {
        if !cli.otel {
            ditto_relay::telemetry::init_tracing(cli.json_logs)?;
            return Ok(None);
        }
        Ok(Some(ditto_relay::telemetry::init_tracing_with_otel(
            "ditto-relay",
            cli.otel_endpoint.as_deref(),
            cli.json_logs,
        )?))
    }

    #[cfg(not(feature = "otel"))]
    fn init_logging(cli: &Cli) -> Result<Option<()>, BoxError> {
        if cli.otel || cli.otel_endpoint.is_some() {
            return Err("otel requires `--features otel`".into());
        }
        ditto_relay::telemetry::init_tracing(cli.json_logs)?;
        Ok(None)
    }

    async fn open_stores(cli: &Cli, config: &RelayConfig) -> Result<Stores, BoxError> {
        if let Some(path) = cli.sqlite.as_ref() {
            return open_sqlite(path, config).await;
        }
        let store = Arc::new(MemoryStore::new());
        for seed in &config.users {
            store.upsert_user(UserRecord::from(seed)).await;
        }
        tracing::warn!("no --sqlite given; balances, tasks and orders live in memory only");
        Ok(Stores {
            ledger: store.clone(),
            tasks: store.clone(),
            orders: store,
        })
    }

    #[cfg(feature = "store-sqlite")]
    async fn open_sqlite(path: &std::path::Path, config: &RelayConfig) -> Result<Stores, BoxError> {
        let store = Arc::new(ditto_relay::store::SqliteStore::new(path));
        store.init().await?;
        for seed in &config.users {
            if store.seed_user(UserRecord::from(seed)).await? {
                tracing::info!(user_id = seed.id, quota = seed.quota, "seeded user");
            }
        }
        Ok(Stores {
            ledger: store.clone(),
            tasks: store.clone(),
            orders: store,
        })
    }

    #[cfg(not(feature = "store-sqlite"))]
    async fn open_sqlite(
        _path: &std::path::Path,
        _config: &RelayConfig,
    ) -> Result<Stores, BoxError> {
        Err("sqlite persistence requires `--features store-sqlite`".into())
    }

    #[cfg(feature = "store-redis")]
    fn order_coordination(
        cli: &Cli,
        ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<dyn OrderLocker>, Arc<dyn OrderStatusCache>), BoxError> {
        let Some(url) = cli.redis.as_deref() else {
            return Ok(in_process_coordination(ttl_secs, clock));
        };
        let locker = ditto_relay::store::RedisOrderLocker::new(url)?
            .with_prefix(cli.redis_prefix.clone());
        let cache = ditto_relay::store::RedisOrderStatusCache::new(url)?
            .with_prefix(cli.redis_prefix.clone())
            .with_ttl_secs(ttl_secs);
        Ok((Arc::new(locker), Arc::new(cache)))
    }

    #[cfg(not(feature = "store-redis"))]
    fn order_coordination(
        cli: &Cli,
        ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<dyn OrderLocker>, Arc<dyn OrderStatusCache>), BoxError> {
        if cli.redis.is_some() {
            return Err("redis requires `--features store-redis`".into());
        }
        Ok(in_process_coordination(ttl_secs, clock))
    }

    fn in_process_coordination(
        ttl_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> (Arc<dyn OrderLocker>, Arc<dyn OrderStatusCache>) {
        (
            Arc::new(KeyedMutexLocker::new()),
            Arc::new(MemoryOrderStatusCache::new(ttl_secs, clock)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_payments(
        cli: &Cli,
        config: &RelayConfig,
        env: &Env,
        orders: Arc<dyn OrderStore>,
        ledger: Arc<QuotaLedger>,
        pricing: Arc<PricingTable>,
        clock: Arc<dyn Clock>,
        client: reqwest::Client,
        observability: Arc<Observability>,
    ) -> Result<PaymentService, BoxError> {
        let secret = config
            .notify_secret(env)?
            .ok_or("payment.enabled requires payment.notify_secret or notify_secret_env")?;
        let gateway: Arc<dyn PaymentGateway> = match config.payment.prepay_url.as_deref() {
            Some(url) => Arc::new(HttpPaymentGateway::new(client, url, config.prepay_key(env)?)),
            None => {
                tracing::warn!("payment.prepay_url is not set; top-up orders cannot be opened");
                Arc::new(UnconfiguredPaymentGateway)
            }
        };
        let (locker, status_cache) =
            order_coordination(cli, config.payment.order_status_ttl_secs, clock)?;

        Ok(PaymentService::new(
            config.payment.clone(),
            PaymentServiceParts {
                orders,
                ledger,
                pricing,
                locker,
                status_cache,
                gateway,
                verifier: Arc::new(HmacNotificationVerifier::new(secret)),
                observability,
            },
        ))
    }
}

#[cfg(feature = "gateway")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    app::run().await
}

#[cfg(not(feature = "gateway"))]
fn main() {
    eprintln!("gateway feature disabled; rebuild with --features gateway");
}
