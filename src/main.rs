// =============================================================================
// Meridian — Daily Equities Decision & Execution Engine
// =============================================================================
//
// One invocation = one trading-day run. The external scheduler (cron,
// systemd timer, whatever the deployment uses) fires this binary around
// the market open; everything the run learns is persisted for the next one.
//
// Exit codes: 0 completed (possibly with no trades), 2 state expired,
// 3 circuit-breaker halt, 4 pre-market health check failed, 5 unhandled
// error.
// =============================================================================

mod agents;
mod audit;
mod breaker;
mod broker;
mod config;
mod errors;
mod executor;
mod indicators;
mod llm;
mod market_data;
mod orchestrator;
mod retry;
mod risk;
mod state;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agents::execution_agent::ExecutionAgent;
use crate::agents::meta::MetaAgent;
use crate::agents::research::ResearchAgent;
use crate::agents::risk_agent::RiskAgent;
use crate::agents::rl_filter::RlFilter;
use crate::agents::signal::SignalAgent;
use crate::agents::SpecialistAgent;
use crate::audit::{AuditKind, AuditRecord, AuditTrail};
use crate::breaker::CircuitBreaker;
use crate::broker::alpaca::AlpacaBroker;
use crate::broker::gateway::GatewayBroker;
use crate::broker::paper::PaperBroker;
use crate::broker::BrokerAdapter;
use crate::config::EngineConfig;
use crate::executor::{BrokerBreakerConfig, ExecutorConfig, MultiBrokerExecutor};
use crate::llm::{DisabledLlm, HttpLlmClient, LlmClient, LlmOptions};
use crate::market_data::cache::BarCache;
use crate::market_data::health_log::HealthLog;
use crate::market_data::provider::SourceSlot;
use crate::market_data::sources::{AlpacaSource, AlphaVantageSource, YfinanceSource};
use crate::market_data::MarketDataProvider;
use crate::orchestrator::Orchestrator;
use crate::risk::RiskManager;
use crate::state::StateStore;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Equities Engine — Daily Run             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        match EngineConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to load config file — using env + defaults");
                EngineConfig::from_env()
            }
        }
    } else {
        EngineConfig::from_env()
    };

    info!(
        paper_trading = config.paper_trading,
        watchlist = ?config.watchlist,
        daily_investment = config.daily_investment,
        "engine configured"
    );

    // ── 2. Build and run ─────────────────────────────────────────────────
    let orchestrator = build_orchestrator(config);

    let exit_code = match orchestrator.run().await {
        Ok(report) => {
            for decision in &report.decisions {
                info!(
                    symbol = %decision.symbol,
                    action = %decision.action,
                    confidence = format!("{:.2}", decision.confidence),
                    outcome = %decision.outcome,
                    "decision"
                );
            }
            info!(
                symbols = report.symbols_evaluated,
                orders = report.orders_submitted,
                closed = report.positions_closed,
                skipped = report.symbols_skipped,
                entries_blocked = report.entries_blocked,
                "run summary"
            );
            0
        }
        Err(e) => {
            error!(error = %e, "run failed");
            orchestrator.audit.record(AuditRecord::new(
                AuditKind::Failure,
                None,
                format!("run failed: {e}"),
                serde_json::json!({ "exit_code": e.exit_code() }),
            ));
            e.exit_code()
        }
    };

    std::process::exit(exit_code);
}

/// Wire every component from configuration and environment secrets.
fn build_orchestrator(config: EngineConfig) -> Orchestrator {
    // ── Market data chain: yfinance → alpaca → alpha_vantage ────────────
    let alpaca_key = std::env::var("ALPACA_API_KEY").unwrap_or_default();
    let alpaca_secret = std::env::var("ALPACA_API_SECRET").unwrap_or_default();
    let alpha_vantage_key = std::env::var("ALPHAVANTAGE_API_KEY").unwrap_or_default();

    let mut sources = vec![SourceSlot {
        source: Arc::new(YfinanceSource::new()) as Arc<dyn market_data::sources::BarSource>,
        retry: config.yfinance_retry(),
    }];
    if !alpaca_key.is_empty() {
        sources.push(SourceSlot {
            source: Arc::new(AlpacaSource::new(&alpaca_key, &alpaca_secret)),
            retry: config.alpaca_retry(),
        });
    }
    if !alpha_vantage_key.is_empty() {
        sources.push(SourceSlot {
            source: Arc::new(AlphaVantageSource::new(
                &alpha_vantage_key,
                Duration::from_secs_f64(config.alphavantage_min_interval_seconds),
            )),
            retry: config.alphavantage_retry(),
        });
    }

    let provider = Arc::new(MarketDataProvider::new(
        sources,
        BarCache::new(
            &config.cache_dir,
            Duration::from_secs(config.cache_ttl_seconds),
            config.cache_max_age_days,
        ),
        HealthLog::new(&config.health_log_path),
    ));

    // ── Brokers in priority order ───────────────────────────────────────
    let mut brokers: Vec<Arc<dyn BrokerAdapter>> = Vec::new();
    if !alpaca_key.is_empty() {
        let alpaca = if config.paper_trading {
            AlpacaBroker::paper(&alpaca_key, &alpaca_secret)
        } else {
            AlpacaBroker::new(
                "https://api.alpaca.markets",
                "https://data.alpaca.markets",
                &alpaca_key,
                &alpaca_secret,
            )
        };
        brokers.push(Arc::new(alpaca));
    }
    if let (Ok(gw_url), Ok(gw_key), Ok(gw_secret)) = (
        std::env::var("GATEWAY_BASE_URL"),
        std::env::var("GATEWAY_API_KEY"),
        std::env::var("GATEWAY_API_SECRET"),
    ) {
        brokers.push(Arc::new(GatewayBroker::new(gw_url, gw_key, gw_secret)));
    }
    if brokers.is_empty() {
        warn!("no broker credentials configured — using the in-memory paper broker");
        brokers.push(Arc::new(PaperBroker::new("paper", 100_000.0)));
    }

    let executor = Arc::new(MultiBrokerExecutor::new(
        brokers,
        ExecutorConfig {
            failover_enabled: config.enable_broker_failover,
            breaker: BrokerBreakerConfig::default(),
            ..ExecutorConfig::default()
        },
    ));

    // ── Decision pipeline ───────────────────────────────────────────────
    let llm: Arc<dyn LlmClient> = if config.llm_endpoint.is_empty() {
        Arc::new(DisabledLlm)
    } else {
        Arc::new(HttpLlmClient::new(
            &config.llm_endpoint,
            std::env::var("LLM_API_KEY").unwrap_or_default(),
            &config.llm_model,
        ))
    };
    let llm_options = LlmOptions {
        max_tokens: config.llm_max_tokens,
        timeout: config.specialist_timeout(),
    };

    let risk = Arc::new(RiskManager::new(config.risk_config()));
    let specialists = vec![
        Arc::new(SpecialistAgent::Research(ResearchAgent::new(
            llm,
            llm_options,
        ))),
        Arc::new(SpecialistAgent::Signal(SignalAgent::new())),
        Arc::new(SpecialistAgent::Risk(RiskAgent::new(risk.clone()))),
        Arc::new(SpecialistAgent::Execution(ExecutionAgent::new())),
    ];

    Orchestrator {
        meta: Arc::new(MetaAgent::new(config.buy_threshold)),
        state_store: Arc::new(StateStore::new(
            config.state_path.clone(),
            config.state_expiry_hours,
        )),
        breaker: Arc::new(CircuitBreaker::new(config.breaker_config(), 0.0)),
        rl: Arc::new(RlFilter::new(config.rl_config())),
        audit: Arc::new(AuditTrail::new(&config.audit_log_path)),
        provider,
        executor,
        risk,
        specialists,
        config,
    }
}
