//! Per-symbol grid-martingale trading process
//!
//! ## Setup
//!
//! 1. Create a `.env` file:
//!    ```
//!    BINANCE_API_KEY=...
//!    BINANCE_API_SECRET=...
//!    USE_TESTNET=1   # optional
//!    ```
//!
//! 2. Run one process per symbol:
//!    ```bash
//!    martingale_bot --config config_btc.txt --symbol BTCUSDC \
//!        --price-tick 0.1 --qty-step 0.001
//!    ```
//!
//! Exit codes: 0 normal, 1 fatal config error, 2 fatal venue error,
//! 3 fatal state corruption.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::{mpsc, watch};

use grid_martingale::config::ConfigWatcher;
use grid_martingale::grid::errors::GridError;
use grid_martingale::grid::ladder::SymbolSpec;
use grid_martingale::grid::reconciler::Reconciler;
use grid_martingale::grid::runner::{GridRunner, RunnerConfig};
use grid_martingale::grid::state::{StateStore, StrategyState};
use grid_martingale::journal::TradeJournal;
use grid_martingale::venue::{
    spawn_kline_stream, BinanceFuturesClient, MAINNET_REST_URL, MAINNET_WS_URL, TESTNET_REST_URL,
    TESTNET_WS_URL,
};

struct Args {
    config_path: String,
    symbol: String,
    price_tick: f64,
    qty_step: f64,
    state_path: String,
    journal_path: String,
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = env::args().collect();
    let mut config_path = None;
    let mut symbol = None;
    let mut price_tick = None;
    let mut qty_step = None;
    let mut state_path = None;
    let mut journal_path = None;

    let mut i = 1;
    while i + 1 < argv.len() {
        match argv[i].as_str() {
            "--config" => config_path = Some(argv[i + 1].clone()),
            "--symbol" => symbol = Some(argv[i + 1].clone()),
            "--price-tick" => price_tick = argv[i + 1].parse().ok(),
            "--qty-step" => qty_step = argv[i + 1].parse().ok(),
            "--state" => state_path = Some(argv[i + 1].clone()),
            "--journal" => journal_path = Some(argv[i + 1].clone()),
            other => return Err(format!("unknown argument {other}")),
        }
        i += 2;
    }

    let symbol = symbol.ok_or("missing --symbol")?;
    let lower = symbol.to_lowercase();
    Ok(Args {
        config_path: config_path.ok_or("missing --config")?,
        price_tick: price_tick.ok_or("missing or invalid --price-tick")?,
        qty_step: qty_step.ok_or("missing or invalid --qty-step")?,
        state_path: state_path.unwrap_or_else(|| format!("state/state_{lower}.json")),
        journal_path: journal_path.unwrap_or_else(|| format!("trades/trades_{lower}.csv")),
        symbol,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("loaded environment from {}", path.display()),
        Err(_) => info!("no .env file, using process environment"),
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            error!("argument error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), GridError> {
    let api_key = env::var("BINANCE_API_KEY")
        .map_err(|_| GridError::InvalidConfig("BINANCE_API_KEY not set".into()))?;
    let api_secret = env::var("BINANCE_API_SECRET")
        .map_err(|_| GridError::InvalidConfig("BINANCE_API_SECRET not set".into()))?;
    let testnet = env::var("USE_TESTNET")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let (rest_url, ws_url) = if testnet {
        info!("using TESTNET endpoints");
        (TESTNET_REST_URL, TESTNET_WS_URL)
    } else {
        (MAINNET_REST_URL, MAINNET_WS_URL)
    };

    let watcher = ConfigWatcher::load(&args.config_path)?;
    let params = watcher.snapshot();
    info!(
        "{}: direction={:?}, levels={}, capital={}",
        args.symbol, params.trade_direction, params.max_entry_level, params.initial_capital
    );

    let spec = SymbolSpec::new(args.symbol.clone(), args.price_tick, args.qty_step);

    let store = StateStore::new(&args.state_path);
    let state = match store.load()? {
        Some(state) => {
            info!(
                "resuming from snapshot: side={:?} level={} capital={:.2}",
                state.position_side, state.current_level, state.capital
            );
            state
        }
        None => {
            info!("no snapshot, starting fresh");
            StrategyState::new(params.initial_capital)
        }
    };

    let journal = TradeJournal::open(&args.journal_path, &args.symbol)?;
    let venue = Arc::new(
        BinanceFuturesClient::new(rest_url, api_key, api_secret).map_err(GridError::Venue)?,
    );

    let reconciler = Reconciler::new(spec, venue, store, journal, state);
    let mut runner = GridRunner::new(reconciler, watcher, RunnerConfig::default());

    let (kline_tx, kline_rx) = mpsc::channel(64);
    let stream_task = spawn_kline_stream(ws_url.to_string(), args.symbol.clone(), kline_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = shutdown_tx.send(true);
    });

    let result = runner.run(kline_rx, shutdown_rx).await;
    stream_task.abort();
    result
}
