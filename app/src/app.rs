use crate::chaos::ChaosSupervisor;
use crate::config::{
    CategoryChances, ChaosConfig, ConfigError, InjectorLimits, Validate, DEFAULT_AMPLIFICATION,
    DEFAULT_HIGH_CPU_CHANCE, DEFAULT_MEMORY_LEAK_CHANCE, DEFAULT_NETWORK_DELAY_CHANCE,
    DEFAULT_RESOURCE_EXHAUSTION_CHANCE,
};
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

pub fn parse_secs(s: &str) -> Result<Duration, ConfigError> {
    let secs = s.parse::<u64>().map_err(|err| ConfigError::ParseError {
        reason: format!("invalid number of seconds '{s}': {err}"),
    })?;
    Ok(Duration::from_secs(secs))
}

#[derive(Parser, Debug)]
#[command(author, about = "Unstable HTTP server that degrades and crashes on purpose", long_about = None)]
pub struct App {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,

    #[arg(long, default_value_t = DEFAULT_HIGH_CPU_CHANCE)]
    pub high_cpu_chance: f64,

    #[arg(long, default_value_t = DEFAULT_MEMORY_LEAK_CHANCE)]
    pub memory_leak_chance: f64,

    #[arg(long, default_value_t = DEFAULT_NETWORK_DELAY_CHANCE)]
    pub network_delay_chance: f64,

    #[arg(long, default_value_t = DEFAULT_RESOURCE_EXHAUSTION_CHANCE)]
    pub resource_exhaustion_chance: f64,

    /// Time for a category to reach full intensity
    #[arg(long = "buildup-secs", value_parser = parse_secs, default_value = "2100")]
    pub buildup_duration: Duration,

    /// Extra time after the buildup before the server may crash
    #[arg(long = "crash-window-secs", value_parser = parse_secs, default_value = "600")]
    pub crash_window: Duration,

    #[arg(long = "initial-delay-min-secs", value_parser = parse_secs, default_value = "0")]
    pub initial_delay_min: Duration,

    #[arg(long = "initial-delay-max-secs", value_parser = parse_secs, default_value = "300")]
    pub initial_delay_max: Duration,

    #[arg(long = "tick-interval-secs", value_parser = parse_secs, default_value = "5")]
    pub tick_interval: Duration,

    #[arg(long = "stabilization-secs", value_parser = parse_secs, default_value = "10")]
    pub stabilization_delay: Duration,

    #[arg(long = "restart-pause-secs", value_parser = parse_secs, default_value = "2")]
    pub restart_pause: Duration,

    /// Multiplier applied to a base chance once the buildup is complete
    #[arg(long, default_value_t = DEFAULT_AMPLIFICATION)]
    pub amplification: f64,

    /// Seed for reproducible chaos
    #[arg(long, env = "CHAOS_SEED")]
    pub seed: Option<u64>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    pub fn chaos_config(&self) -> ChaosConfig {
        ChaosConfig {
            chances: CategoryChances::new(
                self.high_cpu_chance,
                self.memory_leak_chance,
                self.network_delay_chance,
                self.resource_exhaustion_chance,
            ),
            buildup_duration: self.buildup_duration,
            crash_window: self.crash_window,
            initial_delay_min: self.initial_delay_min,
            initial_delay_max: self.initial_delay_max,
            tick_interval: self.tick_interval,
            stabilization_delay: self.stabilization_delay,
            restart_pause: self.restart_pause,
            amplification: self.amplification,
            limits: InjectorLimits::default(),
            seed: self.seed,
        }
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("unstable_server={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    async fn execute(self) -> Result<()> {
        let config = self.chaos_config();
        config.validate().map_err(crate::error::Error::from)?;

        let supervisor = Arc::new(ChaosSupervisor::new(config));
        info!(
            config = ?supervisor.config(),
            "Initial delay: {:?}",
            supervisor.initial_delay()
        );

        if let Some(port) = self.metrics_port {
            crate::metrics::start_server(port)
                .await
                .map_err(crate::error::Error::from)?;
        }

        let (_addr, serve) = crate::server::bind(supervisor, self.port)?;
        serve.await?;

        Ok(())
    }
}

// async code taken from reth, when we add more complexity we should adopt
// the task manager logic to handle thread spawning and graceful shutdown
pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}
