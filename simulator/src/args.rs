use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deterministic retry-workflow simulator")]
pub(crate) struct Args {
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 4)]
    pub(crate) max_attempts: u32,
    #[arg(long, default_value_t = 3)]
    pub(crate) queries_per_tx: usize,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) transient_rate: f64,
    #[arg(long, default_value_t = 0.005)]
    pub(crate) query_error_rate: f64,
    #[arg(long, default_value_t = 0.002)]
    pub(crate) io_rate: f64,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) duration_ms: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) seed: u64,
    pub(crate) max_attempts: u32,
    pub(crate) queries_per_tx: usize,
    pub(crate) transient_rate: f64,
    pub(crate) query_error_rate: f64,
    pub(crate) io_rate: f64,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
    pub(crate) first_steps: usize,
    pub(crate) tail_steps: usize,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let mut config = SimConfig {
            duration_ms: args
                .duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            iterations: args.iterations,
            seed: args.seed.unwrap_or_else(random_seed),
            max_attempts: args.max_attempts.max(1),
            queries_per_tx: args.queries_per_tx.max(1),
            transient_rate: clamp_rate(args.transient_rate),
            query_error_rate: clamp_rate(args.query_error_rate),
            io_rate: clamp_rate(args.io_rate),
            log: args.log,
            preset: None,
            first_steps: 30,
            tail_steps: 80,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }
        if config.iterations.is_none() && config.duration_ms.is_none() {
            config.iterations = Some(1_000);
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = Some(2_000);
        self.duration_ms = None;
        self.max_attempts = 3;
        self.queries_per_tx = 2;
        self.transient_rate = 0.05;
        self.query_error_rate = 0.005;
        self.io_rate = 0.001;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = Some(100_000);
        self.duration_ms = None;
        self.max_attempts = 5;
        self.queries_per_tx = 6;
        self.transient_rate = 0.15;
        self.query_error_rate = 0.01;
        self.io_rate = 0.005;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_limits_bounds() {
        assert_eq!(clamp_rate(-1.0), 0.0);
        assert_eq!(clamp_rate(2.0), 1.0);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
        assert_eq!(clamp_rate(0.5), 0.5);
    }

    #[test]
    fn stress_preset_overrides_flags() {
        let args = Args::parse_from(["simulator", "--stress", "--max-attempts", "1", "--seed", "9"]);
        let config = SimConfig::from_args(args);
        assert_eq!(config.preset.as_deref(), Some("stress"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.seed, 9);
    }
}
