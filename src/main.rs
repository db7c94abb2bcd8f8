use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burstgate::config::BurstgateConfig;
use burstgate::ratelimit::{Clock, ManualClock, RateLimiter, RateProfile};

/// Inspect and exercise Burstgate rate limit configuration.
#[derive(Parser)]
#[command(name = "burstgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then list its policies
    Validate,
    /// Replay a request schedule against a simulated clock
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Target identity to limit
    #[arg(long, default_value = "client")]
    target: String,

    /// Named policy from the configuration
    #[arg(long, conflicts_with = "tiers")]
    policy: Option<String>,

    /// Tier as RATE:CAPACITY, repeatable
    #[arg(long = "tier", value_parser = parse_tier)]
    tiers: Vec<RateProfile>,

    /// Precharge in seconds; defaults to the policy or configured default
    #[arg(long)]
    precharge: Option<f64>,

    /// Permits per request
    #[arg(long, default_value_t = 1)]
    permits: u32,

    /// Number of requests to send
    #[arg(long, default_value_t = 20)]
    requests: u32,

    /// Simulated time between requests
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Charge tiers only when all of them admit the request
    #[arg(long)]
    all_or_nothing: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Decision {
    request: u32,
    at_ms: f64,
    accepted: bool,
}

#[derive(Serialize)]
struct SimulationReport {
    target: String,
    tiers: Vec<RateProfile>,
    precharge_secs: f64,
    accepted: usize,
    rejected: usize,
    decisions: Vec<Decision>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = BurstgateConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Simulate(args) => simulate(&config, args),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(config: &BurstgateConfig) -> anyhow::Result<()> {
    config.validate()?;
    let policies = config.policy_set()?;

    println!(
        "limiter: enabled={} max_targets_per_profile={} default_precharge_secs={}",
        config.limiter.enabled,
        config.limiter.max_targets_per_profile,
        config.limiter.default_precharge_secs
    );
    for name in policies.names() {
        let policy = policies.get(name)?;
        let tiers: Vec<String> = policy
            .profiles()?
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "policy {}: precharge={}s tiers=[{}]",
            name,
            policy.precharge_or(config.limiter.default_precharge_secs),
            tiers.join(", ")
        );
    }
    info!(policies = policies.len(), "Configuration is valid");
    Ok(())
}

fn simulate(config: &BurstgateConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let default_precharge = config.limiter.default_precharge_secs;
    let (tiers, precharge_secs) = match &args.policy {
        Some(name) => {
            let policies = config.policy_set()?;
            let policy = policies.get(name)?;
            let precharge = args
                .precharge
                .unwrap_or_else(|| policy.precharge_or(default_precharge));
            (policy.profiles()?, precharge)
        }
        None => {
            if args.tiers.is_empty() {
                bail!("either --policy or at least one --tier is required");
            }
            (args.tiers.clone(), args.precharge.unwrap_or(default_precharge))
        }
    };

    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::from_settings(&config.limiter, clock.clone());
    let step = Duration::from_millis(args.interval_ms);

    let mut decisions = Vec::with_capacity(args.requests as usize);
    for request in 0..args.requests {
        let at_ms = clock.now_micros() as f64 / 1_000.0;
        let accepted = if args.all_or_nothing {
            limiter.try_acquire_all(&args.target, args.permits, precharge_secs, &tiers)?
        } else {
            limiter.try_acquire_profiles(&args.target, args.permits, precharge_secs, &tiers)?
        };
        decisions.push(Decision {
            request,
            at_ms,
            accepted,
        });
        clock.advance_by(step);
    }

    let accepted = decisions.iter().filter(|d| d.accepted).count();
    let report = SimulationReport {
        target: args.target,
        tiers,
        precharge_secs,
        accepted,
        rejected: decisions.len() - accepted,
        decisions,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let tiers: Vec<String> = report.tiers.iter().map(ToString::to_string).collect();
    println!(
        "target={} tiers=[{}] precharge={}s",
        report.target,
        tiers.join(", "),
        report.precharge_secs
    );
    for decision in &report.decisions {
        println!(
            "#{:<4} t={:>10.3}ms {}",
            decision.request,
            decision.at_ms,
            if decision.accepted { "accept" } else { "reject" }
        );
    }
    println!("accepted={} rejected={}", report.accepted, report.rejected);
}

fn parse_tier(value: &str) -> Result<RateProfile, String> {
    let (rate, capacity) = value
        .split_once(':')
        .ok_or_else(|| format!("expected RATE:CAPACITY, got '{}'", value))?;
    let rate: f64 = rate
        .trim()
        .parse()
        .map_err(|e| format!("invalid rate '{}': {}", rate, e))?;
    let capacity: f64 = capacity
        .trim()
        .parse()
        .map_err(|e| format!("invalid capacity '{}': {}", capacity, e))?;
    RateProfile::new(rate, capacity).map_err(|e| e.to_string())
}
