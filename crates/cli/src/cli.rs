//! CLI wiring for gemmtune.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fastrand::Rng;
use gemmtune_autotune::Tuner;
use gemmtune_backend_gpu::{DeviceBuffers, Engine, SimDevice, DEFAULT_ALPHA, DEFAULT_BETA};
use gemmtune_kernels::{DeviceInfo, Geometry, HyperParams, Mem, Offsets};
use gemmtune_optimizer::{Acceptance, Constraints, DefaultOracle, FindParams, Halt};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gemmtune", about = "GEMM kernel autotuner")]
pub struct Cli {
    /// Simulated device family.
    #[arg(long, value_enum, default_value = "warp32")]
    pub device: DeviceArg,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Copy C on the device and write to the copy.
    #[arg(long, default_value_t = false)]
    pub c_is_const: bool,

    #[arg(long, default_value_t = DEFAULT_ALPHA)]
    pub alpha: f64,

    #[arg(long, default_value_t = DEFAULT_BETA)]
    pub beta: f64,

    /// Relative jitter of simulated kernel times.
    #[arg(long, default_value_t = 0.02)]
    pub noise: f64,

    /// Simulated peak throughput, GFLOP/s.
    #[arg(long, default_value_t = 10_000.0)]
    pub peak_gflops: f64,

    /// Simulated global memory bandwidth, GB/s.
    #[arg(long, default_value_t = 500.0)]
    pub bandwidth_gbps: f64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum DeviceArg {
    Warp32,
    Wavefront64,
}

impl DeviceArg {
    fn info(&self) -> DeviceInfo {
        match self {
            DeviceArg::Warp32 => DeviceInfo::warp32("sim-warp32"),
            DeviceArg::Wavefront64 => DeviceInfo::wavefront64("sim-wavefront64"),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search for the fastest kernel configuration of one GEMM.
    Find {
        /// e.g. tC0_tA0_tB0_colMaj1_m1024_n1024_k1024_lda1024_ldb1024_ldc1024_ws0_f32
        #[arg(long)]
        geometry: String,
        /// e.g. A_WOS0__B_WOS0__C_ICE1, optionally followed by ___ and start pins.
        #[arg(long, default_value = "")]
        constraints: String,
        /// JSON FindParams; otherwise defaults overlaid with GEMMTUNE_* variables.
        #[arg(long)]
        params: Option<PathBuf>,
        #[arg(long, conflicts_with = "seconds")]
        restarts: Option<usize>,
        #[arg(long)]
        seconds: Option<f64>,
        #[arg(long)]
        core_runs: Option<usize>,
        /// Reject ties with the best time so far.
        #[arg(long, default_value_t = false)]
        strict: bool,
        /// Write the best solution as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Benchmark one hyper-parameter point.
    Bench {
        #[arg(long)]
        geometry: String,
        #[arg(long)]
        hp: String,
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}

/// Simulated device and scalars shared by both subcommands.
struct EngineArgs {
    device: DeviceArg,
    seed: u64,
    c_is_const: bool,
    alpha: f64,
    beta: f64,
    noise: f64,
    peak_gflops: f64,
    bandwidth_gbps: f64,
}

impl EngineArgs {
    fn engine(&self, geometry: Geometry) -> Result<Engine<SimDevice>> {
        let mut device = SimDevice::new(self.device.info(), self.seed)
            .with_noise(self.noise)
            .with_throughput(self.peak_gflops, self.bandwidth_gbps);
        let buffers = DeviceBuffers {
            a: device.allocate(geometry.mem_size_bytes(Mem::A)),
            b: device.allocate(geometry.mem_size_bytes(Mem::B)),
            c: device.allocate(geometry.mem_size_bytes(Mem::C)),
            workspace: (geometry.workspace_size > 0).then(|| device.allocate(geometry.workspace_size)),
        };
        let engine = Engine::new(device, geometry, Offsets::zero(), buffers, self.c_is_const)?;
        Ok(engine.with_scalars(self.alpha, self.beta))
    }
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli {
        device,
        seed,
        c_is_const,
        alpha,
        beta,
        noise,
        peak_gflops,
        bandwidth_gbps,
        command,
    } = cli;
    let engine_args = EngineArgs {
        device,
        seed,
        c_is_const,
        alpha,
        beta,
        noise,
        peak_gflops,
        bandwidth_gbps,
    };

    match command {
        Command::Find {
            geometry,
            constraints,
            params,
            restarts,
            seconds,
            core_runs,
            strict,
            output,
        } => {
            let geometry: Geometry = geometry.parse().context("parsing --geometry")?;
            let constraints: Constraints = constraints.parse().context("parsing --constraints")?;
            let mut fparams = match params {
                Some(path) => FindParams::load(&path)
                    .with_context(|| format!("loading find params from {}", path.display()))?,
                None => FindParams::from_env()?,
            };
            if let Some(n) = restarts {
                fparams.hl_outer = FindParams::at_least_n_restarts(n).hl_outer;
            }
            if let Some(s) = seconds {
                fparams.hl_outer = FindParams::at_least_n_seconds(s).hl_outer;
            }
            if let Some(n) = core_runs {
                fparams.hl_core = Halt::runs(n);
            }
            if strict {
                fparams.acceptance = Acceptance::Strict;
            }

            let mut tuner = Tuner::new(engine_args.engine(geometry)?, DefaultOracle);
            let mut rng = Rng::with_seed(seed);
            let report = tuner.find_with_report(&constraints, &fparams, &mut rng)?;
            info!(
                descents = report.descents.len(),
                gflops = format_args!("{:.2}", report.best.statistics.gflops),
                "find completed"
            );

            println!("{}", report.tracker);
            println!("{}", report.best.cache_entry_string());
            if let Some(path) = output {
                report.best.save(&path)?;
                info!(path = %path.display(), "solution written");
            }
        }
        Command::Bench { geometry, hp, runs } => {
            let geometry: Geometry = geometry.parse().context("parsing --geometry")?;
            let hp: HyperParams = hp.parse().context("parsing --hp")?;
            let gflops_of = |t: f64| geometry.gflops(t);
            let mut tuner = Tuner::new(engine_args.engine(geometry.clone())?, DefaultOracle);
            let times = tuner.benchgemm(&hp, &Halt::runs(runs))?;
            for (i, t) in times.iter().enumerate() {
                println!("run {i}: {t:.4} ms  {:.2} GFLOP/s", gflops_of(*t));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_arguments_parse() {
        let cli = Cli::try_parse_from([
            "gemmtune",
            "--seed",
            "7",
            "find",
            "--geometry",
            "tC0_tA0_tB0_colMaj1_m64_n64_k64_lda64_ldb64_ldc64_ws0_f32",
            "--restarts",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.seed, 7);
        match cli.command {
            Command::Find { restarts, constraints, .. } => {
                assert_eq!(restarts, Some(3));
                assert!(constraints.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_scalars_and_device_options_parse() {
        let cli = Cli::try_parse_from([
            "gemmtune", "--alpha", "2", "--beta", "0", "--noise", "0", "bench", "--geometry", "g", "--hp", "h",
        ])
        .unwrap();
        assert_eq!((cli.alpha, cli.beta, cli.noise), (2.0, 0.0, 0.0));
        assert_eq!(cli.peak_gflops, 10_000.0);
    }

    #[test]
    fn test_restarts_conflict_with_seconds() {
        let parsed = Cli::try_parse_from([
            "gemmtune", "find", "--geometry", "g", "--restarts", "2", "--seconds", "1",
        ]);
        assert!(parsed.is_err());
    }
}
