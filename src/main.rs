extern crate clap;
extern crate pbr;

use clap::{Args, Parser, Subcommand};
use grid_nmf::error::NmfError;
use grid_nmf::matrix::*;
use grid_nmf::multiplicative_update::UpdateRule;
use grid_nmf::nmf_parallel::*;
use grid_nmf::nmf_serial::*;
use grid_nmf::util::*;
use pbr::ProgressBar;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone)]
#[clap(author = clap::crate_authors!(", "))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Non-negative matrix factorization over a grid of message-passing workers")]
#[clap(color = clap::ColorChoice::Auto)]
#[clap(propagate_version = true)]
#[clap(subcommand_required = true)]
#[clap(arg_required_else_help = true)]
pub struct GridNmfCli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// factorize with one worker per grid cell
    Parallel {
        #[clap(flatten)]
        problem: ProblemArgs,
        #[clap(flatten)]
        grid: GridArgs,
        /// bound on each wait for peers in milliseconds, 0 to wait forever
        #[clap(long, default_value_t = 60000)]
        timeout_ms: u64,
        /// compute ‖A − W·H‖ after every iteration
        #[clap(long)]
        residual_trace: bool,
    },
    /// factorize on a single thread
    Serial {
        #[clap(flatten)]
        problem: ProblemArgs,
        /// `frobenius` or `kullback-leibler`
        #[clap(long, default_value_t = String::from("frobenius"))]
        update_rule: String,
        /// compute ‖A − W·H‖ after every iteration
        #[clap(long)]
        residual_trace: bool,
    },
    /// time repeated parallel runs with increasing seeds
    Benchmark {
        #[clap(flatten)]
        problem: ProblemArgs,
        #[clap(flatten)]
        grid: GridArgs,
        /// number of runs
        #[clap(short = 'r', long, default_value_t = 10)]
        total_rounds: usize,
        /// write one JSON line per run into this file
        #[clap(long)]
        benchmark_profiler_output: Option<String>,
    },
}

#[derive(Args, Clone)]
struct ProblemArgs {
    /// rows of A
    #[clap(value_parser)]
    m: usize,
    /// columns of A
    #[clap(value_parser)]
    n: usize,
    /// factorization rank
    #[clap(value_parser)]
    k: usize,
    #[clap(long, default_value_t = 100)]
    max_iter: usize,
    #[clap(long, default_value_t = 0)]
    seed: u64,
    #[clap(long, default_value_t = 1e-16)]
    epsilon: f64,
    /// JSON file holding A as a list of rows; A[i][j] = i·n + j when absent
    #[clap(short = 'i', long)]
    input: Option<String>,
    /// write W, H and the residuals to this JSON file
    #[clap(short = 'o', long)]
    output: Option<String>,
}

#[derive(Args, Clone)]
struct GridArgs {
    /// p_r
    #[clap(long, default_value_t = 1)]
    grid_rows: usize,
    /// p_c
    #[clap(long, default_value_t = 1)]
    grid_cols: usize,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Nmf(#[from] NmfError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProblemArgs {
    fn load_matrix(&self) -> Result<Matrix, CliError> {
        match self.input.as_ref() {
            Some(filename) => {
                let rows: Vec<Vec<f64>> = serde_json::from_str(&std::fs::read_to_string(filename)?)?;
                let a = from_rows(&rows)?;
                if a.dim() != (self.m, self.n) {
                    return Err(NmfError::InvalidInput(format!(
                        "{filename} holds a {:?} matrix, expected {}x{}",
                        a.dim(),
                        self.m,
                        self.n
                    ))
                    .into());
                }
                Ok(a)
            }
            None => Ok(ramp_matrix(self.m, self.n)),
        }
    }

    fn write_result(&self, result: &NmfResult) -> Result<(), CliError> {
        let value = json!({
            "w": to_rows(&result.w),
            "h": to_rows(&result.h),
            "residuals": result.residuals,
        });
        match self.output.as_ref() {
            Some(filename) => std::fs::write(filename, value.to_string())?,
            None => println!("residual: {:e}", result.final_residual().unwrap_or_default()),
        }
        Ok(())
    }

    fn shape(&self) -> ProblemShape {
        ProblemShape::new(self.m, self.n, self.k)
    }
}

impl GridNmfCli {
    fn run(self) -> Result<(), CliError> {
        match self.command {
            Commands::Parallel {
                problem,
                grid,
                timeout_ms,
                residual_trace,
            } => {
                let config: NmfParallelConfig = serde_json::from_value(json!({
                    "max_iter": problem.max_iter,
                    "seed": problem.seed,
                    "epsilon": problem.epsilon,
                    "timeout_ms": if timeout_ms == 0 { None } else { Some(timeout_ms) },
                    "residual_trace": residual_trace,
                }))?;
                let grid = ProcessGrid::new(grid.grid_rows, grid.grid_cols)?;
                let solver = NmfParallel::new(problem.load_matrix()?, problem.shape(), grid, config)?;
                let result = solver.solve_seeded()?;
                problem.write_result(&result)
            }
            Commands::Serial {
                problem,
                update_rule,
                residual_trace,
            } => {
                let update_rule: UpdateRule = serde_json::from_value(json!(update_rule))?;
                let config: NmfSerialConfig = serde_json::from_value(json!({
                    "max_iter": problem.max_iter,
                    "seed": problem.seed,
                    "epsilon": problem.epsilon,
                    "update_rule": update_rule,
                    "residual_trace": residual_trace,
                }))?;
                let solver = NmfSerial::new(problem.load_matrix()?, problem.k, config)?;
                let result = solver.solve_seeded()?;
                problem.write_result(&result)
            }
            Commands::Benchmark {
                problem,
                grid,
                total_rounds,
                benchmark_profiler_output,
            } => {
                let grid = ProcessGrid::new(grid.grid_rows, grid.grid_cols)?;
                let shape = problem.shape();
                let mut config = NmfParallelConfig::default();
                config.max_iter = problem.max_iter;
                config.epsilon = problem.epsilon;
                let mut solver = NmfParallel::new(problem.load_matrix()?, shape, grid, config)?;
                let mut benchmark_profiler = BenchmarkProfiler::new(
                    problem.max_iter,
                    benchmark_profiler_output.map(|filename| (filename, &shape, &grid)),
                )?;
                let mut pb = ProgressBar::on(std::io::stderr(), total_rounds as u64);
                for round in 0..total_rounds {
                    pb.set(round as u64);
                    let seed = problem.seed + round as u64;
                    solver.config.seed = seed;
                    benchmark_profiler.begin(seed);
                    let result = solver.solve_seeded()?;
                    benchmark_profiler.end(result.final_residual().unwrap_or_default())?;
                    pb.message(format!("{} ", benchmark_profiler.brief()).as_str());
                }
                pb.finish();
                println!();
                info!("{}", benchmark_profiler.brief());
                println!("{}", benchmark_profiler.brief());
                Ok(())
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = GridNmfCli::parse().run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
