//! Parallel NMF
//!
//! Every worker of a p_r x p_c grid owns one block of A and one block of each factor, and moves through
//! a fixed sequence of local products and collectives. The coordinator only slices the input, runs the
//! workers on a thread pool and glues the returned blocks back together.
//!
//! One iteration, for worker (i, j):
//! - W phase: G_H = AllReduce(Hji·Hjiᵗ), Hj = AllGather-column(Hji), P_H = ReduceScatter-row(Aij·Hjᵗ),
//!   then Wij ← Wij ⊙ P_H / max(Wij·G_H, eps)
//! - H phase: G_W = AllReduce(Wijᵗ·Wij), Wi = AllGather-row(Wij), P_W = ReduceScatter-column(Wiᵗ·Aij),
//!   then Hji ← Hji ⊙ P_W / max(G_W·Hji, eps)
//!

use super::collective::*;
use super::error::*;
use super::mailbox::*;
use super::matrix::*;
use super::multiplicative_update::*;
use super::nmf_serial::{check_epsilon, check_input_matrix, initial_factors, NmfResult};
use super::util::*;
use crate::derivative::Derivative;
use crate::rayon;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NmfParallelConfig {
    /// number of full iterations, each updating W and then H
    #[serde(default = "nmf_parallel_default_configs::max_iter")]
    pub max_iter: usize,
    /// seed of the global initial factors
    #[serde(default = "nmf_parallel_default_configs::seed")]
    pub seed: u64,
    /// floor of every denominator in the update rules
    #[serde(default = "nmf_parallel_default_configs::epsilon")]
    pub epsilon: f64,
    /// bound on each wait inside a collective, in milliseconds; `null` waits forever
    #[serde(default = "nmf_parallel_default_configs::timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// one more gather and reduce per iteration so that every worker knows ‖A − W·H‖_F
    #[serde(default = "nmf_parallel_default_configs::residual_trace")]
    pub residual_trace: bool,
}

pub mod nmf_parallel_default_configs {
    pub fn max_iter() -> usize {
        100
    }
    pub fn seed() -> u64 {
        0
    }
    pub fn epsilon() -> f64 {
        1e-16
    }
    pub fn timeout_ms() -> Option<u64> {
        Some(60_000)
    }
    pub fn residual_trace() -> bool {
        false
    }
}

impl Default for NmfParallelConfig {
    fn default() -> Self {
        serde_json::from_value(json!({})).unwrap()
    }
}

impl NmfParallelConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// where a worker stands within an iteration; each state carries what the next step consumes
#[derive(Debug, Clone)]
pub enum WorkerState {
    Init,
    ComputeU,
    AllReduceH { u: Matrix },
    AllGatherH { gram_h: Matrix },
    ComputeV { gram_h: Matrix, h_column: Matrix },
    ReduceScatterV { gram_h: Matrix, v: Matrix },
    UpdateW { gram_h: Matrix, p_h: Matrix },
    ComputeX,
    AllReduceW { x: Matrix },
    AllGatherW { gram_w: Matrix },
    ComputeY { gram_w: Matrix, w_row: Matrix },
    ReduceScatterY { gram_w: Matrix, y: Matrix },
    UpdateH { gram_w: Matrix, p_w: Matrix },
    Residual,
    Done,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::ComputeU => "ComputeU",
            Self::AllReduceH { .. } => "AllReduceH",
            Self::AllGatherH { .. } => "AllGatherH",
            Self::ComputeV { .. } => "ComputeV",
            Self::ReduceScatterV { .. } => "ReduceScatterV",
            Self::UpdateW { .. } => "UpdateW",
            Self::ComputeX => "ComputeX",
            Self::AllReduceW { .. } => "AllReduceW",
            Self::AllGatherW { .. } => "AllGatherW",
            Self::ComputeY { .. } => "ComputeY",
            Self::ReduceScatterY { .. } => "ReduceScatterY",
            Self::UpdateH { .. } => "UpdateH",
            Self::Residual => "Residual",
            Self::Done => "Done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// what a worker hands back to the coordinator
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub node: NodeIndex,
    /// Wij, (m/p) x k
    pub w: Matrix,
    /// Hji, k x (n/p)
    pub h: Matrix,
    /// ‖A − W·H‖_F after each iteration, empty unless tracing
    pub residuals: Vec<f64>,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Worker {
    pub node: NodeIndex,
    layout: BlockLayout,
    communicator: Communicator,
    /// Aij, never modified
    #[derivative(Debug = "ignore")]
    a: Matrix,
    /// Wij
    #[derivative(Debug = "ignore")]
    w: Matrix,
    /// Hji
    #[derivative(Debug = "ignore")]
    h: Matrix,
    #[derivative(Debug(format_with = "fmt_state_name"))]
    state: WorkerState,
    /// iterations completed so far
    iteration: usize,
    max_iter: usize,
    epsilon: f64,
    residual_trace: bool,
    residuals: Vec<f64>,
}

fn fmt_state_name(state: &WorkerState, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
    formatter.write_str(state.name())
}

impl Worker {
    pub fn new(
        layout: BlockLayout,
        communicator: Communicator,
        a: Matrix,
        w: Matrix,
        h: Matrix,
        config: &NmfParallelConfig,
    ) -> Self {
        Self {
            node: communicator.node(),
            layout,
            communicator,
            a,
            w,
            h,
            state: WorkerState::Init,
            iteration: 0,
            max_iter: config.max_iter,
            epsilon: config.epsilon,
            residual_trace: config.residual_trace,
            residuals: Vec::with_capacity(if config.residual_trace { config.max_iter } else { 0 }),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// run every remaining state; on failure the peers are told before the error is returned
    pub fn run(mut self) -> Result<WorkerOutput, NmfError> {
        while !self.state.is_done() {
            let state = self.state.name();
            if let Err(err) = self.step() {
                if !err.is_secondary() {
                    error!(node = self.node, state, iteration = self.iteration, "{err}");
                }
                self.communicator.abort();
                return Err(err);
            }
        }
        Ok(WorkerOutput {
            node: self.node,
            w: self.w,
            h: self.h,
            residuals: self.residuals,
        })
    }

    /// where to go once both factors have been updated
    fn next_iteration(&mut self) -> WorkerState {
        self.iteration += 1;
        debug!(node = self.node, iteration = self.iteration, round = self.communicator.round(), "iteration done");
        if self.iteration < self.max_iter {
            WorkerState::ComputeU
        } else {
            WorkerState::Done
        }
    }

    /// execute the current state and move to the next one
    pub fn step(&mut self) -> Result<(), NmfError> {
        let state = std::mem::replace(&mut self.state, WorkerState::Done);
        self.state = match state {
            WorkerState::Init => {
                let k = self.layout.shape.k;
                let node = self.node;
                ensure_shape("init", 0, Some(node), &self.a, (self.layout.a_block_rows(), self.layout.a_block_cols()))?;
                ensure_shape("init", 0, Some(node), &self.w, (self.layout.w_block_rows(), k))?;
                ensure_shape("init", 0, Some(node), &self.h, (k, self.layout.h_block_cols()))?;
                if self.max_iter == 0 {
                    WorkerState::Done
                } else {
                    WorkerState::ComputeU
                }
            }
            // W phase
            WorkerState::ComputeU => WorkerState::AllReduceH {
                u: self.h.dot(&self.h.t()),
            },
            WorkerState::AllReduceH { u } => WorkerState::AllGatherH {
                gram_h: self.communicator.all_reduce(u)?,
            },
            WorkerState::AllGatherH { gram_h } => WorkerState::ComputeV {
                gram_h,
                h_column: self.communicator.all_gather_column(self.h.clone())?,
            },
            WorkerState::ComputeV { gram_h, h_column } => WorkerState::ReduceScatterV {
                gram_h,
                v: self.a.dot(&h_column.t()),
            },
            WorkerState::ReduceScatterV { gram_h, v } => WorkerState::UpdateW {
                gram_h,
                p_h: self.communicator.reduce_scatter_row(v)?,
            },
            WorkerState::UpdateW { gram_h, p_h } => {
                update_w(&mut self.w, &gram_h, &p_h, self.epsilon);
                debug_assert!(is_non_negative(&self.w));
                WorkerState::ComputeX
            }
            // H phase
            WorkerState::ComputeX => WorkerState::AllReduceW {
                x: self.w.t().dot(&self.w),
            },
            WorkerState::AllReduceW { x } => WorkerState::AllGatherW {
                gram_w: self.communicator.all_reduce(x)?,
            },
            WorkerState::AllGatherW { gram_w } => WorkerState::ComputeY {
                gram_w,
                w_row: self.communicator.all_gather_row(self.w.clone())?,
            },
            WorkerState::ComputeY { gram_w, w_row } => WorkerState::ReduceScatterY {
                gram_w,
                y: w_row.t().dot(&self.a),
            },
            WorkerState::ReduceScatterY { gram_w, y } => WorkerState::UpdateH {
                gram_w,
                p_w: self.communicator.reduce_scatter_column(y)?,
            },
            WorkerState::UpdateH { gram_w, p_w } => {
                update_h(&mut self.h, &gram_w, &p_w, self.epsilon);
                debug_assert!(is_non_negative(&self.h));
                if self.residual_trace {
                    WorkerState::Residual
                } else {
                    self.next_iteration()
                }
            }
            WorkerState::Residual => {
                let w_row = self.communicator.all_gather_row(self.w.clone())?;
                let h_column = self.communicator.all_gather_column(self.h.clone())?;
                let local = Matrix::from_elem((1, 1), squared_residual(&self.a, &w_row, &h_column));
                let total = self.communicator.all_reduce(local)?;
                self.residuals.push(total[[0, 0]].sqrt());
                self.next_iteration()
            }
            WorkerState::Done => WorkerState::Done,
        };
        Ok(())
    }
}

/// the first error that is not merely a reaction to another worker's failure
pub fn root_cause(errors: Vec<NmfError>) -> Option<NmfError> {
    let position = errors.iter().position(|err| !err.is_secondary()).unwrap_or(0);
    errors.into_iter().nth(position)
}

type WorkerJob<'a> = Box<dyn FnOnce() -> Result<WorkerOutput, NmfError> + Send + 'a>;

pub struct NmfParallel {
    a: Matrix,
    pub layout: BlockLayout,
    pub config: NmfParallelConfig,
    thread_pool: rayon::ThreadPool,
    event_log: Option<Arc<EventLog>>,
}

impl NmfParallel {
    pub fn new(a: Matrix, shape: ProblemShape, grid: ProcessGrid, config: NmfParallelConfig) -> Result<Self, NmfError> {
        let layout = BlockLayout::new(shape, grid)?;
        check_epsilon(config.epsilon)?;
        if a.dim() != (shape.m, shape.n) {
            return Err(NmfError::InvalidInput(format!(
                "input matrix is {:?}, expected {}x{}",
                a.dim(),
                shape.m,
                shape.n
            )));
        }
        check_input_matrix(&a)?;
        // every worker blocks on its peers, so each needs its own thread
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(grid.node_num() + 1)
            .build()
            .map_err(|err| NmfError::InvalidConfig(format!("cannot build thread pool: {err}")))?;
        Ok(Self {
            a,
            layout,
            config,
            thread_pool,
            event_log: None,
        })
    }

    /// record every send and barrier of later runs into `event_log`
    pub fn with_event_log(mut self, event_log: Arc<EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn a(&self) -> &Matrix {
        &self.a
    }

    pub fn solve_seeded(&self) -> Result<NmfResult, NmfError> {
        let (w0, h0) = initial_factors(&self.layout.shape, self.config.seed);
        self.solve(w0, h0)
    }

    pub fn solve(&self, w0: Matrix, h0: Matrix) -> Result<NmfResult, NmfError> {
        let outputs = self.solve_blocks(w0, h0)?;
        let (w, h) = self.reassemble(&outputs)?;
        let residuals = if self.config.residual_trace {
            outputs[0].residuals.clone()
        } else {
            vec![frobenius_residual(&self.a, &w, &h)]
        };
        info!(residual = residuals.last().copied().unwrap_or_default(), "parallel solve done");
        Ok(NmfResult { w, h, residuals })
    }

    /// run all workers from the given global initial factors and return their final blocks, in worker order
    pub fn solve_blocks(&self, w0: Matrix, h0: Matrix) -> Result<Vec<WorkerOutput>, NmfError> {
        let workers = self.build_workers(&w0, &h0)?;
        let post_office = Arc::clone(workers[0].communicator.post_office());
        let jobs: Vec<WorkerJob> = workers
            .into_iter()
            .map(|worker| Box::new(move || worker.run()) as WorkerJob)
            .collect();
        self.run_jobs(&post_office, jobs)
    }

    /// slice the global factors into one worker per grid cell, all sharing a fresh post office
    fn build_workers(&self, w0: &Matrix, h0: &Matrix) -> Result<Vec<Worker>, NmfError> {
        let ProblemShape { m, n, k } = self.layout.shape;
        let grid = self.layout.grid;
        ensure_shape("solve", 0, None, w0, (m, k))?;
        ensure_shape("solve", 0, None, h0, (k, n))?;
        if !is_non_negative(w0) || !is_non_negative(h0) {
            return Err(NmfError::InvalidInput("initial factors must be non-negative".to_string()));
        }
        info!(m, n, k, rows = grid.rows, cols = grid.cols, max_iter = self.config.max_iter, "parallel solve");
        let communicators = Communicator::new_group(grid, self.config.timeout(), self.event_log.clone());
        Ok(communicators
            .into_iter()
            .map(|communicator| {
                let node = communicator.node();
                let layout = &self.layout;
                Worker::new(
                    *layout,
                    communicator,
                    sub_block(&self.a, layout.a_rows(node), layout.a_cols(node)),
                    row_block(w0, layout.w_rows(node)),
                    column_block(h0, layout.h_cols(node)),
                    &self.config,
                )
            })
            .collect())
    }

    /// run job `i` as worker `i` on the thread pool; a panicking job becomes `WorkerPanicked` and aborts its peers
    fn run_jobs(&self, post_office: &Arc<PostOffice>, jobs: Vec<WorkerJob>) -> Result<Vec<WorkerOutput>, NmfError> {
        let mut slots: Vec<Option<Result<WorkerOutput, NmfError>>> = jobs.iter().map(|_| None).collect();
        self.thread_pool.scope(|scope| {
            for (node, (slot, job)) in slots.iter_mut().zip(jobs).enumerate() {
                scope.spawn(move |_| {
                    *slot = Some(match catch_unwind(AssertUnwindSafe(job)) {
                        Ok(result) => result,
                        Err(_) => {
                            error!(node, "worker panicked");
                            post_office.broadcast_abort(node, 0);
                            Err(NmfError::WorkerPanicked { node })
                        }
                    });
                });
            }
        });
        let mut outputs = Vec::with_capacity(slots.len());
        let mut errors = vec![];
        for (node, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(output)) => outputs.push(output),
                Some(Err(err)) => errors.push(err),
                None => errors.push(NmfError::WorkerPanicked { node }),
            }
        }
        if let Some(err) = root_cause(errors) {
            return Err(err);
        }
        Ok(outputs)
    }

    /// W stacks the blocks in worker order; H places them by their column slot (grid column major)
    pub fn reassemble(&self, outputs: &[WorkerOutput]) -> Result<(Matrix, Matrix), NmfError> {
        let node_num = self.layout.grid.node_num();
        if outputs.len() != node_num || outputs.iter().enumerate().any(|(node, output)| output.node != node) {
            return Err(NmfError::InvalidInput(format!("expected one output per worker 0..{node_num}, in order")));
        }
        let w_blocks: Vec<Matrix> = outputs.iter().map(|output| output.w.clone()).collect();
        let mut by_column: Vec<&WorkerOutput> = outputs.iter().collect();
        by_column.sort_by_key(|output| self.layout.h_cols(output.node).start());
        let h_blocks: Vec<Matrix> = by_column.into_iter().map(|output| output.h.clone()).collect();
        Ok((
            concatenate_rows("reassemble", 0, &w_blocks)?,
            concatenate_columns("reassemble", 0, &h_blocks)?,
        ))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::nmf_serial::*;

    fn traced_config(max_iter: usize) -> NmfParallelConfig {
        serde_json::from_value(json!({
            "max_iter": max_iter,
            "residual_trace": true,
            "timeout_ms": 30000,
        }))
        .unwrap()
    }

    fn small_problem(config: NmfParallelConfig) -> NmfParallel {
        let shape = ProblemShape::new(18, 12, 5);
        let grid = ProcessGrid::new(3, 2).unwrap();
        NmfParallel::new(ramp_matrix(18, 12), shape, grid, config).unwrap()
    }

    #[test]
    fn nmf_parallel_end_to_end() {
        // cargo test nmf_parallel_end_to_end -- --nocapture
        let solver = small_problem(traced_config(100));
        let (w0, h0) = initial_factors(&solver.layout.shape, solver.config.seed);
        let outputs = solver.solve_blocks(w0, h0).unwrap();
        // every worker computed the very same residual trace
        for output in outputs.iter() {
            assert_eq!(output.residuals, outputs[0].residuals);
            assert!(is_non_negative(&output.w) && is_non_negative(&output.h));
        }
        let residuals = &outputs[0].residuals;
        assert_eq!(residuals.len(), 100);
        assert!(residuals[99] < residuals[0], "{} >= {}", residuals[99], residuals[0]);
        let (w, h) = solver.reassemble(&outputs).unwrap();
        assert_eq!(w.dim(), (18, 5));
        assert_eq!(h.dim(), (5, 12));
        assert!((frobenius_residual(solver.a(), &w, &h) - residuals[99]).abs() < 1e-9 * residuals[99].max(1.));
    }

    #[test]
    fn nmf_parallel_deterministic() {
        // cargo test nmf_parallel_deterministic -- --nocapture
        let solver = small_problem(traced_config(20));
        let first = solver.solve_seeded().unwrap();
        let second = solver.solve_seeded().unwrap();
        assert_eq!(first.w, second.w);
        assert_eq!(first.h, second.h);
        assert_eq!(first.residuals, second.residuals);
    }

    #[test]
    fn nmf_parallel_reconstruction_identity() {
        // cargo test nmf_parallel_reconstruction_identity -- --nocapture
        let solver = small_problem(traced_config(5));
        let (w0, h0) = initial_factors(&solver.layout.shape, 1);
        let outputs = solver.solve_blocks(w0, h0).unwrap();
        let (w, h) = solver.reassemble(&outputs).unwrap();
        for output in outputs.iter() {
            let layout = &solver.layout;
            assert_eq!(row_block(&w, layout.w_rows(output.node)), output.w);
            assert_eq!(column_block(&h, layout.h_cols(output.node)), output.h);
        }
        // seams: worker (1, 0) owns H columns [2, 4) and worker (0, 1) owns [6, 8)
        assert_eq!(h[[0, 2]], outputs[2].h[[0, 0]]);
        assert_eq!(h[[4, 7]], outputs[1].h[[4, 1]]);
        assert_eq!(w[[17, 4]], outputs[5].w[[2, 4]]);
    }

    #[test]
    fn nmf_parallel_matches_serial() {
        // cargo test nmf_parallel_matches_serial -- --nocapture
        for (rows, cols) in [(3, 2), (1, 1), (2, 3)] {
            let grid = ProcessGrid::new(rows, cols).unwrap();
            let shape = ProblemShape::new(18, 12, 4);
            let a = ramp_matrix(18, 12);
            let parallel = NmfParallel::new(a.clone(), shape, grid, traced_config(30)).unwrap();
            let serial_config: NmfSerialConfig = serde_json::from_value(json!({
                "max_iter": 30,
                "residual_trace": true,
            }))
            .unwrap();
            let serial = NmfSerial::new(a, 4, serial_config).unwrap();
            let expected = serial.solve_seeded().unwrap();
            let result = parallel.solve_seeded().unwrap();
            for (x, y) in result.w.iter().zip(expected.w.iter()).chain(result.h.iter().zip(expected.h.iter())) {
                assert!((x - y).abs() <= 1e-8 * y.abs().max(1.), "{rows}x{cols} grid: {x} != {y}");
            }
            for (x, y) in result.residuals.iter().zip(expected.residuals.iter()) {
                assert!((x - y).abs() <= 1e-8 * y.max(1.));
            }
        }
    }

    /// replay the log of a whole run: nobody passed a barrier before everyone signalled it
    #[test]
    fn nmf_parallel_barrier_log() {
        // cargo test nmf_parallel_barrier_log -- --nocapture
        let event_log = Arc::new(EventLog::new());
        let mut config = traced_config(3);
        config.residual_trace = false;
        let solver = small_problem(config).with_event_log(Arc::clone(&event_log));
        solver.solve_seeded().unwrap();
        event_log.check_barrier_order(6).unwrap();
        // per phase: 1 all-reduce, 1 all-gather, 2 for reduce-scatter
        let passed = event_log
            .events()
            .iter()
            .filter(|event| matches!(event, Event::BarrierPassed { .. }))
            .count();
        assert_eq!(passed, 6 * 8 * 3);
    }

    #[test]
    fn nmf_parallel_state_sequence() {
        // cargo test nmf_parallel_state_sequence -- --nocapture
        let grid = ProcessGrid::new(1, 1).unwrap();
        let layout = BlockLayout::new(ProblemShape::new(4, 4, 2), grid).unwrap();
        let mut communicators = Communicator::new_group(grid, None, None);
        let mut config = traced_config(1);
        config.residual_trace = true;
        let mut worker = Worker::new(
            layout,
            communicators.remove(0),
            ramp_matrix(4, 4),
            Matrix::ones((4, 2)),
            Matrix::ones((2, 4)),
            &config,
        );
        let mut states = vec![worker.state().name()];
        while !worker.state().is_done() {
            worker.step().unwrap();
            states.push(worker.state().name());
        }
        assert_eq!(
            states,
            vec![
                "Init",
                "ComputeU",
                "AllReduceH",
                "AllGatherH",
                "ComputeV",
                "ReduceScatterV",
                "UpdateW",
                "ComputeX",
                "AllReduceW",
                "AllGatherW",
                "ComputeY",
                "ReduceScatterY",
                "UpdateH",
                "Residual",
                "Done"
            ]
        );
        assert_eq!(worker.iteration(), 1);
    }

    #[test]
    fn nmf_parallel_rejects_bad_problem() {
        // cargo test nmf_parallel_rejects_bad_problem -- --nocapture
        let grid = ProcessGrid::new(3, 2).unwrap();
        let config = NmfParallelConfig::default();
        assert!(matches!(
            NmfParallel::new(ramp_matrix(18, 10), ProblemShape::new(18, 10, 5), grid, config.clone()),
            Err(NmfError::InvalidConfig(_))
        ));
        assert!(matches!(
            NmfParallel::new(ramp_matrix(18, 12), ProblemShape::new(12, 18, 5), grid, config.clone()),
            Err(NmfError::InvalidInput(_))
        ));
        let mut a = ramp_matrix(18, 12);
        a[[0, 0]] = -0.5;
        assert!(matches!(
            NmfParallel::new(a, ProblemShape::new(18, 12, 5), grid, config.clone()),
            Err(NmfError::InvalidInput(_))
        ));
        let solver = NmfParallel::new(ramp_matrix(18, 12), ProblemShape::new(18, 12, 5), grid, config).unwrap();
        assert!(matches!(
            solver.solve(Matrix::ones((18, 4)), Matrix::ones((5, 12))),
            Err(NmfError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn nmf_parallel_root_cause_preferred() {
        // cargo test nmf_parallel_root_cause_preferred -- --nocapture
        let aborted = NmfError::PeerAborted {
            op: "all_reduce",
            round: 3,
            node: 0,
            peer: 4,
        };
        let timeout = NmfError::Timeout {
            op: "barrier",
            round: 3,
            node: 4,
            missing: vec![5],
        };
        assert_eq!(root_cause(vec![aborted.clone(), timeout.clone()]), Some(timeout));
        assert_eq!(root_cause(vec![aborted.clone()]), Some(aborted));
        assert_eq!(root_cause(vec![]), None);
    }

    #[test]
    fn nmf_parallel_worker_panic_reported() {
        // cargo test nmf_parallel_worker_panic_reported -- --nocapture
        let solver = small_problem(traced_config(10));
        let (w0, h0) = initial_factors(&solver.layout.shape, solver.config.seed);
        let workers = solver.build_workers(&w0, &h0).unwrap();
        let post_office = Arc::clone(workers[0].communicator.post_office());
        let jobs: Vec<WorkerJob> = workers
            .into_iter()
            .map(|worker| {
                if worker.node == 1 {
                    Box::new(move || -> Result<WorkerOutput, NmfError> {
                        drop(worker);
                        panic!("worker failure")
                    }) as WorkerJob
                } else {
                    Box::new(move || worker.run()) as WorkerJob
                }
            })
            .collect();
        // the peers fail with `PeerAborted`, but the panic is what gets reported
        assert_eq!(
            solver.run_jobs(&post_office, jobs).unwrap_err(),
            NmfError::WorkerPanicked { node: 1 }
        );
    }

    #[test]
    fn nmf_parallel_config_defaults() {
        // cargo test nmf_parallel_config_defaults -- --nocapture
        let config = NmfParallelConfig::default();
        assert_eq!(config.max_iter, 100);
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
        assert!(!config.residual_trace);
        let config: NmfParallelConfig = serde_json::from_value(json!({ "timeout_ms": null })).unwrap();
        assert_eq!(config.timeout(), None);
        assert!(serde_json::from_value::<NmfParallelConfig>(json!({ "update_rule": "frobenius" })).is_err());
    }
}
