//! LP solving behind a narrow trait.
//!
//! [`LpSolver`] takes a [`FlowModel`] and returns a status plus one value per
//! variable. [`MicroLpSolver`] hands the model to `good_lp` with the
//! pure-Rust `microlp` backend. [`solve_with_limit`] bounds any solver by
//! wall-clock time, and [`WorkerTracker`] counts solver threads that are
//! still running after their caller gave up on them.

use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError,
    Solution, SolverModel, Variable,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::model::{FlowModel, Sense};

/// Tolerance for constraints that involve no variable.
const EMPTY_ROW_TOLERANCE: f64 = 1e-9;

/// Outcome class of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    TimedOut,
    Error,
}

impl SolveStatus {
    /// ```
    /// use ambulance_routing::solver::SolveStatus;
    ///
    /// assert_eq!(SolveStatus::TimedOut.as_str(), "TIMED_OUT");
    /// ```
    pub fn as_str(self) -> &'static str {
        match self {
            SolveStatus::Optimal => "OPTIMAL",
            SolveStatus::Infeasible => "INFEASIBLE",
            SolveStatus::Unbounded => "UNBOUNDED",
            SolveStatus::TimedOut => "TIMED_OUT",
            SolveStatus::Error => "ERROR",
        }
    }
}

/// Result of solving a [`FlowModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct LpSolution {
    pub status: SolveStatus,
    /// One value per model variable; empty unless optimal.
    pub values: Vec<f64>,
    pub objective: f64,
    pub message: Option<String>,
    pub elapsed: Duration,
}

impl LpSolution {
    pub fn optimal(values: Vec<f64>, objective: f64) -> Self {
        Self {
            status: SolveStatus::Optimal,
            values,
            objective,
            message: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(status: SolveStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            values: Vec::new(),
            objective: 0.0,
            message: Some(message.into()),
            elapsed: Duration::ZERO,
        }
    }

    /// Value of variable `var`, zero when absent.
    pub fn value(&self, var: usize) -> f64 {
        self.values.get(var).copied().unwrap_or(0.0)
    }

    fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Backend able to solve a flow model.
pub trait LpSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, model: &FlowModel) -> LpSolution;
}

/// `good_lp` with the `microlp` backend: binary variables, branch and bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroLpSolver;

impl LpSolver for MicroLpSolver {
    fn name(&self) -> &'static str {
        "microlp"
    }

    fn solve(&self, model: &FlowModel) -> LpSolution {
        let start = Instant::now();

        // Rows without variables never reach the backend.
        for c in model.constraints.iter().filter(|c| c.terms.is_empty()) {
            if !c.is_satisfied(&[], EMPTY_ROW_TOLERANCE) {
                debug!(constraint = %c.name(), "Constraint has no usable variable");
                return LpSolution::failed(
                    SolveStatus::Infeasible,
                    format!("constraint {} cannot be satisfied", c.name()),
                )
                .with_elapsed(start.elapsed());
            }
        }

        if model.variables.is_empty() {
            return LpSolution::optimal(Vec::new(), 0.0).with_elapsed(start.elapsed());
        }

        let mut vars = ProblemVariables::new();
        let flows: Vec<Variable> = model
            .variables
            .iter()
            .map(|_| vars.add(variable().binary()))
            .collect();

        let objective: Expression = model
            .variables
            .iter()
            .zip(&flows)
            .map(|(v, &f)| v.cost * f)
            .sum();

        let mut problem = vars.minimise(objective).using(default_solver);
        for c in model.constraints.iter().filter(|c| !c.terms.is_empty()) {
            let lhs: Expression = c.terms.iter().map(|&(var, coef)| coef * flows[var.0]).sum();
            problem = problem.with(match c.sense {
                Sense::Eq => constraint::eq(lhs, c.rhs),
                Sense::Le => constraint::leq(lhs, c.rhs),
            });
        }

        let result = match problem.solve() {
            Ok(solution) => {
                let values: Vec<f64> = flows.iter().map(|&f| solution.value(f)).collect();
                let objective = model.objective_value(&values);
                LpSolution::optimal(values, objective)
            }
            Err(ResolutionError::Infeasible) => {
                LpSolution::failed(SolveStatus::Infeasible, "model is infeasible")
            }
            Err(ResolutionError::Unbounded) => {
                LpSolution::failed(SolveStatus::Unbounded, "model is unbounded")
            }
            Err(e) => LpSolution::failed(SolveStatus::Error, e.to_string()),
        };

        result.with_elapsed(start.elapsed())
    }
}

/// Counts live solver work: dispatches in progress and worker threads,
/// including workers abandoned after a timeout.
#[derive(Debug, Clone, Default)]
pub struct WorkerTracker {
    active: Arc<AtomicUsize>,
}

impl WorkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Marks one unit of work as running until the guard is dropped.
    pub fn enter(&self) -> WorkerGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            active: Arc::clone(&self.active),
        }
    }
}

/// Releases its [`WorkerTracker`] slot on drop.
#[derive(Debug)]
pub struct WorkerGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs `solver` on a worker thread, giving up after `limit`.
///
/// On timeout the worker is left to finish in the background and its result
/// is discarded. It stays counted in `workers` until it exits.
///
/// # Examples
///
/// ```
/// use ambulance_routing::model::FlowModel;
/// use ambulance_routing::solver::{solve_with_limit, MicroLpSolver, SolveStatus, WorkerTracker};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let workers = WorkerTracker::new();
/// let solution = solve_with_limit(
///     Arc::new(MicroLpSolver),
///     Arc::new(FlowModel::default()),
///     Some(Duration::from_secs(5)),
///     &workers,
/// );
/// assert_eq!(solution.status, SolveStatus::Optimal);
/// ```
pub fn solve_with_limit(
    solver: Arc<dyn LpSolver>,
    model: Arc<FlowModel>,
    limit: Option<Duration>,
    workers: &WorkerTracker,
) -> LpSolution {
    let start = Instant::now();
    let stats = model.stats();
    let name = solver.name();

    info!(solver = name, %stats, "Solving flow model");

    let (tx, rx) = mpsc::channel();
    let guard = workers.enter();
    let spawned = thread::Builder::new()
        .name("lp-solver".to_string())
        .spawn(move || {
            let solution = solver.solve(&model);
            drop(guard);
            let _ = tx.send(solution);
        });
    if let Err(e) = spawned {
        return LpSolution::failed(SolveStatus::Error, format!("cannot start solver: {}", e));
    }

    let received = match limit {
        Some(limit) => rx.recv_timeout(limit).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => SolveStatus::TimedOut,
            mpsc::RecvTimeoutError::Disconnected => SolveStatus::Error,
        }),
        None => rx.recv().map_err(|_| SolveStatus::Error),
    };

    let solution = match received {
        Ok(solution) => solution,
        Err(SolveStatus::TimedOut) => {
            warn!(
                solver = name,
                ?limit,
                still_running = workers.active(),
                "Solver time limit reached, worker left running"
            );
            LpSolution::failed(SolveStatus::TimedOut, "time limit reached")
        }
        Err(status) => LpSolution::failed(status, "solver thread stopped without a result"),
    };

    let elapsed = start.elapsed();
    info!(
        solver = name,
        status = solution.status.as_str(),
        objective = solution.objective,
        duration_ms = elapsed.as_millis() as u64,
        "Solve finished"
    );
    solution.with_elapsed(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::EdgeCapacities;
    use crate::config::SeverityCosts;
    use crate::demo_data;
    use crate::emergency::{Emergency, Severity};
    use crate::model::FlowModelBuilder;
    use petgraph::graph::{EdgeIndex, NodeIndex};

    struct SlowSolver;

    impl LpSolver for SlowSolver {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn solve(&self, _model: &FlowModel) -> LpSolution {
            thread::sleep(Duration::from_millis(500));
            LpSolution::optimal(Vec::new(), 0.0)
        }
    }

    fn diamond_model(caps: &EdgeCapacities) -> FlowModel {
        let network = demo_data::diamond_network();
        let e = Emergency {
            index: 0,
            severity: Severity::Media,
            origin: NodeIndex::new(0),
            destination: NodeIndex::new(3),
            required_speed_kmh: 40.0,
        };
        FlowModelBuilder::new(&network, caps, &SeverityCosts::default()).build(&[&e])
    }

    #[test]
    fn test_diamond_optimum() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let model = diamond_model(&caps);
        let solution = MicroLpSolver.solve(&model);

        assert_eq!(solution.status, SolveStatus::Optimal);
        assert!((solution.objective - 400.0).abs() < 1e-6);
        let ab = model.variable(0, EdgeIndex::new(0)).unwrap();
        assert!(solution.value(ab.0) > 0.5);
    }

    #[test]
    fn test_missing_variables_make_model_infeasible() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 10.0);
        let model = diamond_model(&caps);
        assert!(model.variables.is_empty());

        let solution = MicroLpSolver.solve(&model);
        assert_eq!(solution.status, SolveStatus::Infeasible);
        assert!(solution.values.is_empty());
    }

    #[test]
    fn test_time_limit_reports_timeout() {
        let workers = WorkerTracker::new();
        let solution = solve_with_limit(
            Arc::new(SlowSolver),
            Arc::new(FlowModel::default()),
            Some(Duration::from_millis(20)),
            &workers,
        );
        assert_eq!(solution.status, SolveStatus::TimedOut);

        // The abandoned worker stays counted until it exits.
        assert_eq!(workers.active(), 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        while workers.active() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(workers.active(), 0);
    }

    #[test]
    fn test_no_limit_waits_for_result() {
        let workers = WorkerTracker::new();
        let solution =
            solve_with_limit(Arc::new(SlowSolver), Arc::new(FlowModel::default()), None, &workers);
        assert_eq!(solution.status, SolveStatus::Optimal);
    }

    #[test]
    fn test_tracker_counts_guards() {
        let workers = WorkerTracker::new();
        let first = workers.enter();
        let second = workers.clone().enter();
        assert_eq!(workers.active(), 2);
        drop(first);
        assert_eq!(workers.active(), 1);
        drop(second);
        assert_eq!(workers.active(), 0);
    }
}
