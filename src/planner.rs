//! Dispatch planning: from emergencies to routes.
//!
//! The planner screens out emergencies that cannot be reached at their
//! required speed, solves the remaining ones jointly and, when the joint
//! model is infeasible because emergencies compete for streets, re-admits
//! them one by one in priority order to find which ones must be dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::capacity::EdgeCapacities;
use crate::config::SeverityCosts;
use crate::emergency::Emergency;
use crate::extract::{InconsistencyError, Route, RouteExtractor};
use crate::model::{FlowModel, FlowModelBuilder, ModelStats};
use crate::network::RoadNetwork;
use crate::solver::{
    solve_with_limit, LpSolution, LpSolver, MicroLpSolver, SolveStatus, WorkerTracker,
};

/// Why an emergency got no route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Infeasibility {
    /// No path from the base over streets fast enough.
    NoFeasiblePath,
    /// Reachable alone, but every path conflicts with a higher priority route.
    EdgeConflict,
}

impl Infeasibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Infeasibility::NoFeasiblePath => "NO_FEASIBLE_PATH",
            Infeasibility::EdgeConflict => "EDGE_CONFLICT",
        }
    }
}

/// Result for one emergency.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyOutcome {
    Routed(Route),
    Infeasible(Infeasibility),
    /// The solver stopped without an optimal answer.
    Unsolved(SolveStatus),
    /// The solver answer for this emergency was not a valid route.
    Inconsistent(InconsistencyError),
}

impl EmergencyOutcome {
    pub fn route(&self) -> Option<&Route> {
        match self {
            EmergencyOutcome::Routed(route) => Some(route),
            _ => None,
        }
    }
}

/// Routes and diagnostics for one solve, index-aligned with the emergencies.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub status: SolveStatus,
    pub outcomes: Vec<EmergencyOutcome>,
    /// Size of the model the routes were extracted from, or of the joint
    /// model when nothing was solved.
    pub stats: ModelStats,
    pub objective: f64,
    pub solve_time: Duration,
    pub solver_calls: usize,
    pub computed_at: DateTime<Utc>,
}

impl DispatchPlan {
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.outcomes.iter().filter_map(EmergencyOutcome::route)
    }

    pub fn routed_count(&self) -> usize {
        self.routes().count()
    }

    pub fn infeasible_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, EmergencyOutcome::Infeasible(_)))
            .count()
    }

    pub fn total_cost(&self) -> f64 {
        self.routes().map(|r| r.cost).sum()
    }

    pub fn total_distance_m(&self) -> f64 {
        self.routes().map(|r| r.distance_m).sum()
    }
}

/// Solved model kept for extraction.
struct Solved {
    model: FlowModel,
    solution: LpSolution,
}

/// Plans ambulance routes with an [`LpSolver`].
///
/// # Examples
///
/// ```
/// use ambulance_routing::capacity::EdgeCapacities;
/// use ambulance_routing::config::SeverityCosts;
/// use ambulance_routing::demo_data;
/// use ambulance_routing::emergency::{Emergency, Severity};
/// use ambulance_routing::planner::RoutePlanner;
/// use petgraph::graph::{EdgeIndex, NodeIndex};
///
/// let network = demo_data::diamond_network();
/// let caps = EdgeCapacities::uniform(&network, 60.0);
/// let emergency = Emergency {
///     index: 0,
///     severity: Severity::Critica,
///     origin: NodeIndex::new(0),
///     destination: NodeIndex::new(3),
///     required_speed_kmh: 45.0,
/// };
///
/// let plan = RoutePlanner::default().plan(&network, &caps, &[emergency], &SeverityCosts::default());
/// let route = plan.outcomes[0].route().unwrap();
/// assert_eq!(route.edges, vec![EdgeIndex::new(0), EdgeIndex::new(1)]);
/// ```
#[derive(Clone)]
pub struct RoutePlanner {
    solver: Arc<dyn LpSolver>,
    time_limit: Option<Duration>,
    workers: WorkerTracker,
}

impl Default for RoutePlanner {
    fn default() -> Self {
        Self::new(Arc::new(MicroLpSolver))
    }
}

impl RoutePlanner {
    pub fn new(solver: Arc<dyn LpSolver>) -> Self {
        Self {
            solver,
            time_limit: None,
            workers: WorkerTracker::new(),
        }
    }

    /// Total wall-clock budget across all solver calls of one plan.
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.time_limit = limit;
        self
    }

    /// Counts this planner's solver threads in `workers`.
    pub fn with_workers(mut self, workers: WorkerTracker) -> Self {
        self.workers = workers;
        self
    }

    pub fn plan(
        &self,
        network: &RoadNetwork,
        capacities: &EdgeCapacities,
        emergencies: &[Emergency],
        costs: &SeverityCosts,
    ) -> DispatchPlan {
        let start = Instant::now();
        let builder = FlowModelBuilder::new(network, capacities, costs);

        let mut outcomes: Vec<Option<EmergencyOutcome>> = vec![None; emergencies.len()];
        let mut candidates: Vec<&Emergency> = Vec::new();

        for (outcome, e) in outcomes.iter_mut().zip(emergencies) {
            if e.origin == e.destination {
                *outcome = Some(EmergencyOutcome::Routed(Route::trivial(
                    e.index,
                    e.severity,
                    e.origin,
                    e.required_speed_kmh,
                    costs.for_severity(e.severity),
                )));
            } else if !network.reachable(e.origin, e.destination, |edge| {
                capacities.allows(edge, e.required_speed_kmh)
            }) {
                debug!(emergency = %e.name(), "No path at required speed");
                *outcome = Some(EmergencyOutcome::Infeasible(Infeasibility::NoFeasiblePath));
            } else {
                candidates.push(e);
            }
        }

        let mut status = SolveStatus::Optimal;
        let mut calls = 0;
        let mut stats = ModelStats::default();
        let mut solved: Option<Solved> = None;

        if !candidates.is_empty() {
            let model = builder.build(&candidates);
            stats = model.stats();
            let solution = self.solve(&model, start, &mut calls);

            match solution.status {
                SolveStatus::Optimal => solved = Some(Solved { model, solution }),
                SolveStatus::Infeasible => {
                    info!(
                        emergencies = candidates.len(),
                        "Joint model infeasible, admitting emergencies by priority"
                    );
                    let (last, failure) = self.admit_by_priority(
                        &builder,
                        &candidates,
                        emergencies,
                        &mut outcomes,
                        start,
                        &mut calls,
                    );
                    solved = last;
                    if let Some(failure) = failure {
                        status = failure;
                    }
                }
                other => {
                    warn!(status = other.as_str(), message = ?solution.message, "Flow model not solved");
                    status = other;
                    for e in &candidates {
                        if let Some(i) = slot(emergencies, e.index) {
                            outcomes[i] = Some(EmergencyOutcome::Unsolved(other));
                        }
                    }
                }
            }
        }

        let mut objective = 0.0;
        if let Some(Solved { model, solution }) = &solved {
            objective = solution.objective;
            stats = model.stats();
            self.extract_routes(network, model, solution, emergencies, &mut outcomes);
        }

        let outcomes: Vec<EmergencyOutcome> = outcomes
            .into_iter()
            .map(|o| o.unwrap_or(EmergencyOutcome::Unsolved(status)))
            .collect();

        let plan = DispatchPlan {
            status,
            outcomes,
            stats,
            objective,
            solve_time: start.elapsed(),
            solver_calls: calls,
            computed_at: Utc::now(),
        };

        info!(
            status = plan.status.as_str(),
            routed = plan.routed_count(),
            infeasible = plan.infeasible_count(),
            solver_calls = plan.solver_calls,
            duration_ms = plan.solve_time.as_millis() as u64,
            "Dispatch plan ready"
        );
        plan
    }

    /// One solver call within the remaining budget.
    fn solve(&self, model: &FlowModel, start: Instant, calls: &mut usize) -> LpSolution {
        let remaining = match self.time_limit {
            Some(limit) => match limit.checked_sub(start.elapsed()) {
                Some(left) if !left.is_zero() => Some(left),
                _ => return LpSolution::failed(SolveStatus::TimedOut, "time limit reached"),
            },
            None => None,
        };
        *calls += 1;
        solve_with_limit(
            Arc::clone(&self.solver),
            Arc::new(model.clone()),
            remaining,
            &self.workers,
        )
    }

    /// Adds candidates most urgent first; a candidate whose admission makes
    /// the model infeasible is rejected with [`Infeasibility::EdgeConflict`].
    ///
    /// Returns the last feasible solution and, if the solver failed for
    /// another reason, that status.
    fn admit_by_priority(
        &self,
        builder: &FlowModelBuilder<'_>,
        candidates: &[&Emergency],
        emergencies: &[Emergency],
        outcomes: &mut [Option<EmergencyOutcome>],
        start: Instant,
        calls: &mut usize,
    ) -> (Option<Solved>, Option<SolveStatus>) {
        let mut order = candidates.to_vec();
        order.sort_by_key(|e| (Reverse(e.severity), e.index));

        let mut admitted: Vec<&Emergency> = Vec::with_capacity(order.len());
        let mut last: Option<Solved> = None;

        for (pos, &e) in order.iter().enumerate() {
            let mut trial = admitted.clone();
            trial.push(e);
            let model = builder.build(&trial);
            let solution = self.solve(&model, start, calls);

            match solution.status {
                SolveStatus::Optimal => {
                    admitted = trial;
                    last = Some(Solved { model, solution });
                }
                SolveStatus::Infeasible => {
                    info!(emergency = %e.name(), severity = %e.severity, "Emergency conflicts with higher priority routes");
                    if let Some(i) = slot(emergencies, e.index) {
                        outcomes[i] = Some(EmergencyOutcome::Infeasible(Infeasibility::EdgeConflict));
                    }
                }
                other => {
                    warn!(status = other.as_str(), "Priority admission stopped");
                    for rest in &order[pos..] {
                        if let Some(i) = slot(emergencies, rest.index) {
                            outcomes[i] = Some(EmergencyOutcome::Unsolved(other));
                        }
                    }
                    return (last, Some(other));
                }
            }
        }
        (last, None)
    }

    fn extract_routes(
        &self,
        network: &RoadNetwork,
        model: &FlowModel,
        solution: &LpSolution,
        emergencies: &[Emergency],
        outcomes: &mut [Option<EmergencyOutcome>],
    ) {
        let extractor = RouteExtractor::new(network, model, solution);

        let shared = extractor.verify_edge_exclusivity().err();
        if let Some(err) = &shared {
            error!(error = %err, "Solved flow violates edge exclusivity");
        }

        for (c, commodity) in model.commodities.iter().enumerate() {
            let Some(i) = slot(emergencies, commodity.emergency) else {
                continue;
            };

            let outcome = match &shared {
                Some(err @ InconsistencyError::SharedEdge { emergencies: users, .. })
                    if users.contains(&commodity.emergency) =>
                {
                    Err(err.clone())
                }
                _ => extractor
                    .verify_conservation(c)
                    .and_then(|()| extractor.extract(c)),
            };

            outcomes[i] = Some(match outcome {
                Ok(route) => EmergencyOutcome::Routed(route),
                Err(err) => {
                    error!(emergency = commodity.emergency + 1, error = %err, "Inconsistent solver output");
                    EmergencyOutcome::Inconsistent(err)
                }
            });
        }
    }
}

/// Position of emergency `index` in the session list.
fn slot(emergencies: &[Emergency], index: usize) -> Option<usize> {
    emergencies.iter().position(|e| e.index == index)
}
