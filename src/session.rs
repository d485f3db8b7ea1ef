//! Routing sessions and the session registry.
//!
//! A session owns everything one user manipulates: a shared read-only
//! network, the capacity assignment, base, emergencies, configuration, its
//! own random generator and the last plan. Sessions never share mutable
//! state with each other.
//!
//! Solving happens outside the session lock: [`RoutingSession::begin_dispatch`]
//! snapshots the inputs, [`DispatchRequest::run`] plans without touching the
//! session and [`RoutingSession::finish_dispatch`] stores the result unless
//! the session changed in the meantime.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capacity::{assign_capacities, EdgeCapacities};
use crate::config::{ConfigError, SessionConfig, SeverityCosts};
use crate::console;
use crate::emergency::{generate_emergencies, place_base, Emergency};
use crate::network::RoadNetwork;
use crate::planner::{DispatchPlan, RoutePlanner};
use crate::solver::{LpSolver, MicroLpSolver, WorkerGuard, WorkerTracker};

/// A session refused a solve because earlier solver work is still running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session {session_id} is still solving ({active} solver tasks running)")]
pub struct SolveInProgress {
    pub session_id: String,
    pub active: usize,
}

fn new_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// State of one interactive routing session.
///
/// # Examples
///
/// ```
/// use ambulance_routing::config::SessionConfig;
/// use ambulance_routing::demo_data;
/// use ambulance_routing::session::RoutingSession;
/// use std::sync::Arc;
///
/// let network = Arc::new(demo_data::grid_network());
/// let session = RoutingSession::new("s1", "GRID", network, SessionConfig::default().with_seed(3)).unwrap();
///
/// assert_eq!(session.emergencies().len(), 3);
/// assert_eq!(session.capacities().len(), session.network().edge_count());
/// assert!(session.last_plan().is_none());
/// ```
pub struct RoutingSession {
    pub id: String,
    /// Demo dataset name or `OSM`.
    pub source: String,
    pub created_at: DateTime<Utc>,
    network: Arc<RoadNetwork>,
    config: SessionConfig,
    rng: StdRng,
    capacities: EdgeCapacities,
    base: NodeIndex,
    emergencies: Vec<Emergency>,
    last_plan: Option<DispatchPlan>,
    /// Bumped on every change to the solve inputs.
    generation: u64,
    workers: WorkerTracker,
}

impl RoutingSession {
    /// Creates a session: assigns capacities, places the base and generates
    /// emergencies, in that order.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        network: Arc<RoadNetwork>,
        config: SessionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = new_rng(config.seed);
        let capacities = assign_capacities(&network, &config.capacity, &mut rng)?;
        let base = place_base(&network, &mut rng)?;
        let emergencies = generate_emergencies(
            &network,
            base,
            &config.counts,
            &config.required_speed,
            &mut rng,
        )?;

        Ok(Self {
            id: id.into(),
            source: source.into(),
            created_at: Utc::now(),
            network,
            config,
            rng,
            capacities,
            base,
            emergencies,
            last_plan: None,
            generation: 0,
            workers: WorkerTracker::new(),
        })
    }

    pub fn network(&self) -> &RoadNetwork {
        &self.network
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn capacities(&self) -> &EdgeCapacities {
        &self.capacities
    }

    pub fn base(&self) -> NodeIndex {
        self.base
    }

    pub fn emergencies(&self) -> &[Emergency] {
        &self.emergencies
    }

    pub fn last_plan(&self) -> Option<&DispatchPlan> {
        self.last_plan.as_ref()
    }

    /// Dispatches and solver threads of this session still running.
    pub fn active_solves(&self) -> usize {
        self.workers.active()
    }

    fn invalidate_plan(&mut self) {
        self.last_plan = None;
        self.generation += 1;
    }

    /// Draws new capacities for every street.
    pub fn regenerate_capacities(&mut self) -> Result<(), ConfigError> {
        self.capacities = assign_capacities(&self.network, &self.config.capacity, &mut self.rng)?;
        self.invalidate_plan();
        info!(session_id = %self.id, edges = self.capacities.len(), "Capacities regenerated");
        Ok(())
    }

    /// Draws new emergencies. The base stays where it is.
    pub fn regenerate_emergencies(&mut self) -> Result<(), ConfigError> {
        self.emergencies = generate_emergencies(
            &self.network,
            self.base,
            &self.config.counts,
            &self.config.required_speed,
            &mut self.rng,
        )?;
        self.invalidate_plan();
        info!(session_id = %self.id, emergencies = self.emergencies.len(), "Emergencies regenerated");
        Ok(())
    }

    /// Moves the base to the intersection nearest `position`, or to a random
    /// intersection when `None`, then regenerates emergencies from there.
    pub fn relocate_base(&mut self, position: Option<(f64, f64)>) -> Result<(), ConfigError> {
        let base = match position {
            Some((lat, lng)) => self
                .network
                .snap_to_road(lat, lng)
                .ok_or(ConfigError::NotEnoughNodes { nodes: 0, needed: 1 })?,
            None => place_base(&self.network, &mut self.rng)?,
        };
        let emergencies = generate_emergencies(
            &self.network,
            base,
            &self.config.counts,
            &self.config.required_speed,
            &mut self.rng,
        )?;
        self.base = base;
        self.emergencies = emergencies;
        self.invalidate_plan();
        info!(session_id = %self.id, base = base.index(), "Base relocated");
        Ok(())
    }

    /// Validates and applies a new configuration.
    ///
    /// A new seed restarts the random generator. Capacities are redrawn when
    /// their range changes, emergencies when counts or the required speed
    /// range change. Nothing changes if validation fails.
    pub fn update_config(&mut self, config: SessionConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let reseed = config.seed.is_some() && config.seed != self.config.seed;
        let redraw_capacities = reseed || config.capacity != self.config.capacity;
        let redraw_emergencies = reseed
            || config.counts != self.config.counts
            || config.required_speed != self.config.required_speed;

        let mut rng = if reseed {
            new_rng(config.seed)
        } else {
            self.rng.clone()
        };
        let capacities = if redraw_capacities {
            assign_capacities(&self.network, &config.capacity, &mut rng)?
        } else {
            self.capacities.clone()
        };
        let emergencies = if redraw_emergencies {
            generate_emergencies(
                &self.network,
                self.base,
                &config.counts,
                &config.required_speed,
                &mut rng,
            )?
        } else {
            self.emergencies.clone()
        };

        self.rng = rng;
        self.capacities = capacities;
        self.emergencies = emergencies;
        self.config = config;
        self.invalidate_plan();
        info!(
            session_id = %self.id,
            redraw_capacities,
            redraw_emergencies,
            "Configuration updated"
        );
        Ok(())
    }

    /// Snapshots the solve inputs.
    ///
    /// Fails while an earlier dispatch of this session, or a solver thread it
    /// abandoned on timeout, is still running.
    pub fn begin_dispatch(&mut self) -> Result<DispatchRequest, SolveInProgress> {
        let active = self.workers.active();
        if active > 0 {
            warn!(session_id = %self.id, active, "Solve refused, previous solve still running");
            return Err(SolveInProgress {
                session_id: self.id.clone(),
                active,
            });
        }

        Ok(DispatchRequest {
            session_id: self.id.clone(),
            generation: self.generation,
            network: Arc::clone(&self.network),
            capacities: self.capacities.clone(),
            emergencies: self.emergencies.clone(),
            costs: self.config.costs,
            time_limit: self.config.solve_time_limit(),
            workers: self.workers.clone(),
            _slot: self.workers.enter(),
        })
    }

    /// Keeps `plan` unless the session changed since `request` was taken.
    pub fn finish_dispatch(&mut self, request: DispatchRequest, plan: DispatchPlan) -> bool {
        if request.generation != self.generation {
            info!(session_id = %self.id, "Session changed during solve, plan discarded");
            return false;
        }
        self.last_plan = Some(plan);
        true
    }

    /// Plans routes for the current emergencies and keeps the plan.
    pub fn solve(&mut self, solver: Arc<dyn LpSolver>) -> Result<&DispatchPlan, SolveInProgress> {
        let request = self.begin_dispatch()?;
        let plan = request.run(solver);
        drop(request);
        Ok(self.last_plan.insert(plan))
    }
}

/// Solve inputs of one session, detached from the session lock.
///
/// Holds a slot in the session's worker count until dropped.
pub struct DispatchRequest {
    session_id: String,
    generation: u64,
    network: Arc<RoadNetwork>,
    capacities: EdgeCapacities,
    emergencies: Vec<Emergency>,
    costs: SeverityCosts,
    time_limit: Option<Duration>,
    workers: WorkerTracker,
    _slot: WorkerGuard,
}

impl DispatchRequest {
    pub fn network(&self) -> &RoadNetwork {
        &self.network
    }

    pub fn emergencies(&self) -> &[Emergency] {
        &self.emergencies
    }

    pub fn run(&self, solver: Arc<dyn LpSolver>) -> DispatchPlan {
        info!(
            session_id = %self.session_id,
            emergencies = self.emergencies.len(),
            solver = solver.name(),
            "Starting dispatch solve"
        );
        console::print_problem(&self.emergencies);

        let plan = RoutePlanner::new(solver)
            .with_time_limit(self.time_limit)
            .with_workers(self.workers.clone())
            .plan(&self.network, &self.capacities, &self.emergencies, &self.costs);

        console::print_model(&plan.stats);
        console::print_plan(&plan, &self.emergencies);
        plan
    }
}

/// Registry of live sessions.
///
/// # Examples
///
/// ```
/// use ambulance_routing::config::SessionConfig;
/// use ambulance_routing::demo_data;
/// use ambulance_routing::session::SessionService;
/// use std::sync::Arc;
///
/// let service = SessionService::new();
/// let network = Arc::new(demo_data::diamond_network());
/// let session = service.create_session("DIAMOND", network, SessionConfig::default()).unwrap();
/// let id = session.read().id.clone();
///
/// assert!(service.get_session(&id).is_some());
/// assert!(service.remove_session(&id).is_some());
/// assert!(service.list_sessions().is_empty());
/// ```
pub struct SessionService {
    sessions: RwLock<HashMap<String, Arc<RwLock<RoutingSession>>>>,
    solver: Arc<dyn LpSolver>,
}

impl SessionService {
    pub fn new() -> Self {
        Self::with_solver(Arc::new(MicroLpSolver))
    }

    pub fn with_solver(solver: Arc<dyn LpSolver>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            solver,
        }
    }

    pub fn solver(&self) -> Arc<dyn LpSolver> {
        Arc::clone(&self.solver)
    }

    /// Creates and registers a session with a fresh UUID.
    pub fn create_session(
        &self,
        source: &str,
        network: Arc<RoadNetwork>,
        config: SessionConfig,
    ) -> Result<Arc<RwLock<RoutingSession>>, ConfigError> {
        let id = Uuid::new_v4().to_string();
        let session = RoutingSession::new(id.clone(), source, network, config)?;
        info!(
            session_id = %id,
            source,
            nodes = session.network().node_count(),
            edges = session.network().edge_count(),
            "Session created"
        );
        let session = Arc::new(RwLock::new(session));
        self.sessions.write().insert(id, Arc::clone(&session));
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<RwLock<RoutingSession>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<RwLock<RoutingSession>>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            info!(session_id = %id, "Session removed");
        }
        removed
    }
}

impl Default for SessionService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeverityCounts, SpeedRange};
    use crate::demo_data;

    fn grid_session(seed: u64) -> RoutingSession {
        let network = Arc::new(demo_data::grid_network());
        RoutingSession::new("test", "GRID", network, SessionConfig::default().with_seed(seed)).unwrap()
    }

    #[test]
    fn test_seeded_sessions_match() {
        let a = grid_session(21);
        let b = grid_session(21);
        assert_eq!(a.capacities(), b.capacities());
        assert_eq!(a.base(), b.base());
        assert_eq!(a.emergencies(), b.emergencies());
    }

    #[test]
    fn test_regenerate_emergencies_keeps_base() {
        let mut session = grid_session(4);
        let base = session.base();
        let caps = session.capacities().clone();
        session.regenerate_emergencies().unwrap();
        assert_eq!(session.base(), base);
        assert_eq!(session.capacities(), &caps);
        assert!(session.emergencies().iter().all(|e| e.origin == base));
    }

    #[test]
    fn test_regenerate_capacities_keeps_emergencies() {
        let mut session = grid_session(4);
        let emergencies = session.emergencies().to_vec();
        let caps = session.capacities().clone();
        session.regenerate_capacities().unwrap();
        assert_eq!(session.emergencies(), emergencies.as_slice());
        assert_ne!(session.capacities(), &caps);
    }

    #[test]
    fn test_relocate_base_snaps_to_nearest() {
        let mut session = grid_session(4);
        let target = session.network().intersection(NodeIndex::new(7)).unwrap().clone();
        session
            .relocate_base(Some((target.lat + 0.00001, target.lng)))
            .unwrap();
        assert_eq!(session.base(), NodeIndex::new(7));
        assert!(session
            .emergencies()
            .iter()
            .all(|e| e.origin == NodeIndex::new(7) && e.destination != NodeIndex::new(7)));
    }

    #[test]
    fn test_invalid_config_leaves_session_untouched() {
        let mut session = grid_session(4);
        let before = session.config().clone();
        let bad = SessionConfig {
            required_speed: SpeedRange::new(70.0, 10.0),
            ..before.clone()
        };
        assert!(session.update_config(bad).is_err());
        assert_eq!(session.config(), &before);
    }

    #[test]
    fn test_update_counts_redraws_emergencies_only() {
        let mut session = grid_session(4);
        let caps = session.capacities().clone();
        let config = SessionConfig {
            counts: SeverityCounts::new(0, 0, 2),
            ..session.config().clone()
        };
        session.update_config(config).unwrap();
        assert_eq!(session.capacities(), &caps);
        assert_eq!(session.emergencies().len(), 2);
    }

    #[test]
    fn test_solve_keeps_last_plan() {
        let mut session = grid_session(8);
        let routed = session.solve(Arc::new(MicroLpSolver)).unwrap().outcomes.len();
        assert_eq!(routed, 3);
        assert!(session.last_plan().is_some());
        assert_eq!(session.active_solves(), 0);
        session.regenerate_capacities().unwrap();
        assert!(session.last_plan().is_none());
    }

    #[test]
    fn test_second_dispatch_refused_while_first_runs() {
        let mut session = grid_session(8);
        let request = session.begin_dispatch().unwrap();
        assert_eq!(session.active_solves(), 1);

        let refused = session.begin_dispatch().err().unwrap();
        assert_eq!(refused.active, 1);
        assert!(session.solve(Arc::new(MicroLpSolver)).is_err());

        drop(request);
        assert_eq!(session.active_solves(), 0);
        assert!(session.begin_dispatch().is_ok());
    }

    #[test]
    fn test_dispatch_runs_detached_and_is_stored() {
        let mut session = grid_session(8);
        let request = session.begin_dispatch().unwrap();
        let plan = request.run(Arc::new(MicroLpSolver));
        assert_eq!(plan.outcomes.len(), request.emergencies().len());

        assert!(session.finish_dispatch(request, plan));
        assert!(session.last_plan().is_some());
        assert_eq!(session.active_solves(), 0);
    }

    #[test]
    fn test_plan_discarded_when_session_changed_during_solve() {
        let mut session = grid_session(8);
        let request = session.begin_dispatch().unwrap();
        let plan = request.run(Arc::new(MicroLpSolver));

        session.regenerate_emergencies().unwrap();
        assert!(!session.finish_dispatch(request, plan));
        assert!(session.last_plan().is_none());
    }
}
