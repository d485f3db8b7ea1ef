//! DTOs for REST API requests and responses.
//!
//! The map payload ([`MapDto`]) carries everything a front end needs to draw
//! a session: the base, one marker per emergency colored by severity, and
//! one encoded polyline per routed emergency.

use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::SessionConfig;
use crate::emergency::{Emergency, Severity};
use crate::geometry::encode_route;
use crate::network::{Area, RoadNetwork};
use crate::planner::{DispatchPlan, EmergencyOutcome};
use crate::session::RoutingSession;
use crate::solver::SolveStatus;

/// A point on the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    fn of(network: &RoadNetwork, node: NodeIndex) -> Self {
        network
            .intersection(node)
            .map(|n| LatLng { lat: n.lat, lng: n.lng })
            .unwrap_or(LatLng { lat: 0.0, lng: 0.0 })
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyDto {
    /// Display name, `E1` for the first emergency.
    pub id: String,
    pub index: usize,
    pub severity: Severity,
    pub color: &'static str,
    pub location: LatLng,
    pub node: usize,
    pub required_speed_kmh: f64,
    pub cost_per_km: f64,
}

impl EmergencyDto {
    pub fn from_emergency(e: &Emergency, network: &RoadNetwork, config: &SessionConfig) -> Self {
        Self {
            id: e.name(),
            index: e.index,
            severity: e.severity,
            color: e.severity.color(),
            location: LatLng::of(network, e.destination),
            node: e.destination.index(),
            required_speed_kmh: e.required_speed_kmh,
            cost_per_km: config.costs.for_severity(e.severity),
        }
    }
}

/// Outcome of one emergency in a plan.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeDto {
    pub emergency: String,
    pub severity: Severity,
    /// `ROUTED`, `NO_FEASIBLE_PATH`, `EDGE_CONFLICT`, `UNSOLVED` or `INCONSISTENT`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteDto>,
}

/// Drawn route with its metrics.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteDto {
    pub color: &'static str,
    /// Google encoded polyline.
    pub polyline: String,
    pub segments: usize,
    pub distance_km: f64,
    pub travel_time_min: f64,
    pub cost: f64,
    pub required_speed_kmh: f64,
    pub cost_per_km: f64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanDto {
    pub solver_status: SolveStatus,
    pub outcomes: Vec<OutcomeDto>,
    pub routed: usize,
    pub total_cost: f64,
    pub total_distance_km: f64,
    pub objective: f64,
    pub variables: usize,
    pub constraints: usize,
    pub solver_calls: usize,
    pub solve_time_ms: u64,
    pub computed_at: DateTime<Utc>,
}

impl PlanDto {
    pub fn from_plan(plan: &DispatchPlan, emergencies: &[Emergency], network: &RoadNetwork) -> Self {
        let outcomes = emergencies
            .iter()
            .zip(&plan.outcomes)
            .map(|(e, outcome)| OutcomeDto::from_outcome(e, outcome, network))
            .collect();

        Self {
            solver_status: plan.status,
            outcomes,
            routed: plan.routed_count(),
            total_cost: plan.total_cost(),
            total_distance_km: plan.total_distance_m() / 1000.0,
            objective: plan.objective,
            variables: plan.stats.variables,
            constraints: plan.stats.constraints(),
            solver_calls: plan.solver_calls,
            solve_time_ms: plan.solve_time.as_millis() as u64,
            computed_at: plan.computed_at,
        }
    }
}

impl OutcomeDto {
    fn from_outcome(e: &Emergency, outcome: &EmergencyOutcome, network: &RoadNetwork) -> Self {
        let (status, message, route) = match outcome {
            EmergencyOutcome::Routed(route) => (
                "ROUTED",
                None,
                Some(RouteDto {
                    color: route.severity.color(),
                    polyline: encode_route(network, route),
                    segments: route.edges.len(),
                    distance_km: route.distance_km(),
                    travel_time_min: route.travel_time_s / 60.0,
                    cost: route.cost,
                    required_speed_kmh: route.required_speed_kmh,
                    cost_per_km: route.cost_per_km,
                }),
            ),
            EmergencyOutcome::Infeasible(reason) => (reason.as_str(), None, None),
            EmergencyOutcome::Unsolved(status) => (
                "UNSOLVED",
                Some(format!("solver stopped with status {}", status.as_str())),
                None,
            ),
            EmergencyOutcome::Inconsistent(err) => ("INCONSISTENT", Some(err.to_string()), None),
        };

        Self {
            emergency: e.name(),
            severity: e.severity,
            status,
            message,
            route,
        }
    }
}

/// Renderable map payload for one session.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MapDto {
    pub center: LatLng,
    /// South-west and north-east corners.
    pub bounds: [LatLng; 2],
    pub base: LatLng,
    pub emergencies: Vec<EmergencyDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanDto>,
}

impl MapDto {
    pub fn from_session(session: &RoutingSession) -> Self {
        let network = session.network();
        let (sw, ne) = network.bounds();
        Self {
            center: LatLng {
                lat: (sw[0] + ne[0]) / 2.0,
                lng: (sw[1] + ne[1]) / 2.0,
            },
            bounds: [
                LatLng { lat: sw[0], lng: sw[1] },
                LatLng { lat: ne[0], lng: ne[1] },
            ],
            base: LatLng::of(network, session.base()),
            emergencies: session
                .emergencies()
                .iter()
                .map(|e| EmergencyDto::from_emergency(e, network, session.config()))
                .collect(),
            plan: session
                .last_plan()
                .map(|p| PlanDto::from_plan(p, session.emergencies(), network)),
        }
    }
}

/// Session overview.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub id: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub nodes: usize,
    pub edges: usize,
    pub config: SessionConfig,
    pub base: LatLng,
    pub emergencies: Vec<EmergencyDto>,
    /// Slowest and fastest street capacity, km/h.
    pub capacity_span: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<SolveStatus>,
}

impl SessionDto {
    pub fn from_session(session: &RoutingSession) -> Self {
        let network = session.network();
        let caps = session.capacities().as_slice();
        let span = if caps.is_empty() {
            [0.0, 0.0]
        } else {
            caps.iter().fold([f64::INFINITY, f64::NEG_INFINITY], |[lo, hi], &c| {
                [lo.min(c), hi.max(c)]
            })
        };

        Self {
            id: session.id.clone(),
            source: session.source.clone(),
            created_at: session.created_at,
            nodes: network.node_count(),
            edges: network.edge_count(),
            config: session.config().clone(),
            base: LatLng::of(network, session.base()),
            emergencies: session
                .emergencies()
                .iter()
                .map(|e| EmergencyDto::from_emergency(e, network, session.config()))
                .collect(),
            capacity_span: span,
            last_status: session.last_plan().map(|p| p.status),
        }
    }
}

/// Body of `POST /sessions`: where to download the street network.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub area: Option<Area>,
    #[serde(default)]
    pub config: Option<SessionConfig>,
}

/// Body of `POST /sessions/{id}/base`. Without a position the base moves to
/// a random intersection.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RelocateBaseRequest {
    #[serde(default)]
    pub position: Option<LatLng>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "UP" when healthy.
    pub status: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub solver_engine: &'static str,
}

/// Error body shown to the user as a banner.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// `CONFIGURATION`, `EXTERNAL_SERVICE`, `NOT_FOUND`, `SOLVER_BUSY` or `INTERNAL`.
    pub kind: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo_data;
    use crate::solver::MicroLpSolver;
    use std::sync::Arc;

    fn diamond_session() -> RoutingSession {
        let network = Arc::new(demo_data::diamond_network());
        RoutingSession::new("map", "DIAMOND", network, SessionConfig::default().with_seed(1)).unwrap()
    }

    #[test]
    fn test_map_payload_markers() {
        let session = diamond_session();
        let map = MapDto::from_session(&session);
        assert_eq!(map.emergencies.len(), 3);
        let colors: Vec<&str> = map.emergencies.iter().map(|e| e.color).collect();
        assert_eq!(colors, vec!["green", "orange", "red"]);
        assert!(map.plan.is_none());
        assert!(map.bounds[0].lat <= map.center.lat && map.center.lat <= map.bounds[1].lat);
    }

    #[test]
    fn test_map_payload_after_solve() {
        let mut session = diamond_session();
        session.solve(Arc::new(MicroLpSolver)).unwrap();
        let map = MapDto::from_session(&session);
        let plan = map.plan.unwrap();
        assert_eq!(plan.outcomes.len(), 3);
        for outcome in &plan.outcomes {
            match &outcome.route {
                Some(route) => {
                    assert_eq!(outcome.status, "ROUTED");
                    assert!(!route.polyline.is_empty());
                }
                None => assert_ne!(outcome.status, "ROUTED"),
            }
        }

        let json = serde_json::to_value(MapDto::from_session(&session)).unwrap();
        assert!(json["plan"]["solverStatus"].is_string());
        assert_eq!(json["emergencies"][2]["severity"], "CRITICA");
    }

    #[test]
    fn test_session_dto_capacity_span() {
        let session = diamond_session();
        let dto = SessionDto::from_session(&session);
        assert_eq!(dto.nodes, 4);
        assert!(dto.capacity_span[0] >= 20.0 && dto.capacity_span[1] <= 80.0);
        assert!(dto.capacity_span[0] <= dto.capacity_span[1]);
    }
}
