//! Turns solved flow variables back into routes.
//!
//! A commodity's selected streets (value above one half) must form exactly
//! one simple path from the base to the emergency. Anything else is a data
//! inconsistency: extraction never drops edges to make a path fit.

use petgraph::graph::{EdgeIndex, NodeIndex};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::emergency::Severity;
use crate::model::{ConstraintKind, FlowModel};
use crate::network::RoadNetwork;
use crate::solver::LpSolution;

/// Value above which a binary flow variable counts as selected.
const SELECTED: f64 = 0.5;

/// Slack allowed when re-checking constraints on solver output.
const TOLERANCE: f64 = 1e-6;

/// Solver output that does not describe a valid route assignment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InconsistencyError {
    #[error("no commodity {0} in the model")]
    UnknownCommodity(usize),
    #[error("solution has no values for an optimal status")]
    MissingValues,
    #[error("emergency {emergency}: flow branches at node {node}")]
    Branching { emergency: usize, node: usize },
    #[error("emergency {emergency}: flow stops at node {node} before the destination")]
    DeadEnd { emergency: usize, node: usize },
    #[error("emergency {emergency}: flow revisits node {node}")]
    Cycle { emergency: usize, node: usize },
    #[error("emergency {emergency}: {unused} selected edges are not on the route")]
    Fragments { emergency: usize, unused: usize },
    #[error("emergency {emergency}: net flow {actual} at node {node}, expected {expected}")]
    Conservation {
        emergency: usize,
        node: usize,
        actual: f64,
        expected: f64,
    },
    #[error("edge {edge} carries emergencies {emergencies:?}")]
    SharedEdge {
        edge: usize,
        emergencies: Vec<usize>,
    },
}

/// Route of one emergency with its metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub emergency: usize,
    pub severity: Severity,
    /// Streets in travel order.
    pub edges: Vec<EdgeIndex>,
    /// Intersections in travel order, base first.
    pub nodes: Vec<NodeIndex>,
    pub distance_m: f64,
    pub travel_time_s: f64,
    pub cost: f64,
    pub required_speed_kmh: f64,
    pub cost_per_km: f64,
}

impl Route {
    /// Route for an emergency located at the base.
    pub fn trivial(
        emergency: usize,
        severity: Severity,
        at: NodeIndex,
        required_speed_kmh: f64,
        cost_per_km: f64,
    ) -> Self {
        Self {
            emergency,
            severity,
            edges: Vec::new(),
            nodes: vec![at],
            distance_m: 0.0,
            travel_time_s: 0.0,
            cost: 0.0,
            required_speed_kmh,
            cost_per_km,
        }
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_m / 1000.0
    }
}

/// Reads routes out of an optimal [`LpSolution`].
pub struct RouteExtractor<'a> {
    network: &'a RoadNetwork,
    model: &'a FlowModel,
    solution: &'a LpSolution,
}

impl<'a> RouteExtractor<'a> {
    pub fn new(network: &'a RoadNetwork, model: &'a FlowModel, solution: &'a LpSolution) -> Self {
        Self {
            network,
            model,
            solution,
        }
    }

    fn selected(&self, commodity: usize) -> Vec<EdgeIndex> {
        self.model
            .commodity_variables(commodity)
            .filter(|&(_, var)| self.solution.value(var.0) > SELECTED)
            .map(|(edge, _)| edge)
            .collect()
    }

    fn check_values(&self) -> Result<(), InconsistencyError> {
        if self.solution.values.len() < self.model.variables.len() {
            return Err(InconsistencyError::MissingValues);
        }
        Ok(())
    }

    /// Chains the selected streets of `commodity` into a route.
    ///
    /// # Examples
    ///
    /// ```
    /// use ambulance_routing::capacity::EdgeCapacities;
    /// use ambulance_routing::config::SeverityCosts;
    /// use ambulance_routing::demo_data;
    /// use ambulance_routing::emergency::{Emergency, Severity};
    /// use ambulance_routing::extract::RouteExtractor;
    /// use ambulance_routing::model::FlowModelBuilder;
    /// use ambulance_routing::solver::LpSolution;
    /// use petgraph::graph::{EdgeIndex, NodeIndex};
    ///
    /// let network = demo_data::diamond_network();
    /// let caps = EdgeCapacities::uniform(&network, 60.0);
    /// let e = Emergency {
    ///     index: 0,
    ///     severity: Severity::Leve,
    ///     origin: NodeIndex::new(0),
    ///     destination: NodeIndex::new(3),
    ///     required_speed_kmh: 50.0,
    /// };
    /// let costs = SeverityCosts::default();
    /// let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);
    ///
    /// // Hand-made assignment along A -> B -> D.
    /// let mut values = vec![0.0; model.variables.len()];
    /// values[model.variable(0, EdgeIndex::new(0)).unwrap().0] = 1.0;
    /// values[model.variable(0, EdgeIndex::new(1)).unwrap().0] = 1.0;
    /// let solution = LpSolution::optimal(values, 200.0);
    ///
    /// let route = RouteExtractor::new(&network, &model, &solution).extract(0).unwrap();
    /// assert_eq!(route.edges, vec![EdgeIndex::new(0), EdgeIndex::new(1)]);
    /// assert_eq!(route.distance_m, 2000.0);
    /// assert_eq!(route.cost, 200.0);
    /// assert!((route.travel_time_s - 144.0).abs() < 1e-9);
    /// ```
    pub fn extract(&self, commodity: usize) -> Result<Route, InconsistencyError> {
        let c = self
            .model
            .commodities
            .get(commodity)
            .ok_or(InconsistencyError::UnknownCommodity(commodity))?;
        self.check_values()?;
        let emergency = c.emergency;

        let mut out: BTreeMap<NodeIndex, Vec<(EdgeIndex, NodeIndex)>> = BTreeMap::new();
        let selected = self.selected(commodity);
        for &edge in &selected {
            if let Some((u, v)) = self.network.endpoints(edge) {
                out.entry(u).or_default().push((edge, v));
            }
        }

        if let Some((&node, _)) = out.iter().find(|(_, edges)| edges.len() > 1) {
            return Err(InconsistencyError::Branching {
                emergency,
                node: node.index(),
            });
        }

        let mut nodes = vec![c.origin];
        let mut edges = Vec::with_capacity(selected.len());
        let mut visited = HashSet::from([c.origin]);
        let mut at = c.origin;
        while at != c.destination {
            let Some(&(edge, next)) = out.get(&at).and_then(|e| e.first()) else {
                return Err(InconsistencyError::DeadEnd {
                    emergency,
                    node: at.index(),
                });
            };
            if !visited.insert(next) {
                return Err(InconsistencyError::Cycle {
                    emergency,
                    node: next.index(),
                });
            }
            edges.push(edge);
            nodes.push(next);
            at = next;
        }

        if edges.len() != selected.len() {
            return Err(InconsistencyError::Fragments {
                emergency,
                unused: selected.len() - edges.len(),
            });
        }

        let distance_m: f64 = edges
            .iter()
            .filter_map(|&e| self.network.street(e))
            .map(|s| s.length_m)
            .sum();
        let distance_km = distance_m / 1000.0;

        Ok(Route {
            emergency,
            severity: c.severity,
            edges,
            nodes,
            distance_m,
            travel_time_s: distance_km / c.required_speed_kmh * 3600.0,
            cost: distance_km * c.cost_per_km,
            required_speed_kmh: c.required_speed_kmh,
            cost_per_km: c.cost_per_km,
        })
    }

    /// Checks every conservation row of `commodity` against the solution.
    pub fn verify_conservation(&self, commodity: usize) -> Result<(), InconsistencyError> {
        let c = self
            .model
            .commodities
            .get(commodity)
            .ok_or(InconsistencyError::UnknownCommodity(commodity))?;
        self.check_values()?;

        for row in &self.model.constraints {
            let ConstraintKind::Conservation { commodity: k, node } = row.kind else {
                continue;
            };
            if k != commodity || row.is_satisfied(&self.solution.values, TOLERANCE) {
                continue;
            }
            return Err(InconsistencyError::Conservation {
                emergency: c.emergency,
                node: node.index(),
                actual: row.lhs(&self.solution.values),
                expected: row.rhs,
            });
        }
        Ok(())
    }

    /// Checks that no street carries more than one emergency.
    pub fn verify_edge_exclusivity(&self) -> Result<(), InconsistencyError> {
        self.check_values()?;

        let mut carried: BTreeMap<EdgeIndex, Vec<usize>> = BTreeMap::new();
        for (i, var) in self.model.variables.iter().enumerate() {
            if self.solution.value(i) > SELECTED {
                let emergency = self.model.commodities[var.commodity].emergency;
                carried.entry(var.edge).or_default().push(emergency);
            }
        }

        match carried.into_iter().find(|(_, users)| users.len() > 1) {
            Some((edge, emergencies)) => Err(InconsistencyError::SharedEdge {
                edge: edge.index(),
                emergencies,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::EdgeCapacities;
    use crate::config::SeverityCosts;
    use crate::demo_data;
    use crate::emergency::Emergency;
    use crate::model::FlowModelBuilder;

    fn emergency(index: usize, to: usize) -> Emergency {
        Emergency {
            index,
            severity: Severity::Media,
            origin: NodeIndex::new(0),
            destination: NodeIndex::new(to),
            required_speed_kmh: 40.0,
        }
    }

    fn assign(model: &FlowModel, picks: &[(usize, usize)]) -> LpSolution {
        let mut values = vec![0.0; model.variables.len()];
        for &(commodity, edge) in picks {
            let var = model.variable(commodity, EdgeIndex::new(edge)).unwrap();
            values[var.0] = 1.0;
        }
        let objective = model.objective_value(&values);
        LpSolution::optimal(values, objective)
    }

    #[test]
    fn test_branching_flow_rejected() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let e = emergency(0, 3);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);

        let solution = assign(&model, &[(0, 0), (0, 1), (0, 2), (0, 3)]);
        let extractor = RouteExtractor::new(&network, &model, &solution);
        assert_eq!(
            extractor.extract(0),
            Err(InconsistencyError::Branching {
                emergency: 0,
                node: 0
            })
        );
        assert!(extractor.verify_conservation(0).is_err());
    }

    #[test]
    fn test_dead_end_rejected() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let e = emergency(0, 3);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);

        let solution = assign(&model, &[(0, 0)]);
        let extractor = RouteExtractor::new(&network, &model, &solution);
        assert_eq!(
            extractor.extract(0),
            Err(InconsistencyError::DeadEnd {
                emergency: 0,
                node: 1
            })
        );
    }

    #[test]
    fn test_detached_cycle_reported_as_fragment() {
        // A -> B, plus a separate C <-> D loop.
        let mut network = RoadNetwork::new();
        let a = network.add_intersection(1, 0.0, 0.0);
        let b = network.add_intersection(2, 0.0, 0.001);
        let c = network.add_intersection(3, 0.0, 0.002);
        let d = network.add_intersection(4, 0.0, 0.003);
        network.add_street(a, b, 100.0, "residential");
        network.add_street(c, d, 100.0, "residential");
        network.add_street(d, c, 100.0, "residential");

        let caps = EdgeCapacities::uniform(&network, 60.0);
        let e = emergency(0, 1);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);

        // Path plus a C <-> D loop: conservation holds, but the loop is extra.
        let solution = assign(&model, &[(0, 0), (0, 1), (0, 2)]);
        let extractor = RouteExtractor::new(&network, &model, &solution);
        assert!(extractor.verify_conservation(0).is_ok());
        assert_eq!(
            extractor.extract(0),
            Err(InconsistencyError::Fragments {
                emergency: 0,
                unused: 2
            })
        );
    }

    #[test]
    fn test_shared_edge_detected() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let first = emergency(0, 1);
        let second = emergency(1, 3);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&first, &second]);

        let solution = assign(&model, &[(0, 0), (1, 0), (1, 1)]);
        let extractor = RouteExtractor::new(&network, &model, &solution);
        assert_eq!(
            extractor.verify_edge_exclusivity(),
            Err(InconsistencyError::SharedEdge {
                edge: 0,
                emergencies: vec![0, 1]
            })
        );
        // Each route on its own is still a valid path.
        assert!(extractor.extract(0).is_ok());
        assert!(extractor.extract(1).is_ok());
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let e = emergency(0, 3);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);
        let solution = assign(&model, &[(0, 2), (0, 3)]);
        let extractor = RouteExtractor::new(&network, &model, &solution);

        let first = extractor.extract(0).unwrap();
        let second = extractor.extract(0).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.nodes, vec![NodeIndex::new(0), NodeIndex::new(2), NodeIndex::new(3)]);
        assert_eq!(first.cost, 800.0);
    }

    #[test]
    fn test_missing_values_rejected() {
        let network = demo_data::diamond_network();
        let caps = EdgeCapacities::uniform(&network, 60.0);
        let e = emergency(0, 3);
        let costs = SeverityCosts::default();
        let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&e]);
        let solution = LpSolution::optimal(Vec::new(), 0.0);
        let extractor = RouteExtractor::new(&network, &model, &solution);

        assert_eq!(extractor.extract(0), Err(InconsistencyError::MissingValues));
        assert_eq!(extractor.extract(5), Err(InconsistencyError::UnknownCommodity(5)));
    }
}
