//! Multi-commodity min-cost flow model.
//!
//! One commodity per admitted emergency. A binary variable `f[i,e]` exists
//! only for streets `e` fast enough for commodity `i`; the objective sums
//! `length_km(e) * cost_per_km(i) * f[i,e]`. Constraints:
//!
//! - conservation per commodity and node: `out - in = b(node)` with
//!   `b(origin) = 1`, `b(destination) = -1`, otherwise 0;
//! - exclusivity per street used by two or more commodities:
//!   `sum_i f[i,e] <= 1`.
//!
//! The model is backend independent; [`crate::solver`] translates it.

use petgraph::graph::{EdgeIndex, NodeIndex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::capacity::EdgeCapacities;
use crate::config::SeverityCosts;
use crate::emergency::{Emergency, Severity};
use crate::network::RoadNetwork;

/// Position of a variable in [`FlowModel::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub usize);

/// An emergency admitted into the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Commodity {
    /// Index of the emergency in the session.
    pub emergency: usize,
    pub severity: Severity,
    pub origin: NodeIndex,
    pub destination: NodeIndex,
    pub required_speed_kmh: f64,
    pub cost_per_km: f64,
}

impl Commodity {
    /// Net outflow required at `node`.
    pub fn supply(&self, node: NodeIndex) -> f64 {
        let mut b = 0.0;
        if node == self.origin {
            b += 1.0;
        }
        if node == self.destination {
            b -= 1.0;
        }
        b
    }
}

/// Binary decision: commodity `commodity` travels street `edge`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowVariable {
    /// Position in [`FlowModel::commodities`].
    pub commodity: usize,
    pub edge: EdgeIndex,
    /// Objective coefficient.
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Eq,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Conservation { commodity: usize, node: NodeIndex },
    EdgeExclusive { edge: EdgeIndex },
}

/// `sum(coef * var) <sense> rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub kind: ConstraintKind,
    pub terms: Vec<(VarId, f64)>,
    pub sense: Sense,
    pub rhs: f64,
}

impl LinearConstraint {
    pub fn name(&self) -> String {
        match self.kind {
            ConstraintKind::Conservation { commodity, node } => {
                format!("flow_c{}_n{}", commodity, node.index())
            }
            ConstraintKind::EdgeExclusive { edge } => format!("excl_e{}", edge.index()),
        }
    }

    /// Left-hand side under an assignment. Missing values count as zero.
    pub fn lhs(&self, values: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|&(var, coef)| coef * values.get(var.0).copied().unwrap_or(0.0))
            .sum()
    }

    pub fn is_satisfied(&self, values: &[f64], tolerance: f64) -> bool {
        let lhs = self.lhs(values);
        match self.sense {
            Sense::Eq => (lhs - self.rhs).abs() <= tolerance,
            Sense::Le => lhs <= self.rhs + tolerance,
        }
    }
}

/// Size of a built model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelStats {
    pub commodities: usize,
    pub variables: usize,
    pub conservation_constraints: usize,
    pub exclusivity_constraints: usize,
}

impl ModelStats {
    pub fn constraints(&self) -> usize {
        self.conservation_constraints + self.exclusivity_constraints
    }
}

impl fmt::Display for ModelStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commodities, {} variables, {} constraints",
            self.commodities,
            self.variables,
            self.constraints()
        )
    }
}

/// A built flow model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlowModel {
    pub commodities: Vec<Commodity>,
    pub variables: Vec<FlowVariable>,
    pub constraints: Vec<LinearConstraint>,
    index: BTreeMap<(usize, EdgeIndex), VarId>,
}

impl FlowModel {
    /// Variable for (commodity, edge), if that pair is feasible.
    pub fn variable(&self, commodity: usize, edge: EdgeIndex) -> Option<VarId> {
        self.index.get(&(commodity, edge)).copied()
    }

    /// Variables of one commodity, in edge order.
    pub fn commodity_variables(&self, commodity: usize) -> impl Iterator<Item = (EdgeIndex, VarId)> + '_ {
        self.index
            .range((commodity, EdgeIndex::new(0))..(commodity + 1, EdgeIndex::new(0)))
            .map(|(&(_, edge), &var)| (edge, var))
    }

    /// Objective under an assignment.
    pub fn objective_value(&self, values: &[f64]) -> f64 {
        self.variables
            .iter()
            .zip(values)
            .map(|(var, value)| var.cost * value)
            .sum()
    }

    pub fn stats(&self) -> ModelStats {
        let exclusivity = self
            .constraints
            .iter()
            .filter(|c| matches!(c.kind, ConstraintKind::EdgeExclusive { .. }))
            .count();
        ModelStats {
            commodities: self.commodities.len(),
            variables: self.variables.len(),
            conservation_constraints: self.constraints.len() - exclusivity,
            exclusivity_constraints: exclusivity,
        }
    }
}

/// Builds [`FlowModel`]s over one network and capacity assignment.
///
/// # Examples
///
/// ```
/// use ambulance_routing::capacity::EdgeCapacities;
/// use ambulance_routing::config::SeverityCosts;
/// use ambulance_routing::demo_data;
/// use ambulance_routing::emergency::{Emergency, Severity};
/// use ambulance_routing::model::FlowModelBuilder;
/// use petgraph::graph::NodeIndex;
///
/// let network = demo_data::diamond_network();
/// let caps = EdgeCapacities::uniform(&network, 50.0);
/// let emergency = Emergency {
///     index: 0,
///     severity: Severity::Leve,
///     origin: NodeIndex::new(0),
///     destination: NodeIndex::new(3),
///     required_speed_kmh: 40.0,
/// };
///
/// let costs = SeverityCosts::default();
/// let model = FlowModelBuilder::new(&network, &caps, &costs).build(&[&emergency]);
/// let stats = model.stats();
/// assert_eq!(stats.variables, 4);
/// assert_eq!(stats.conservation_constraints, 4);
/// assert_eq!(stats.exclusivity_constraints, 0);
/// ```
pub struct FlowModelBuilder<'a> {
    network: &'a RoadNetwork,
    capacities: &'a EdgeCapacities,
    costs: &'a SeverityCosts,
}

impl<'a> FlowModelBuilder<'a> {
    pub fn new(
        network: &'a RoadNetwork,
        capacities: &'a EdgeCapacities,
        costs: &'a SeverityCosts,
    ) -> Self {
        Self {
            network,
            capacities,
            costs,
        }
    }

    pub fn build(&self, emergencies: &[&Emergency]) -> FlowModel {
        let mut model = FlowModel::default();
        let mut users: BTreeMap<EdgeIndex, Vec<VarId>> = BTreeMap::new();

        for (c, emergency) in emergencies.iter().enumerate() {
            let commodity = Commodity {
                emergency: emergency.index,
                severity: emergency.severity,
                origin: emergency.origin,
                destination: emergency.destination,
                required_speed_kmh: emergency.required_speed_kmh,
                cost_per_km: self.costs.for_severity(emergency.severity),
            };

            let mut outflow: BTreeMap<NodeIndex, Vec<(VarId, f64)>> = BTreeMap::new();
            let mut touched = BTreeSet::from([commodity.origin, commodity.destination]);

            for edge in self.network.edge_indices() {
                if !self.capacities.allows(edge, commodity.required_speed_kmh) {
                    continue;
                }
                let (Some((u, v)), Some(street)) =
                    (self.network.endpoints(edge), self.network.street(edge))
                else {
                    continue;
                };

                let var = VarId(model.variables.len());
                model.variables.push(FlowVariable {
                    commodity: c,
                    edge,
                    cost: street.length_m / 1000.0 * commodity.cost_per_km,
                });
                model.index.insert((c, edge), var);
                users.entry(edge).or_default().push(var);

                outflow.entry(u).or_default().push((var, 1.0));
                outflow.entry(v).or_default().push((var, -1.0));
                touched.insert(u);
                touched.insert(v);
            }

            for node in touched {
                model.constraints.push(LinearConstraint {
                    kind: ConstraintKind::Conservation { commodity: c, node },
                    terms: outflow.remove(&node).unwrap_or_default(),
                    sense: Sense::Eq,
                    rhs: commodity.supply(node),
                });
            }

            model.commodities.push(commodity);
        }

        for (edge, vars) in users {
            if vars.len() < 2 {
                continue;
            }
            model.constraints.push(LinearConstraint {
                kind: ConstraintKind::EdgeExclusive { edge },
                terms: vars.into_iter().map(|v| (v, 1.0)).collect(),
                sense: Sense::Le,
                rhs: 1.0,
            });
        }

        model
    }
}
