//! Emergencies and the ambulance base.
//!
//! Every emergency starts at the shared base and must reach its destination
//! over streets whose speed capacity is at least its required speed.

use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::config::{ConfigError, SeverityCounts, SpeedRange};
use crate::network::RoadNetwork;

/// Urgency class of an emergency. Ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Leve,
    Media,
    Critica,
}

impl Severity {
    /// Generation order: least urgent first.
    pub const ALL: [Severity; 3] = [Severity::Leve, Severity::Media, Severity::Critica];

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Leve => "Leve",
            Severity::Media => "Media",
            Severity::Critica => "Crítica",
        }
    }

    /// Marker color on the map.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Leve => "green",
            Severity::Media => "orange",
            Severity::Critica => "red",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A request for one ambulance trip from the base.
#[derive(Debug, Clone, PartialEq)]
pub struct Emergency {
    /// Position in the session's emergency list.
    pub index: usize,
    pub severity: Severity,
    pub origin: NodeIndex,
    pub destination: NodeIndex,
    /// Minimum speed in km/h; only streets at least this fast are usable.
    pub required_speed_kmh: f64,
}

impl Emergency {
    /// Display name, `E1` for the first emergency.
    pub fn name(&self) -> String {
        format!("E{}", self.index + 1)
    }
}

/// Picks the ambulance base uniformly among all intersections.
pub fn place_base(network: &RoadNetwork, rng: &mut StdRng) -> Result<NodeIndex, ConfigError> {
    let nodes = network.node_count();
    if nodes == 0 {
        return Err(ConfigError::NotEnoughNodes { nodes, needed: 1 });
    }
    Ok(NodeIndex::new(rng.gen_range(0..nodes)))
}

/// Generates emergencies in severity order, Leve first.
///
/// Destinations are drawn uniformly among intersections other than the
/// base. Reachability is not checked here.
///
/// # Examples
///
/// ```
/// use ambulance_routing::config::{SeverityCounts, SpeedRange};
/// use ambulance_routing::demo_data;
/// use ambulance_routing::emergency::{generate_emergencies, place_base, Severity};
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let network = demo_data::grid_network();
/// let mut rng = StdRng::seed_from_u64(7);
/// let base = place_base(&network, &mut rng).unwrap();
/// let emergencies = generate_emergencies(
///     &network,
///     base,
///     &SeverityCounts::new(2, 0, 1),
///     &SpeedRange::new(30.0, 60.0),
///     &mut rng,
/// )
/// .unwrap();
///
/// assert_eq!(emergencies.len(), 3);
/// assert_eq!(emergencies[2].severity, Severity::Critica);
/// assert!(emergencies.iter().all(|e| e.destination != base));
/// ```
pub fn generate_emergencies(
    network: &RoadNetwork,
    base: NodeIndex,
    counts: &SeverityCounts,
    required_speed: &SpeedRange,
    rng: &mut StdRng,
) -> Result<Vec<Emergency>, ConfigError> {
    counts.validate()?;
    required_speed.validate("required speed")?;

    let total = counts.total();
    if total == 0 {
        return Ok(Vec::new());
    }

    let nodes = network.node_count();
    if nodes < 2 || base.index() >= nodes {
        return Err(ConfigError::NotEnoughNodes { nodes, needed: 2 });
    }

    let mut emergencies = Vec::with_capacity(total);
    for severity in Severity::ALL {
        for _ in 0..counts.for_severity(severity) {
            // Draw from the nodes-minus-one others and skip over the base.
            let mut pick = rng.gen_range(0..nodes - 1);
            if pick >= base.index() {
                pick += 1;
            }
            let speed = rng.gen_range(required_speed.min_kmh..=required_speed.max_kmh);
            emergencies.push(Emergency {
                index: emergencies.len(),
                severity,
                origin: base,
                destination: NodeIndex::new(pick),
                required_speed_kmh: speed,
            });
        }
    }
    Ok(emergencies)
}
