//! Per-street speed capacities.

use petgraph::graph::EdgeIndex;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{ConfigError, SpeedRange};
use crate::network::RoadNetwork;

/// Maximum permissible speed (km/h) of every street segment, indexed by
/// [`EdgeIndex`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EdgeCapacities(Vec<f64>);

impl EdgeCapacities {
    /// Same capacity on every street.
    pub fn uniform(network: &RoadNetwork, kmh: f64) -> Self {
        Self(vec![kmh; network.edge_count()])
    }

    /// Capacity of a street; `None` for an index outside the network.
    pub fn get(&self, edge: EdgeIndex) -> Option<f64> {
        self.0.get(edge.index()).copied()
    }

    /// Overrides one street's capacity. Returns false if the edge is unknown.
    pub fn set(&mut self, edge: EdgeIndex, kmh: f64) -> bool {
        match self.0.get_mut(edge.index()) {
            Some(slot) => {
                *slot = kmh;
                true
            }
            None => false,
        }
    }

    /// Whether a vehicle needing `required_kmh` may use this street.
    pub fn allows(&self, edge: EdgeIndex, required_kmh: f64) -> bool {
        self.get(edge).is_some_and(|cap| required_kmh <= cap)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Draws an independent uniform capacity in `range` for every street.
///
/// # Examples
///
/// ```
/// use ambulance_routing::capacity::assign_capacities;
/// use ambulance_routing::config::SpeedRange;
/// use ambulance_routing::demo_data;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let network = demo_data::diamond_network();
/// let mut rng = StdRng::seed_from_u64(1);
/// let caps = assign_capacities(&network, &SpeedRange::new(20.0, 80.0), &mut rng).unwrap();
///
/// assert_eq!(caps.len(), network.edge_count());
/// assert!(caps.as_slice().iter().all(|c| (20.0..=80.0).contains(c)));
/// ```
pub fn assign_capacities(
    network: &RoadNetwork,
    range: &SpeedRange,
    rng: &mut StdRng,
) -> Result<EdgeCapacities, ConfigError> {
    range.validate("capacity")?;
    let caps = (0..network.edge_count())
        .map(|_| rng.gen_range(range.min_kmh..=range.max_kmh))
        .collect();
    Ok(EdgeCapacities(caps))
}
