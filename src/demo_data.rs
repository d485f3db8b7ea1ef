//! Offline demo networks.
//!
//! - DIAMOND: four intersections, two branches of different length
//! - GRID: 6x6 two-way street grid around the Medellín demo center
//!
//! Both work without network access, so the API can be tried and tested
//! without the Overpass service.

use std::str::FromStr;

use crate::config::SessionConfig;
use crate::network::{haversine_distance, Area, RoadNetwork};

/// Grid side length in intersections.
const GRID_SIZE: usize = 6;

/// Grid spacing in degrees, about 110 m.
const GRID_SPACING_DEG: f64 = 0.001;

/// Available demo datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoData {
    Diamond,
    Grid,
}

impl FromStr for DemoData {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DIAMOND" => Ok(DemoData::Diamond),
            "GRID" => Ok(DemoData::Grid),
            _ => Err(()),
        }
    }
}

impl DemoData {
    pub fn name(&self) -> &'static str {
        match self {
            DemoData::Diamond => "DIAMOND",
            DemoData::Grid => "GRID",
        }
    }

    pub fn network(&self) -> RoadNetwork {
        match self {
            DemoData::Diamond => diamond_network(),
            DemoData::Grid => grid_network(),
        }
    }

    /// Seeded configuration so demo sessions are reproducible.
    pub fn config(&self) -> SessionConfig {
        match self {
            DemoData::Diamond => SessionConfig::default().with_seed(0),
            DemoData::Grid => SessionConfig::default().with_seed(42),
        }
    }
}

/// Returns the list of available demo data names.
pub fn available_datasets() -> Vec<&'static str> {
    vec!["DIAMOND", "GRID"]
}

/// Diamond A→B→D, A→C→D.
///
/// The A-B-D branch is 1 km per segment, the A-C-D branch 2 km per segment.
/// Edge indices: 0 = A→B, 1 = B→D, 2 = A→C, 3 = C→D. Node indices follow
/// A, B, C, D.
pub fn diamond_network() -> RoadNetwork {
    let Area {
        latitude: lat,
        longitude: lng,
        ..
    } = Area::default();

    let mut network = RoadNetwork::new();
    let a = network.add_intersection(1, lat, lng);
    let b = network.add_intersection(2, lat + 0.005, lng + 0.005);
    let c = network.add_intersection(3, lat - 0.005, lng + 0.005);
    let d = network.add_intersection(4, lat, lng + 0.01);

    network.add_street(a, b, 1000.0, "primary");
    network.add_street(b, d, 1000.0, "primary");
    network.add_street(a, c, 2000.0, "secondary");
    network.add_street(c, d, 2000.0, "secondary");
    network
}

/// Two-way grid centered on the default area.
pub fn grid_network() -> RoadNetwork {
    let center = Area::default();
    let offset = (GRID_SIZE as f64 - 1.0) / 2.0 * GRID_SPACING_DEG;

    let mut network = RoadNetwork::new();
    let mut nodes = Vec::with_capacity(GRID_SIZE * GRID_SIZE);
    for row in 0..GRID_SIZE {
        for col in 0..GRID_SIZE {
            let lat = center.latitude - offset + row as f64 * GRID_SPACING_DEG;
            let lng = center.longitude - offset + col as f64 * GRID_SPACING_DEG;
            let id = (row * GRID_SIZE + col + 1) as i64;
            nodes.push((network.add_intersection(id, lat, lng), lat, lng));
        }
    }

    let mut connect = |i: usize, j: usize| {
        let (u, lat1, lng1) = nodes[i];
        let (v, lat2, lng2) = nodes[j];
        let length = haversine_distance(lat1, lng1, lat2, lng2);
        network.add_street(u, v, length, "residential");
        network.add_street(v, u, length, "residential");
    };

    for row in 0..GRID_SIZE {
        for col in 0..GRID_SIZE {
            let i = row * GRID_SIZE + col;
            if col + 1 < GRID_SIZE {
                connect(i, i + 1);
            }
            if row + 1 < GRID_SIZE {
                connect(i, i + GRID_SIZE);
            }
        }
    }

    network
}
