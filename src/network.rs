//! Street network acquisition using Overpass API and petgraph.
//!
//! Downloads drivable OpenStreetMap ways around a center point and builds a
//! directed multigraph: intersections are nodes, street segments between
//! intersections are edges carrying their length and drawn geometry.
//! Intermediate way nodes that are not shared with another way are folded
//! into the segment geometry, so the graph stays small enough for the flow
//! model. Fetched networks are cached in memory, keyed by area.

use ordered_float::OrderedFloat;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use utoipa::ToSchema;

/// Overpass API URL.
const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Road classes an ambulance can drive on.
const DRIVABLE_HIGHWAYS: &str = "motorway|motorway_link|trunk|trunk_link|primary|primary_link|secondary|secondary_link|tertiary|tertiary_link|residential|unclassified|living_street|service";

/// Failure to obtain a road network from the map data provider.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no drivable roads around ({latitude:.4}, {longitude:.4}) within {radius_m} m")]
    EmptyArea {
        latitude: f64,
        longitude: f64,
        radius_m: f64,
    },
}

/// Circular area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Area {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Area {
    pub fn new(latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            radius_m,
        }
    }

    /// Square bounding box enclosing the circle.
    ///
    /// # Examples
    ///
    /// ```
    /// use ambulance_routing::network::Area;
    ///
    /// let bbox = Area::new(6.2433, -75.5881, 800.0).bounding_box();
    /// assert!(bbox.min_lat < 6.2433 && bbox.max_lat > 6.2433);
    /// assert!(bbox.min_lng < -75.5881 && bbox.max_lng > -75.5881);
    /// ```
    pub fn bounding_box(&self) -> BoundingBox {
        let lat_pad = self.radius_m / METERS_PER_DEGREE;
        let lng_pad = self.radius_m / (METERS_PER_DEGREE * self.latitude.to_radians().cos().max(1e-6));
        BoundingBox {
            min_lat: self.latitude - lat_pad,
            min_lng: self.longitude - lng_pad,
            max_lat: self.latitude + lat_pad,
            max_lng: self.longitude + lng_pad,
        }
    }

    fn cache_key(&self) -> String {
        format!(
            "{:.5}_{:.5}_{:.0}",
            self.latitude, self.longitude, self.radius_m
        )
    }
}

impl Default for Area {
    /// Central Medellín.
    fn default() -> Self {
        Self::new(6.2433, -75.5881, 800.0)
    }
}

/// Bounding box for OSM queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

/// An intersection (or dead end) of the street network.
#[derive(Debug, Clone, PartialEq)]
pub struct Intersection {
    /// OpenStreetMap node id; synthetic for demo networks.
    pub osm_id: i64,
    pub lat: f64,
    pub lng: f64,
}

/// A directed street segment between two intersections.
#[derive(Debug, Clone, PartialEq)]
pub struct Street {
    /// Distinguishes parallel segments between the same pair of intersections.
    pub key: usize,
    /// Length in meters.
    pub length_m: f64,
    /// OSM `highway` class.
    pub highway: String,
    /// Drawn shape (lat, lng), endpoints included.
    pub geometry: Vec<(f64, f64)>,
}

/// Directed multigraph of intersections and street segments.
///
/// Nodes and edges live in a `petgraph` arena addressed by integer indices;
/// everything downstream (capacities, flow variables, routes) refers to
/// streets by [`EdgeIndex`].
#[derive(Debug, Clone, Default)]
pub struct RoadNetwork {
    graph: DiGraph<Intersection, Street>,
    osm_to_node: HashMap<i64, NodeIndex>,
}

impl RoadNetwork {
    /// Creates an empty road network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an intersection, or returns the existing one with the same OSM id.
    pub fn add_intersection(&mut self, osm_id: i64, lat: f64, lng: f64) -> NodeIndex {
        if let Some(&idx) = self.osm_to_node.get(&osm_id) {
            return idx;
        }
        let idx = self.graph.add_node(Intersection { osm_id, lat, lng });
        self.osm_to_node.insert(osm_id, idx);
        idx
    }

    /// Adds a straight street segment; its geometry is the two endpoints.
    pub fn add_street(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        length_m: f64,
        highway: impl Into<String>,
    ) -> EdgeIndex {
        let geometry = [from, to]
            .iter()
            .filter_map(|&n| self.graph.node_weight(n).map(|i| (i.lat, i.lng)))
            .collect();
        self.add_street_with_geometry(from, to, length_m, highway, geometry)
    }

    /// Adds a street segment with an explicit drawn shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use ambulance_routing::network::RoadNetwork;
    ///
    /// let mut network = RoadNetwork::new();
    /// let a = network.add_intersection(1, 6.0, -75.0);
    /// let b = network.add_intersection(2, 6.001, -75.0);
    /// let first = network.add_street(a, b, 110.0, "residential");
    /// let second = network.add_street(a, b, 150.0, "service");
    ///
    /// assert_eq!(network.street(first).unwrap().key, 0);
    /// assert_eq!(network.street(second).unwrap().key, 1);
    /// assert_eq!(network.edge_count(), 2);
    /// ```
    pub fn add_street_with_geometry(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        length_m: f64,
        highway: impl Into<String>,
        geometry: Vec<(f64, f64)>,
    ) -> EdgeIndex {
        let key = self.graph.edges_connecting(from, to).count();
        self.graph.add_edge(
            from,
            to,
            Street {
                key,
                length_m,
                highway: highway.into(),
                geometry,
            },
        )
    }

    /// Returns the number of intersections.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of directed street segments.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn edge_indices(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.graph.edge_indices()
    }

    pub fn intersection(&self, node: NodeIndex) -> Option<&Intersection> {
        self.graph.node_weight(node)
    }

    pub fn node_by_osm_id(&self, osm_id: i64) -> Option<NodeIndex> {
        self.osm_to_node.get(&osm_id).copied()
    }

    pub fn street(&self, edge: EdgeIndex) -> Option<&Street> {
        self.graph.edge_weight(edge)
    }

    /// Source and target intersection of a segment.
    pub fn endpoints(&self, edge: EdgeIndex) -> Option<(NodeIndex, NodeIndex)> {
        self.graph.edge_endpoints(edge)
    }

    /// Outgoing segments of a node as `(edge, target)` pairs.
    pub fn outgoing(&self, node: NodeIndex) -> impl Iterator<Item = (EdgeIndex, NodeIndex)> + '_ {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .map(|e| (e.id(), e.target()))
    }

    /// Breadth-first reachability over the segments accepted by `usable`.
    pub fn reachable<F>(&self, from: NodeIndex, to: NodeIndex, usable: F) -> bool
    where
        F: Fn(EdgeIndex) -> bool,
    {
        if from == to {
            return true;
        }
        let mut visited = vec![false; self.graph.node_count()];
        let mut queue = VecDeque::from([from]);
        if let Some(seen) = visited.get_mut(from.index()) {
            *seen = true;
        }
        while let Some(node) = queue.pop_front() {
            for (edge, next) in self.outgoing(node) {
                if visited[next.index()] || !usable(edge) {
                    continue;
                }
                if next == to {
                    return true;
                }
                visited[next.index()] = true;
                queue.push_back(next);
            }
        }
        false
    }

    /// Finds the intersection nearest to the given coordinates.
    pub fn snap_to_road(&self, lat: f64, lng: f64) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .min_by_key(|&idx| {
                let node = &self.graph[idx];
                OrderedFloat(haversine_distance(lat, lng, node.lat, node.lng))
            })
    }

    /// South-west and north-east corners as `[lat, lng]`.
    pub fn bounds(&self) -> ([f64; 2], [f64; 2]) {
        let mut nodes = self.graph.node_weights();
        let Some(first) = nodes.next() else {
            return ([0.0, 0.0], [0.0, 0.0]);
        };
        let init = ([first.lat, first.lng], [first.lat, first.lng]);
        nodes.fold(init, |(sw, ne), n| {
            (
                [sw[0].min(n.lat), sw[1].min(n.lng)],
                [ne[0].max(n.lat), ne[1].max(n.lng)],
            )
        })
    }

    /// Downloads and builds the road network for an area from Overpass API.
    pub async fn fetch(area: &Area) -> Result<Self, NetworkError> {
        let bbox = area.bounding_box();
        let query = format!(
            r#"[out:json][timeout:120];
(
  way["highway"~"^({})$"]
    ({},{},{},{});
);
(._;>;);
out body;"#,
            DRIVABLE_HIGHWAYS, bbox.min_lat, bbox.min_lng, bbox.max_lat, bbox.max_lng
        );

        debug!("Overpass query:\n{}", query);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(180))
            .user_agent(concat!("ambulance-routing/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::Network(e.to_string()))?;

        info!(
            latitude = area.latitude,
            longitude = area.longitude,
            radius_m = area.radius_m,
            "Requesting street network from Overpass API"
        );

        let response = client
            .post(OVERPASS_URL)
            .body(query)
            .header("Content-Type", "text/plain")
            .send()
            .await
            .map_err(|e| {
                error!("Overpass request failed: {}", e);
                NetworkError::Network(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(NetworkError::Network(format!(
                "Overpass API returned status {}",
                response.status()
            )));
        }

        let osm: OverpassResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::Parse(e.to_string()))?;

        info!("Downloaded {} OSM elements", osm.elements.len());

        let network = Self::from_overpass(&osm);
        if network.edge_count() == 0 {
            return Err(NetworkError::EmptyArea {
                latitude: area.latitude,
                longitude: area.longitude,
                radius_m: area.radius_m,
            });
        }
        Ok(network)
    }

    /// Builds the network from an Overpass JSON document.
    ///
    /// Way nodes become intersections when they end a way or are shared by
    /// several ways; the nodes in between only contribute geometry.
    ///
    /// # Examples
    ///
    /// ```
    /// use ambulance_routing::network::{OverpassResponse, RoadNetwork};
    ///
    /// let json = r#"{"elements": [
    ///     {"type": "node", "id": 1, "lat": 6.2400, "lon": -75.5900},
    ///     {"type": "node", "id": 2, "lat": 6.2410, "lon": -75.5900},
    ///     {"type": "node", "id": 3, "lat": 6.2420, "lon": -75.5900},
    ///     {"type": "way", "id": 10, "nodes": [1, 2, 3],
    ///      "tags": {"highway": "residential", "oneway": "yes"}}
    /// ]}"#;
    /// let osm: OverpassResponse = serde_json::from_str(json).unwrap();
    /// let network = RoadNetwork::from_overpass(&osm);
    ///
    /// // Node 2 is interior to the only way, so it folds into the segment.
    /// assert_eq!(network.node_count(), 2);
    /// assert_eq!(network.edge_count(), 1);
    /// ```
    pub fn from_overpass(osm: &OverpassResponse) -> Self {
        let mut network = Self::new();

        let mut coords: HashMap<i64, (f64, f64)> = HashMap::new();
        for elem in &osm.elements {
            if elem.elem_type == "node" {
                if let (Some(lat), Some(lon)) = (elem.lat, elem.lon) {
                    coords.insert(elem.id, (lat, lon));
                }
            }
        }

        // Keep only ways with at least two resolvable nodes.
        let ways: Vec<(Vec<i64>, &OsmElement)> = osm
            .elements
            .iter()
            .filter(|e| e.elem_type == "way")
            .filter_map(|e| {
                let ids: Vec<i64> = e
                    .nodes
                    .as_deref()?
                    .iter()
                    .copied()
                    .filter(|id| coords.contains_key(id))
                    .collect();
                (ids.len() >= 2).then_some((ids, e))
            })
            .collect();

        let mut references: HashMap<i64, usize> = HashMap::new();
        for (ids, _) in &ways {
            for id in ids {
                *references.entry(*id).or_insert(0) += 1;
            }
        }

        for (ids, way) in &ways {
            let tags = way.tags.as_ref();
            let highway = tags
                .and_then(|t| t.highway.as_deref())
                .unwrap_or("unclassified");
            let direction = Oneway::parse(tags.and_then(|t| t.oneway.as_deref()));
            let last = ids.len() - 1;

            let mut start = 0;
            for i in 1..=last {
                let id = ids[i];
                let is_junction = i == last || references.get(&id).copied().unwrap_or(0) > 1;
                if !is_junction {
                    continue;
                }

                let geometry: Vec<(f64, f64)> = ids[start..=i].iter().map(|id| coords[id]).collect();
                let length: f64 = geometry
                    .windows(2)
                    .map(|w| haversine_distance(w[0].0, w[0].1, w[1].0, w[1].1))
                    .sum();

                let (from_id, to_id) = (ids[start], id);
                start = i;
                if from_id == to_id {
                    continue;
                }

                let (lat1, lng1) = coords[&from_id];
                let (lat2, lng2) = coords[&to_id];
                let from = network.add_intersection(from_id, lat1, lng1);
                let to = network.add_intersection(to_id, lat2, lng2);

                if direction.forward() {
                    network.add_street_with_geometry(from, to, length, highway, geometry.clone());
                }
                if direction.backward() {
                    let reversed = geometry.into_iter().rev().collect();
                    network.add_street_with_geometry(to, from, length, highway, reversed);
                }
            }
        }

        info!(
            nodes = network.node_count(),
            edges = network.edge_count(),
            ways = ways.len(),
            "Built street network"
        );

        network
    }
}

/// In-memory cache of fetched networks keyed by area.
///
/// First request downloads; later sessions over the same area share the
/// same read-only network.
#[derive(Default)]
pub struct NetworkCache {
    networks: RwLock<HashMap<String, Arc<RoadNetwork>>>,
}

impl NetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached network for `area`, downloading it on first use.
    ///
    /// Concurrent requests for the same area wait for the first download
    /// instead of downloading again.
    pub async fn load_or_fetch(&self, area: &Area) -> Result<Arc<RoadNetwork>, NetworkError> {
        let key = area.cache_key();

        if let Some(network) = self.networks.read().await.get(&key) {
            info!("Using cached street network for {}", key);
            return Ok(Arc::clone(network));
        }

        let mut networks = self.networks.write().await;
        if let Some(network) = networks.get(&key) {
            info!("Using cached street network for {}", key);
            return Ok(Arc::clone(network));
        }

        let network = Arc::new(RoadNetwork::fetch(area).await?);
        networks.insert(key, Arc::clone(&network));
        Ok(network)
    }
}

// ============================================================================
// OSM Data Structures (Overpass API)
// ============================================================================

/// Overpass API JSON response.
#[derive(Debug, Deserialize)]
pub struct OverpassResponse {
    pub elements: Vec<OsmElement>,
}

#[derive(Debug, Deserialize)]
pub struct OsmElement {
    #[serde(rename = "type")]
    pub elem_type: String,
    pub id: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub nodes: Option<Vec<i64>>,
    pub tags: Option<OsmTags>,
}

#[derive(Debug, Deserialize)]
pub struct OsmTags {
    pub highway: Option<String>,
    pub oneway: Option<String>,
}

/// Travel directions allowed on a way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Oneway {
    Both,
    Forward,
    Backward,
}

impl Oneway {
    fn parse(tag: Option<&str>) -> Self {
        match tag {
            Some("yes") | Some("1") | Some("true") => Oneway::Forward,
            Some("-1") | Some("reverse") => Oneway::Backward,
            _ => Oneway::Both,
        }
    }

    fn forward(self) -> bool {
        self != Oneway::Backward
    }

    fn backward(self) -> bool {
        self != Oneway::Forward
    }
}

/// Haversine distance between two points in meters.
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlng = (lng2 - lng1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RoadNetwork {
        let osm: OverpassResponse = serde_json::from_str(json).unwrap();
        RoadNetwork::from_overpass(&osm)
    }

    #[test]
    fn test_haversine_distance() {
        // One thousandth of a degree of latitude is about 111 m.
        let dist = haversine_distance(6.2400, -75.5900, 6.2410, -75.5900);
        assert!((dist - 111.2).abs() < 1.0);
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let area = Area::new(6.2433, -75.5881, 800.0);
        let bbox = area.bounding_box();
        let north = haversine_distance(area.latitude, area.longitude, bbox.max_lat, area.longitude);
        let east = haversine_distance(area.latitude, area.longitude, area.latitude, bbox.max_lng);
        assert!((north - 800.0).abs() < 10.0);
        assert!((east - 800.0).abs() < 10.0);
    }

    #[test]
    fn test_empty_network() {
        let network = RoadNetwork::new();
        assert_eq!(network.node_count(), 0);
        assert_eq!(network.edge_count(), 0);
        assert!(network.snap_to_road(6.24, -75.58).is_none());
        assert_eq!(network.bounds(), ([0.0, 0.0], [0.0, 0.0]));
    }

    #[test]
    fn test_two_way_street_adds_both_directions() {
        let network = parse(
            r#"{"elements": [
                {"type": "node", "id": 1, "lat": 6.240, "lon": -75.590},
                {"type": "node", "id": 2, "lat": 6.241, "lon": -75.590},
                {"type": "way", "id": 7, "nodes": [1, 2], "tags": {"highway": "primary"}}
            ]}"#,
        );
        let a = network.node_by_osm_id(1).unwrap();
        let b = network.node_by_osm_id(2).unwrap();
        assert_eq!(network.edge_count(), 2);
        assert_eq!(network.outgoing(a).count(), 1);
        assert_eq!(network.outgoing(b).count(), 1);
        assert!(network.reachable(b, a, |_| true));
    }

    #[test]
    fn test_reverse_oneway() {
        let network = parse(
            r#"{"elements": [
                {"type": "node", "id": 1, "lat": 6.240, "lon": -75.590},
                {"type": "node", "id": 2, "lat": 6.241, "lon": -75.590},
                {"type": "way", "id": 7, "nodes": [1, 2], "tags": {"highway": "primary", "oneway": "-1"}}
            ]}"#,
        );
        let a = network.node_by_osm_id(1).unwrap();
        let b = network.node_by_osm_id(2).unwrap();
        assert!(network.reachable(b, a, |_| true));
        assert!(!network.reachable(a, b, |_| true));
    }

    #[test]
    fn test_shared_node_splits_ways() {
        // Two ways crossing at node 2: 1-2-3 and 4-2-5.
        let network = parse(
            r#"{"elements": [
                {"type": "node", "id": 1, "lat": 6.240, "lon": -75.590},
                {"type": "node", "id": 2, "lat": 6.241, "lon": -75.590},
                {"type": "node", "id": 3, "lat": 6.242, "lon": -75.590},
                {"type": "node", "id": 4, "lat": 6.241, "lon": -75.591},
                {"type": "node", "id": 5, "lat": 6.241, "lon": -75.589},
                {"type": "way", "id": 7, "nodes": [1, 2, 3], "tags": {"highway": "residential", "oneway": "yes"}},
                {"type": "way", "id": 8, "nodes": [4, 2, 5], "tags": {"highway": "residential", "oneway": "yes"}}
            ]}"#,
        );
        assert_eq!(network.node_count(), 5);
        assert_eq!(network.edge_count(), 4);
        let one = network.node_by_osm_id(1).unwrap();
        let five = network.node_by_osm_id(5).unwrap();
        assert!(network.reachable(one, five, |_| true));
    }

    #[test]
    fn test_folded_segment_keeps_geometry_and_length() {
        let network = parse(
            r#"{"elements": [
                {"type": "node", "id": 1, "lat": 6.240, "lon": -75.590},
                {"type": "node", "id": 2, "lat": 6.241, "lon": -75.590},
                {"type": "node", "id": 3, "lat": 6.241, "lon": -75.589},
                {"type": "way", "id": 7, "nodes": [1, 2, 3], "tags": {"highway": "residential", "oneway": "yes"}}
            ]}"#,
        );
        let edge = network.edge_indices().next().unwrap();
        let street = network.street(edge).unwrap();
        assert_eq!(street.geometry.len(), 3);
        let expected = haversine_distance(6.240, -75.590, 6.241, -75.590)
            + haversine_distance(6.241, -75.590, 6.241, -75.589);
        assert!((street.length_m - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reachable_respects_filter() {
        let mut network = RoadNetwork::new();
        let a = network.add_intersection(1, 0.0, 0.0);
        let b = network.add_intersection(2, 0.0, 0.001);
        let c = network.add_intersection(3, 0.0, 0.002);
        let ab = network.add_street(a, b, 100.0, "residential");
        network.add_street(b, c, 100.0, "residential");
        assert!(network.reachable(a, c, |_| true));
        assert!(!network.reachable(a, c, |e| e != ab));
        assert!(!network.reachable(c, a, |_| true));
    }

    #[test]
    fn test_snap_to_road() {
        let mut network = RoadNetwork::new();
        let a = network.add_intersection(1, 6.240, -75.590);
        let b = network.add_intersection(2, 6.250, -75.580);
        assert_eq!(network.snap_to_road(6.2401, -75.5901), Some(a));
        assert_eq!(network.snap_to_road(6.2499, -75.5801), Some(b));
    }
}
