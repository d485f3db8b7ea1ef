//! Route shapes for map rendering.
//!
//! Routes are sent as Google encoded polylines (five decimal places).
//! See: <https://developers.google.com/maps/documentation/utilities/polylinealgorithm>

use crate::extract::Route;
use crate::network::RoadNetwork;

/// Encodes `(lat, lng)` pairs as a polyline string.
///
/// # Examples
///
/// ```
/// use ambulance_routing::geometry::encode_polyline;
///
/// assert_eq!(
///     encode_polyline(&[(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)]),
///     "_p~iF~ps|U_ulLnnqC_mqNvxq`@"
/// );
/// assert!(encode_polyline(&[]).is_empty());
/// ```
pub fn encode_polyline(coords: &[(f64, f64)]) -> String {
    let mut out = String::with_capacity(coords.len() * 8);
    let (mut prev_lat, mut prev_lng) = (0i64, 0i64);

    for &(lat, lng) in coords {
        let lat = (lat * 1e5).round() as i64;
        let lng = (lng * 1e5).round() as i64;
        push_value(lat - prev_lat, &mut out);
        push_value(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }
    out
}

fn push_value(value: i64, out: &mut String) {
    let mut v = (if value < 0 { !(value << 1) } else { value << 1 }) as u64;
    while v >= 0x20 {
        out.push(char::from((((v & 0x1f) | 0x20) + 63) as u8));
        v >>= 5;
    }
    out.push(char::from((v + 63) as u8));
}

/// Full drawn shape of a route, street geometries joined end to end.
pub fn route_coordinates(network: &RoadNetwork, route: &Route) -> Vec<(f64, f64)> {
    let mut coords: Vec<(f64, f64)> = Vec::new();

    if route.edges.is_empty() {
        if let Some(node) = route.nodes.first().and_then(|&n| network.intersection(n)) {
            coords.push((node.lat, node.lng));
        }
        return coords;
    }

    for street in route.edges.iter().filter_map(|&e| network.street(e)) {
        let skip = usize::from(coords.last().is_some() && coords.last() == street.geometry.first());
        coords.extend(street.geometry.iter().skip(skip).copied());
    }
    coords
}

/// Encoded polyline of a route.
pub fn encode_route(network: &RoadNetwork, route: &Route) -> String {
    encode_polyline(&route_coordinates(network, route))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::Severity;
    use petgraph::graph::{EdgeIndex, NodeIndex};

    /// Stops at the first malformed pair.
    fn decode_polyline(encoded: &str) -> Vec<(f64, f64)> {
        let mut coords = Vec::new();
        let mut bytes = encoded.bytes();
        let (mut lat, mut lng) = (0i64, 0i64);

        while let Some(dlat) = next_value(&mut bytes) {
            let Some(dlng) = next_value(&mut bytes) else {
                break;
            };
            lat += dlat;
            lng += dlng;
            coords.push((lat as f64 / 1e5, lng as f64 / 1e5));
        }
        coords
    }

    fn next_value(bytes: &mut impl Iterator<Item = u8>) -> Option<i64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let b = bytes.next()?.checked_sub(63)? as u64;
            if shift > 60 {
                return None;
            }
            result |= (b & 0x1f) << shift;
            shift += 5;
            if b < 0x20 {
                break;
            }
        }
        let value = (result >> 1) as i64;
        Some(if result & 1 == 1 { !value } else { value })
    }

    #[test]
    fn test_decode_known_polyline() {
        let coords = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
        assert_eq!(coords, vec![(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)]);
    }

    #[test]
    fn test_decode_truncated_input() {
        // Latitude without longitude.
        assert!(decode_polyline("_p~iF").is_empty());
        assert!(decode_polyline("").is_empty());
    }

    #[test]
    fn test_route_coordinates_join_segments() {
        let mut network = RoadNetwork::new();
        let a = network.add_intersection(1, 6.240, -75.590);
        let b = network.add_intersection(2, 6.241, -75.590);
        let c = network.add_intersection(3, 6.241, -75.589);
        network.add_street_with_geometry(
            a,
            b,
            120.0,
            "residential",
            vec![(6.240, -75.590), (6.2405, -75.5901), (6.241, -75.590)],
        );
        network.add_street(b, c, 110.0, "residential");

        let mut route = Route::trivial(0, Severity::Leve, a, 40.0, 100.0);
        route.edges = vec![EdgeIndex::new(0), EdgeIndex::new(1)];
        route.nodes = vec![a, b, c];

        let coords = route_coordinates(&network, &route);
        assert_eq!(
            coords,
            vec![
                (6.240, -75.590),
                (6.2405, -75.5901),
                (6.241, -75.590),
                (6.241, -75.589)
            ]
        );
        assert_eq!(decode_polyline(&encode_route(&network, &route)).len(), 4);
    }

    #[test]
    fn test_trivial_route_is_single_point() {
        let mut network = RoadNetwork::new();
        let a = network.add_intersection(1, 6.240, -75.590);
        let route = Route::trivial(0, Severity::Media, a, 40.0, 200.0);
        assert_eq!(route_coordinates(&network, &route), vec![(6.240, -75.590)]);
        assert_eq!(route.nodes, vec![NodeIndex::new(0)]);
    }
}
