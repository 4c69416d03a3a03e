//! Geofence inside-set computation and entry/exit transition
//! detection. Point-in-polygon uses a standard ray-casting test over a
//! lat/lon polygon; good enough at the scale of a mesh network's
//! geofences, not meant for geodesic precision.

use crate::model::NodeNum;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone)]
pub struct Geofence {
    pub id: u32,
    pub enabled: bool,
    pub vertices: Vec<GeoPoint>,
    /// 0 disables the while-inside per-geofence timer.
    pub while_inside_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeofenceEvent {
    Entered(NodeNum),
    Exited(NodeNum),
    /// A node has stayed inside for at least `while_inside_minutes`
    /// since it last fired (or since it entered, if it hasn't fired yet).
    StillInside(NodeNum),
}

/// Standard ray-casting point-in-polygon test.
pub fn point_in_polygon(point: GeoPoint, polygon: &[GeoPoint]) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let vi = polygon[i];
        let vj = polygon[j];
        let crosses = (vi.lat > point.lat) != (vj.lat > point.lat);
        if crosses {
            let x_intersect = vj.lon + (point.lat - vj.lat) / (vi.lat - vj.lat) * (vi.lon - vj.lon);
            if point.lon < x_intersect {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// The set of nodes currently inside `geofence` given their latest
/// known positions.
pub fn compute_inside_set(geofence: &Geofence, positions: &[(NodeNum, GeoPoint)]) -> HashSet<NodeNum> {
    positions
        .iter()
        .filter(|(_, pos)| point_in_polygon(*pos, &geofence.vertices))
        .map(|(node, _)| *node)
        .collect()
}

/// Diff two inside-sets into entry/exit events. Called with the
/// previous and newly computed sets on every position observation;
/// never called for the boot-time initial set (no events fire then).
pub fn decide_transitions(previous: &HashSet<NodeNum>, current: &HashSet<NodeNum>) -> Vec<GeofenceEvent> {
    let mut events: Vec<GeofenceEvent> = current.difference(previous).map(|n| GeofenceEvent::Entered(*n)).collect();
    events.extend(previous.difference(current).map(|n| GeofenceEvent::Exited(*n)));
    events
}

/// Nodes that have been continuously inside for at least
/// `while_inside_minutes` since `entered_at`, and haven't already fired
/// within the current period (`last_fired`). Re-fires every period a
/// node remains inside, rather than once.
pub fn decide_while_inside_fires(
    while_inside_minutes: u32,
    inside: &HashSet<NodeNum>,
    entered_at: &HashMap<NodeNum, u32>,
    last_fired: &HashMap<NodeNum, u32>,
    now: u32,
) -> Vec<NodeNum> {
    if while_inside_minutes == 0 {
        return Vec::new();
    }
    let period = while_inside_minutes * 60;
    let mut due: Vec<NodeNum> = inside
        .iter()
        .filter(|node| {
            let Some(&entered) = entered_at.get(node) else { return false };
            if now.saturating_sub(entered) < period {
                return false;
            }
            match last_fired.get(node) {
                None => true,
                Some(&last) => now.saturating_sub(last) >= period,
            }
        })
        .copied()
        .collect();
    due.sort_by_key(|n| n.0);
    due
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<GeoPoint> {
        vec![
            GeoPoint { lat: 0.0, lon: 0.0 },
            GeoPoint { lat: 0.0, lon: 10.0 },
            GeoPoint { lat: 10.0, lon: 10.0 },
            GeoPoint { lat: 10.0, lon: 0.0 },
        ]
    }

    #[test]
    fn point_inside_square_is_inside() {
        assert!(point_in_polygon(GeoPoint { lat: 5.0, lon: 5.0 }, &square()));
    }

    #[test]
    fn point_outside_square_is_outside() {
        assert!(!point_in_polygon(GeoPoint { lat: 50.0, lon: 50.0 }, &square()));
    }

    #[test]
    fn boot_time_inside_set_has_no_events_by_construction() {
        let geofence = Geofence { id: 1, enabled: true, vertices: square(), while_inside_minutes: 0 };
        let positions = vec![(NodeNum(1), GeoPoint { lat: 5.0, lon: 5.0 })];
        let inside = compute_inside_set(&geofence, &positions);
        assert!(inside.contains(&NodeNum(1)));
        // the boot path never diffs against a previous set, so no
        // transition computation happens for it at all
    }

    #[test]
    fn entry_and_exit_are_detected() {
        let previous: HashSet<NodeNum> = [NodeNum(1)].into_iter().collect();
        let current: HashSet<NodeNum> = [NodeNum(2)].into_iter().collect();
        let mut events = decide_transitions(&previous, &current);
        events.sort_by_key(|e| match e {
            GeofenceEvent::Entered(n) | GeofenceEvent::Exited(n) | GeofenceEvent::StillInside(n) => n.0,
        });
        assert_eq!(events, vec![GeofenceEvent::Entered(NodeNum(2)), GeofenceEvent::Exited(NodeNum(1))]);
    }

    #[test]
    fn unchanged_membership_fires_nothing() {
        let set: HashSet<NodeNum> = [NodeNum(1)].into_iter().collect();
        assert!(decide_transitions(&set, &set).is_empty());
    }

    #[test]
    fn while_inside_fires_once_per_period_after_dwell() {
        let inside: HashSet<NodeNum> = [NodeNum(1)].into_iter().collect();
        let entered_at: HashMap<NodeNum, u32> = [(NodeNum(1), 1_000)].into_iter().collect();
        let mut last_fired: HashMap<NodeNum, u32> = HashMap::new();

        assert!(decide_while_inside_fires(5, &inside, &entered_at, &last_fired, 1_100).is_empty());

        let due = decide_while_inside_fires(5, &inside, &entered_at, &last_fired, 1_300);
        assert_eq!(due, vec![NodeNum(1)]);

        last_fired.insert(NodeNum(1), 1_300);
        assert!(decide_while_inside_fires(5, &inside, &entered_at, &last_fired, 1_400).is_empty());
        let due_again = decide_while_inside_fires(5, &inside, &entered_at, &last_fired, 1_600);
        assert_eq!(due_again, vec![NodeNum(1)]);
    }

    #[test]
    fn while_inside_disabled_when_minutes_is_zero() {
        let inside: HashSet<NodeNum> = [NodeNum(1)].into_iter().collect();
        let entered_at: HashMap<NodeNum, u32> = [(NodeNum(1), 0)].into_iter().collect();
        assert!(decide_while_inside_fires(0, &inside, &entered_at, &HashMap::new(), 10_000).is_empty());
    }
}
