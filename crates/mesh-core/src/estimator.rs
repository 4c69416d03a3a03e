//! Position estimation for intermediate traceroute-path nodes that
//! lack their own GPS fix. Link-quality scoring lives in
//! [`crate::engine::decide_link_quality_update`]; this module is the
//! other half of C10.

use crate::model::NodeNum;

const HALF_LIFE_SECS: f64 = 24.0 * 3600.0;
const MAX_PRIOR_ESTIMATES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatedPosition {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PriorEstimate {
    pub position: EstimatedPosition,
    pub age_secs: f64,
}

/// Linear SNR weight, `10^(snr_dB / 10)`.
fn snr_weight(snr_db: f32) -> f64 {
    10f64.powf(snr_db as f64 / 10.0)
}

/// Combine a node's immediate neighbors in a traceroute path into a
/// single position estimate. SNR-weighted linear combination when SNR
/// is known for every neighbor; midpoint (equal weight) otherwise.
pub fn combine_neighbors(neighbors: &[(EstimatedPosition, Option<f32>)]) -> Option<EstimatedPosition> {
    if neighbors.is_empty() {
        return None;
    }
    let all_have_snr = neighbors.iter().all(|(_, snr)| snr.is_some());
    let weights: Vec<f64> = if all_have_snr {
        neighbors.iter().map(|(_, snr)| snr_weight(snr.unwrap())).collect()
    } else {
        vec![1.0; neighbors.len()]
    };
    let total: f64 = weights.iter().sum();
    if total == 0.0 {
        return None;
    }
    let lat = neighbors.iter().zip(&weights).map(|((p, _), w)| p.latitude * w).sum::<f64>() / total;
    let lon = neighbors.iter().zip(&weights).map(|((p, _), w)| p.longitude * w).sum::<f64>() / total;
    Some(EstimatedPosition { latitude: lat, longitude: lon })
}

/// Blend a freshly combined estimate (weight 1) with up to the 10 most
/// recent prior estimates, each weighted by exponential decay over its
/// age with a 24h half-life.
pub fn blend_with_history(new_estimate: EstimatedPosition, priors: &[PriorEstimate]) -> EstimatedPosition {
    let considered = &priors[..priors.len().min(MAX_PRIOR_ESTIMATES)];
    let mut lat_sum = new_estimate.latitude;
    let mut lon_sum = new_estimate.longitude;
    let mut weight_sum = 1.0;

    for prior in considered {
        let weight = 0.5f64.powf(prior.age_secs / HALF_LIFE_SECS);
        lat_sum += prior.position.latitude * weight;
        lon_sum += prior.position.longitude * weight;
        weight_sum += weight;
    }

    EstimatedPosition { latitude: lat_sum / weight_sum, longitude: lon_sum / weight_sum }
}

/// One hop's worth of estimation input: the node being estimated plus
/// its immediate neighbors' positions (already resolved, whether
/// GPS-fixed or themselves estimated) and the SNR toward each.
pub struct HopEstimationInput {
    pub node: NodeNum,
    pub neighbors: Vec<(EstimatedPosition, Option<f32>)>,
}

/// Run estimation for every node along a route (forward or return)
/// that lacks its own fix, given a lookup of already-known fixed
/// positions. Nodes are processed in path order so a freshly estimated
/// node can serve as a neighbor input for the next.
pub fn estimate_route(inputs: &[HopEstimationInput]) -> Vec<(NodeNum, EstimatedPosition)> {
    inputs.iter().filter_map(|hop| combine_neighbors(&hop.neighbors).map(|pos| (hop.node, pos))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snr_weighting_favors_the_stronger_neighbor() {
        let neighbors = vec![(EstimatedPosition { latitude: 0.0, longitude: 0.0 }, Some(20.0)), (EstimatedPosition { latitude: 10.0, longitude: 10.0 }, Some(0.0))];
        let result = combine_neighbors(&neighbors).unwrap();
        assert!(result.latitude < 5.0, "stronger (higher SNR) neighbor should dominate: {}", result.latitude);
    }

    #[test]
    fn missing_snr_falls_back_to_midpoint() {
        let neighbors = vec![(EstimatedPosition { latitude: 0.0, longitude: 0.0 }, Some(20.0)), (EstimatedPosition { latitude: 10.0, longitude: 10.0 }, None)];
        let result = combine_neighbors(&neighbors).unwrap();
        assert_eq!(result.latitude, 5.0);
        assert_eq!(result.longitude, 5.0);
    }

    #[test]
    fn blend_weights_new_estimate_at_one_against_decayed_history() {
        let new_estimate = EstimatedPosition { latitude: 10.0, longitude: 10.0 };
        let priors = vec![PriorEstimate { position: EstimatedPosition { latitude: 0.0, longitude: 0.0 }, age_secs: HALF_LIFE_SECS }];
        let blended = blend_with_history(new_estimate, &priors);
        // prior has decayed to weight 0.5, so new estimate (weight 1) dominates but doesn't fully win
        assert!(blended.latitude > 6.0 && blended.latitude < 10.0);
    }

    #[test]
    fn history_beyond_ten_entries_is_ignored() {
        let new_estimate = EstimatedPosition { latitude: 0.0, longitude: 0.0 };
        let mut priors = vec![PriorEstimate { position: EstimatedPosition { latitude: 100.0, longitude: 100.0 }, age_secs: 0.0 }; 15];
        // cap check: only the first 10 should count, so the result must stay bounded below what 15 would produce
        let blended_15 = blend_with_history(new_estimate, &priors);
        priors.truncate(10);
        let blended_10 = blend_with_history(new_estimate, &priors);
        assert_eq!(blended_15.latitude, blended_10.latitude);
    }
}
