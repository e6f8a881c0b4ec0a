//! Max-min fair division of a finite supply.

/// Split `supply` among consumers with the given `demands`.
///
/// Demands are resolved smallest first. Each gets `min(demand, remaining /
/// unresolved)`, so nobody receives less than the fair share unless it asked
/// for less. The grants never sum to more than `supply`.
pub fn max_min_fair(supply: f64, demands: &[f64]) -> Vec<f64> {
    let mut grants = vec![0.0; demands.len()];
    let mut order: Vec<usize> = (0..demands.len()).collect();
    order.sort_by(|&a, &b| demands[a].total_cmp(&demands[b]));

    let mut remaining = supply.max(0.0);
    for (resolved, &i) in order.iter().enumerate() {
        if remaining <= 0.0 {
            break;
        }
        let unresolved = (demands.len() - resolved) as f64;
        let grant = demands[i].max(0.0).min(remaining / unresolved);
        grants[i] = grant;
        remaining -= grant;
    }
    grants
}
