//! Session load balancer.
//!
//! Picks the backend node a session reads from, honoring configured
//! weights and redirect preference lists. Down and quarantined nodes
//! are never picked.

use rand::Rng;

use crate::cluster::BackendNode;
use crate::config::Role;

/// Where a redirect rule points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RedirectTarget {
    /// A concrete node id.
    Node(usize),
    Primary,
    Standby,
}

/// One entry of a redirect preference list,
/// e.g. `prod:standby(0.8)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRule {
    pub pattern: String,
    pub target: RedirectTarget,
    pub weight: f64,
}

impl RedirectRule {
    fn matches(&self, name: &str) -> bool {
        self.pattern == name
    }
}

/// Parse a redirect preference list:
/// `name:target[(weight)][,name:target[(weight)]...]`.
/// Unparseable entries are skipped.
pub fn parse_rules(raw: &str) -> Vec<RedirectRule> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (pattern, target) = entry.split_once(':')?;

            let (target, weight) = match target.split_once('(') {
                Some((target, rest)) => {
                    let weight = rest.trim_end_matches(')').parse::<f64>().ok()?;
                    (target, weight)
                }
                None => (target, 1.0),
            };

            let target = match target.trim() {
                "primary" => RedirectTarget::Primary,
                "standby" => RedirectTarget::Standby,
                id => RedirectTarget::Node(id.parse().ok()?),
            };

            Some(RedirectRule {
                pattern: pattern.trim().to_string(),
                target,
                weight: weight.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Pick the node this session balances reads to.
///
/// The application-name rule wins over the database rule when both
/// match. Falls back to the master node when nothing is selectable
/// by weight.
#[allow(clippy::too_many_arguments)]
pub fn select_node(
    nodes: &[BackendNode],
    primary: Option<usize>,
    master: Option<usize>,
    database: &str,
    application_name: Option<&str>,
    db_rules: &[RedirectRule],
    app_rules: &[RedirectRule],
    rng: &mut impl Rng,
) -> Option<usize> {
    let selectable: Vec<&BackendNode> = nodes.iter().filter(|node| node.live()).collect();

    if selectable.is_empty() {
        return master;
    }

    let rule = application_name
        .and_then(|app| app_rules.iter().find(|rule| rule.matches(app)))
        .or_else(|| db_rules.iter().find(|rule| rule.matches(database)));

    let r = rng.random::<f64>();

    match rule.map(|rule| (rule.target, rule.weight)) {
        Some((RedirectTarget::Node(id), weight)) => {
            let suggested = selectable.iter().any(|node| node.id == id);
            if suggested && r < weight {
                return Some(id);
            }
            let remaining: Vec<&BackendNode> = selectable
                .iter()
                .filter(|node| node.id != id)
                .copied()
                .collect();
            weighted(&remaining, rng)
                .or(if suggested { Some(id) } else { None })
                .or(master)
        }

        Some((RedirectTarget::Primary, weight)) => {
            let primary_live = primary.filter(|id| selectable.iter().any(|n| n.id == *id));
            match primary_live {
                Some(id) if r < weight => Some(id),
                _ => {
                    let standbys: Vec<&BackendNode> = selectable
                        .iter()
                        .filter(|node| Some(node.id) != primary)
                        .copied()
                        .collect();
                    weighted(&standbys, rng).or(primary_live).or(master)
                }
            }
        }

        Some((RedirectTarget::Standby, weight)) => {
            let primary_live = primary.filter(|id| selectable.iter().any(|n| n.id == *id));
            let standbys: Vec<&BackendNode> = selectable
                .iter()
                .filter(|node| Some(node.id) != primary)
                .copied()
                .collect();

            if r < weight {
                weighted(&standbys, rng).or(primary_live).or(master)
            } else {
                primary_live.or_else(|| weighted(&standbys, rng)).or(master)
            }
        }

        None => weighted(&selectable, rng).or(master),
    }
}

/// Weighted random pick. None when the total weight is zero.
fn weighted(candidates: &[&BackendNode], rng: &mut impl Rng) -> Option<usize> {
    let total: f64 = candidates.iter().map(|node| node.weight.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }

    let mut x = rng.random::<f64>() * total;
    for node in candidates {
        x -= node.weight.max(0.0);
        if x < 0.0 {
            return Some(node.id);
        }
    }

    candidates.last().map(|node| node.id)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::NodeStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::SystemTime;

    fn node(id: usize, weight: f64, role: Role, status: NodeStatus) -> BackendNode {
        BackendNode {
            id,
            host: format!("10.0.0.{}", id + 1),
            port: 5432,
            weight,
            role,
            status,
            since: SystemTime::now(),
        }
    }

    fn cluster(weights: &[f64]) -> Vec<BackendNode> {
        weights
            .iter()
            .enumerate()
            .map(|(id, weight)| {
                node(
                    id,
                    *weight,
                    if id == 0 { Role::Primary } else { Role::Standby },
                    NodeStatus::Up,
                )
            })
            .collect()
    }

    fn distribution(
        nodes: &[BackendNode],
        database: &str,
        app: Option<&str>,
        db_rules: &[RedirectRule],
        app_rules: &[RedirectRule],
    ) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = vec![0usize; nodes.len()];
        let iterations = 10_000;

        for _ in 0..iterations {
            let picked = select_node(
                nodes,
                Some(0),
                Some(0),
                database,
                app,
                db_rules,
                app_rules,
                &mut rng,
            )
            .unwrap();
            counts[picked] += 1;
        }

        counts
            .into_iter()
            .map(|count| count as f64 / iterations as f64)
            .collect()
    }

    #[test]
    fn test_parse_rules() {
        let rules = parse_rules("prod:standby(0.8),analytics:2,admin:primary");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].pattern, "prod");
        assert_eq!(rules[0].target, RedirectTarget::Standby);
        assert_eq!(rules[0].weight, 0.8);
        assert_eq!(rules[1].target, RedirectTarget::Node(2));
        assert_eq!(rules[1].weight, 1.0);
        assert_eq!(rules[2].target, RedirectTarget::Primary);

        assert!(parse_rules("garbage").is_empty());
    }

    #[test]
    fn test_weighted_distribution() {
        // Weights [1, 1, 2]: expect 25% / 25% / 50%.
        let nodes = cluster(&[1.0, 1.0, 2.0]);
        let shares = distribution(&nodes, "prod", None, &[], &[]);

        assert!((shares[0] - 0.25).abs() < 0.02, "node 0: {}", shares[0]);
        assert!((shares[1] - 0.25).abs() < 0.02, "node 1: {}", shares[1]);
        assert!((shares[2] - 0.50).abs() < 0.02, "node 2: {}", shares[2]);
    }

    #[test]
    fn test_standby_redirect() {
        // standby(0.8): primary gets the remaining 20%.
        let nodes = cluster(&[1.0, 1.0, 1.0]);
        let rules = parse_rules("prod:standby(0.8)");
        let shares = distribution(&nodes, "prod", None, &rules, &[]);

        assert!((shares[0] - 0.20).abs() < 0.02, "primary: {}", shares[0]);
        assert!((shares[1] - 0.40).abs() < 0.02, "standby 1: {}", shares[1]);
        assert!((shares[2] - 0.40).abs() < 0.02, "standby 2: {}", shares[2]);
    }

    #[test]
    fn test_app_rule_wins_over_database_rule() {
        let nodes = cluster(&[1.0, 1.0]);
        let db_rules = parse_rules("prod:0(1.0)");
        let app_rules = parse_rules("reporting:1(1.0)");

        let shares = distribution(&nodes, "prod", Some("reporting"), &db_rules, &app_rules);
        assert_eq!(shares[1], 1.0);
    }

    #[test]
    fn test_quarantined_never_selected() {
        let mut nodes = cluster(&[1.0, 1.0, 1.0]);
        nodes[2].status = NodeStatus::Quarantined;

        let shares = distribution(&nodes, "prod", None, &[], &[]);
        assert_eq!(shares[2], 0.0);
    }

    #[test]
    fn test_down_never_selected() {
        let mut nodes = cluster(&[1.0, 1.0]);
        nodes[1].status = NodeStatus::Down;

        let shares = distribution(&nodes, "prod", None, &[], &[]);
        assert_eq!(shares[1], 0.0);
        assert_eq!(shares[0], 1.0);
    }

    #[test]
    fn test_zero_weights_fall_back_to_master() {
        let nodes = cluster(&[0.0, 0.0]);
        let mut rng = StdRng::seed_from_u64(1);

        let picked = select_node(&nodes, Some(0), Some(0), "prod", None, &[], &[], &mut rng);
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn test_no_live_nodes_returns_master() {
        let mut nodes = cluster(&[1.0]);
        nodes[0].status = NodeStatus::Down;
        let mut rng = StdRng::seed_from_u64(1);

        let picked = select_node(&nodes, None, None, "prod", None, &[], &[], &mut rng);
        assert_eq!(picked, None);
    }

    #[test]
    fn test_concrete_node_rule() {
        let nodes = cluster(&[1.0, 1.0, 1.0]);
        let rules = parse_rules("analytics:2(1.0)");

        let shares = distribution(&nodes, "analytics", None, &rules, &[]);
        assert_eq!(shares[2], 1.0);
    }
}
