//! Distance-vector routing over flooded prefix adverts
//!
//! Exits advertise their configured CIDR prefixes and domain patterns at
//! metric 1. Peers re-flood with metric+1, split-horizon, a hop ceiling, and
//! path-sequence loop suppression. Lookup picks the most specific matching
//! prefix, breaking ties on metric and then next-hop ID.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::AgentId;
use crate::WeftError;

/// A destination prefix: CIDR block or domain pattern.
///
/// Domain patterns are either exact (`files.example.com`) or single-label
/// wildcards (`*.example.com`, matching exactly one extra leading label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePrefix {
    Cidr(IpNet),
    Domain(String),
}

impl RoutePrefix {
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        match self {
            RoutePrefix::Cidr(net) => net.contains(&ip),
            RoutePrefix::Domain(_) => false,
        }
    }

    pub fn matches_domain(&self, name: &str) -> bool {
        match self {
            RoutePrefix::Cidr(_) => false,
            RoutePrefix::Domain(pattern) => domain_matches(pattern, name),
        }
    }

    /// Specificity for longest-prefix ordering. CIDRs use their prefix
    /// length; domains use the suffix length, with exact patterns above any
    /// wildcard.
    fn specificity(&self) -> u32 {
        match self {
            RoutePrefix::Cidr(net) => net.prefix_len() as u32,
            RoutePrefix::Domain(pattern) => {
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    suffix.len() as u32
                } else {
                    1000 + pattern.len() as u32
                }
            }
        }
    }
}

impl std::fmt::Display for RoutePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutePrefix::Cidr(net) => write!(f, "{}", net),
            RoutePrefix::Domain(pattern) => write!(f, "{}", pattern),
        }
    }
}

fn domain_matches(pattern: &str, name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // Exactly one extra label; the bare suffix itself does not match.
        match name.strip_suffix(suffix) {
            Some(head) => {
                let head = match head.strip_suffix('.') {
                    Some(h) => h,
                    None => return false,
                };
                !head.is_empty() && !head.contains('.')
            }
            None => false,
        }
    } else {
        pattern == name
    }
}

/// One entry of a CTRL_ROUTE_ADVERT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub prefix: RoutePrefix,
    pub origin: AgentId,
    pub metric: u32,
    /// Ordered agent IDs the advert traversed, origin first.
    pub path: Vec<AgentId>,
}

/// Where a looked-up destination should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// We terminate this destination ourselves (exit role).
    Local,
    /// Forward on the session to this peer.
    Peer(AgentId),
}

#[derive(Debug, Clone)]
struct LearnedRoute {
    prefix: RoutePrefix,
    origin: AgentId,
    next_hop: AgentId,
    metric: u32,
    path: Vec<AgentId>,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct LocalRoute {
    prefix: RoutePrefix,
    dynamic: bool,
}

/// Serializable route view for the observer surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    pub prefix: String,
    pub origin: AgentId,
    pub next_hop: Option<AgentId>,
    pub metric: u32,
    pub expires_in_secs: Option<u64>,
    pub path: Vec<AgentId>,
    pub dynamic: bool,
}

pub struct RouteTable {
    own_id: AgentId,
    max_hops: u32,
    route_ttl: Duration,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    local: Vec<LocalRoute>,
    learned: HashMap<(RoutePrefix, AgentId), LearnedRoute>,
    /// Prefixes evicted by TTL, withdrawn on the next advertise cycle.
    pending_withdraws: Vec<RoutePrefix>,
}

impl RouteTable {
    pub fn new(own_id: AgentId, max_hops: u32, route_ttl: Duration) -> Self {
        Self {
            own_id,
            max_hops,
            route_ttl,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Install a locally-terminated prefix (configured exit route).
    pub fn add_local(&self, prefix: RoutePrefix) {
        let mut inner = self.inner.write();
        if !inner.local.iter().any(|r| r.prefix == prefix) {
            inner.local.push(LocalRoute { prefix, dynamic: false });
        }
    }

    /// Install a dynamic (runtime-managed) local prefix. Re-adding an
    /// existing prefix is a no-op.
    pub fn add_dynamic(&self, prefix: RoutePrefix) {
        let mut inner = self.inner.write();
        if !inner.local.iter().any(|r| r.prefix == prefix) {
            inner.local.push(LocalRoute { prefix, dynamic: true });
        }
    }

    /// Remove a dynamic prefix. Removing one that is absent is an error.
    pub fn remove_dynamic(&self, prefix: &RoutePrefix) -> Result<(), WeftError> {
        let mut inner = self.inner.write();
        let before = inner.local.len();
        inner.local.retain(|r| !(r.dynamic && &r.prefix == prefix));
        if inner.local.len() == before {
            return Err(WeftError::NotFound(format!("no dynamic route {}", prefix)));
        }
        inner.pending_withdraws.push(prefix.clone());
        Ok(())
    }

    /// All locally terminated prefixes, configured and dynamic.
    pub fn local_prefixes(&self) -> Vec<RoutePrefix> {
        self.inner.read().local.iter().map(|r| r.prefix.clone()).collect()
    }

    pub fn dynamic_routes(&self) -> Vec<RoutePrefix> {
        self.inner
            .read()
            .local
            .iter()
            .filter(|r| r.dynamic)
            .map(|r| r.prefix.clone())
            .collect()
    }

    /// Apply one advert received from `from_peer`. Returns true if the table
    /// changed (installed or bettered), false if refreshed or dropped.
    pub fn apply_advert(&self, from_peer: AgentId, advert: &RouteAdvert, now: Instant) -> bool {
        if advert.path.contains(&self.own_id) {
            log::trace!(
                "[ROUTE] Loop-suppressed advert for {} from {}",
                advert.prefix,
                from_peer.short()
            );
            return false;
        }
        let metric = advert.metric.saturating_add(1);
        if metric > self.max_hops {
            log::trace!(
                "[ROUTE] Dropping advert for {}: metric {} exceeds hop ceiling {}",
                advert.prefix,
                metric,
                self.max_hops
            );
            return false;
        }

        let key = (advert.prefix.clone(), advert.origin);
        let expires_at = now + self.route_ttl;
        let mut inner = self.inner.write();
        match inner.learned.get_mut(&key) {
            Some(existing) if existing.next_hop == from_peer && existing.metric <= metric => {
                // Same path, not worse: refresh TTL only.
                existing.expires_at = expires_at;
                false
            }
            Some(existing) if metric <= existing.metric => {
                *existing = LearnedRoute {
                    prefix: advert.prefix.clone(),
                    origin: advert.origin,
                    next_hop: from_peer,
                    metric,
                    path: advert.path.clone(),
                    expires_at,
                };
                true
            }
            Some(_) => false,
            None => {
                inner.learned.insert(
                    key,
                    LearnedRoute {
                        prefix: advert.prefix.clone(),
                        origin: advert.origin,
                        next_hop: from_peer,
                        metric,
                        path: advert.path.clone(),
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Remove entries named by a withdraw from `from_peer`.
    pub fn apply_withdraw(&self, from_peer: AgentId, prefixes: &[RoutePrefix]) {
        let mut inner = self.inner.write();
        inner
            .learned
            .retain(|_, r| !(r.next_hop == from_peer && prefixes.contains(&r.prefix)));
    }

    /// Drop every route learned through `peer`, returning the withdrawn
    /// prefixes for immediate re-advertisement.
    pub fn purge_peer(&self, peer: AgentId) -> Vec<RoutePrefix> {
        let mut inner = self.inner.write();
        let mut gone = Vec::new();
        inner.learned.retain(|_, r| {
            if r.next_hop == peer {
                gone.push(r.prefix.clone());
                false
            } else {
                true
            }
        });
        gone
    }

    /// Evict expired entries; they are withdrawn on the next cycle.
    pub fn expire(&self, now: Instant) {
        let mut inner = self.inner.write();
        let mut gone = Vec::new();
        inner.learned.retain(|_, r| {
            if r.expires_at <= now {
                gone.push(r.prefix.clone());
                false
            } else {
                true
            }
        });
        if !gone.is_empty() {
            log::debug!("[ROUTE] Expired {} stale routes", gone.len());
            inner.pending_withdraws.extend(gone);
        }
    }

    /// Take the prefixes queued for withdrawal.
    pub fn take_pending_withdraws(&self) -> Vec<RoutePrefix> {
        std::mem::take(&mut self.inner.write().pending_withdraws)
    }

    /// Best target for an IP destination. `exclude` drops routes through the
    /// peer a transit request arrived on.
    pub fn lookup_ip(&self, ip: IpAddr, exclude: Option<AgentId>) -> Option<RouteTarget> {
        let inner = self.inner.read();
        if inner.local.iter().any(|r| r.prefix.matches_ip(ip)) {
            return Some(RouteTarget::Local);
        }
        best_learned(&inner, exclude, |p| p.matches_ip(ip))
    }

    /// Best target for a hostname destination.
    pub fn lookup_domain(&self, name: &str, exclude: Option<AgentId>) -> Option<RouteTarget> {
        let inner = self.inner.read();
        if inner.local.iter().any(|r| r.prefix.matches_domain(name)) {
            return Some(RouteTarget::Local);
        }
        best_learned(&inner, exclude, |p| p.matches_domain(name))
    }

    /// Combined lookup: domain patterns first when the caller has a
    /// hostname, otherwise CIDR.
    pub fn lookup(&self, dest: &crate::proto::Destination, exclude: Option<AgentId>) -> Option<RouteTarget> {
        self.lookup_with_metric(dest, exclude).map(|(target, _)| target)
    }

    /// Lookup that also reports the path metric: 0 for locally terminated,
    /// 1 when the next hop is the terminator (single hop, E2E optional).
    pub fn lookup_with_metric(
        &self,
        dest: &crate::proto::Destination,
        exclude: Option<AgentId>,
    ) -> Option<(RouteTarget, u32)> {
        let inner = self.inner.read();
        let matches: Box<dyn Fn(&RoutePrefix) -> bool> = match dest {
            crate::proto::Destination::Domain(name, _) => {
                let name = name.clone();
                Box::new(move |p: &RoutePrefix| p.matches_domain(&name))
            }
            crate::proto::Destination::V4(ip, _) => {
                let ip = IpAddr::V4(*ip);
                Box::new(move |p: &RoutePrefix| p.matches_ip(ip))
            }
            crate::proto::Destination::V6(ip, _) => {
                let ip = IpAddr::V6(*ip);
                Box::new(move |p: &RoutePrefix| p.matches_ip(ip))
            }
        };
        if inner.local.iter().any(|r| matches(&r.prefix)) {
            return Some((RouteTarget::Local, 0));
        }
        inner
            .learned
            .values()
            .filter(|r| Some(r.next_hop) != exclude && matches(&r.prefix))
            .max_by(|a, b| {
                a.prefix
                    .specificity()
                    .cmp(&b.prefix.specificity())
                    .then(b.metric.cmp(&a.metric))
                    .then(b.next_hop.cmp(&a.next_hop))
            })
            .map(|r| (RouteTarget::Peer(r.next_hop), r.metric))
    }

    /// Does a locally-terminated prefix cover this IP? Exit-side check that
    /// resolved addresses stay within what we advertise.
    pub fn local_covers_ip(&self, ip: IpAddr) -> bool {
        self.inner.read().local.iter().any(|r| r.prefix.matches_ip(ip))
    }

    pub fn local_covers_domain(&self, name: &str) -> bool {
        self.inner
            .read()
            .local
            .iter()
            .any(|r| r.prefix.matches_domain(name))
    }

    /// Adverts to send to `peer`: local routes at metric 1 plus learned
    /// routes, split-horizon, with ourselves appended to the path.
    pub fn adverts_for(&self, peer: AgentId) -> Vec<RouteAdvert> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.local.len() + inner.learned.len());
        for local in &inner.local {
            out.push(RouteAdvert {
                prefix: local.prefix.clone(),
                origin: self.own_id,
                metric: 1,
                path: vec![self.own_id],
            });
        }
        for route in inner.learned.values() {
            if route.next_hop == peer {
                continue;
            }
            let mut path = route.path.clone();
            path.push(self.own_id);
            out.push(RouteAdvert {
                prefix: route.prefix.clone(),
                origin: route.origin,
                metric: route.metric,
                path,
            });
        }
        out
    }

    /// Locally originated adverts only (what an exit offers the mesh).
    pub fn local_adverts(&self) -> Vec<RouteAdvert> {
        let inner = self.inner.read();
        inner
            .local
            .iter()
            .map(|r| RouteAdvert {
                prefix: r.prefix.clone(),
                origin: self.own_id,
                metric: 1,
                path: vec![self.own_id],
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.local.len() + inner.learned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for the observer surface.
    pub fn views(&self, now: Instant) -> Vec<RouteView> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for local in &inner.local {
            out.push(RouteView {
                prefix: local.prefix.to_string(),
                origin: self.own_id,
                next_hop: None,
                metric: 0,
                expires_in_secs: None,
                path: vec![self.own_id],
                dynamic: local.dynamic,
            });
        }
        for route in inner.learned.values() {
            out.push(RouteView {
                prefix: route.prefix.to_string(),
                origin: route.origin,
                next_hop: Some(route.next_hop),
                metric: route.metric,
                expires_in_secs: Some(route.expires_at.saturating_duration_since(now).as_secs()),
                path: route.path.clone(),
                dynamic: false,
            });
        }
        out
    }
}

fn best_learned<F>(inner: &Inner, exclude: Option<AgentId>, matches: F) -> Option<RouteTarget>
where
    F: Fn(&RoutePrefix) -> bool,
{
    inner
        .learned
        .values()
        .filter(|r| Some(r.next_hop) != exclude && matches(&r.prefix))
        .max_by(|a, b| {
            a.prefix
                .specificity()
                .cmp(&b.prefix.specificity())
                // Lower metric preferred, then lower next-hop ID; both
                // inverted because max_by keeps the greater element.
                .then(b.metric.cmp(&a.metric))
                .then(b.next_hop.cmp(&a.next_hop))
        })
        .map(|r| RouteTarget::Peer(r.next_hop))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(own: AgentId) -> RouteTable {
        RouteTable::new(own, 8, Duration::from_secs(300))
    }

    fn cidr(s: &str) -> RoutePrefix {
        RoutePrefix::Cidr(s.parse().unwrap())
    }

    fn advert(prefix: RoutePrefix, origin: AgentId, metric: u32, path: Vec<AgentId>) -> RouteAdvert {
        RouteAdvert { prefix, origin, metric, path }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let origin = AgentId([2; 16]);
        let coarse_hop = AgentId([3; 16]);
        let fine_hop = AgentId([4; 16]);
        let now = Instant::now();

        t.apply_advert(coarse_hop, &advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]), now);
        t.apply_advert(fine_hop, &advert(cidr("10.1.0.0/16"), origin, 3, vec![origin]), now);

        // /16 beats /8 despite the worse metric.
        assert_eq!(
            t.lookup_ip("10.1.2.3".parse().unwrap(), None),
            Some(RouteTarget::Peer(fine_hop))
        );
        assert_eq!(
            t.lookup_ip("10.200.0.1".parse().unwrap(), None),
            Some(RouteTarget::Peer(coarse_hop))
        );
    }

    #[test]
    fn test_tie_breaks_metric_then_id() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let origin_a = AgentId([2; 16]);
        let origin_b = AgentId([3; 16]);
        let hop_hi = AgentId([9; 16]);
        let hop_lo = AgentId([4; 16]);
        let now = Instant::now();

        t.apply_advert(hop_hi, &advert(cidr("10.0.0.0/8"), origin_a, 2, vec![origin_a]), now);
        t.apply_advert(hop_lo, &advert(cidr("10.0.0.0/8"), origin_b, 1, vec![origin_b]), now);
        assert_eq!(
            t.lookup_ip("10.1.1.1".parse().unwrap(), None),
            Some(RouteTarget::Peer(hop_lo))
        );

        // Equal metric: lowest next-hop ID.
        let t = table(own);
        t.apply_advert(hop_hi, &advert(cidr("10.0.0.0/8"), origin_a, 1, vec![origin_a]), now);
        t.apply_advert(hop_lo, &advert(cidr("10.0.0.0/8"), origin_b, 1, vec![origin_b]), now);
        assert_eq!(
            t.lookup_ip("10.1.1.1".parse().unwrap(), None),
            Some(RouteTarget::Peer(hop_lo))
        );
    }

    #[test]
    fn test_loop_suppression() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let peer = AgentId([2; 16]);
        let origin = AgentId([3; 16]);
        let looped = advert(cidr("10.0.0.0/8"), origin, 2, vec![origin, own, peer]);
        assert!(!t.apply_advert(peer, &looped, Instant::now()));
        assert!(t.is_empty());
    }

    #[test]
    fn test_hop_ceiling() {
        let own = AgentId([1; 16]);
        let t = RouteTable::new(own, 3, Duration::from_secs(300));
        let peer = AgentId([2; 16]);
        let origin = AgentId([3; 16]);
        assert!(!t.apply_advert(peer, &advert(cidr("10.0.0.0/8"), origin, 3, vec![origin]), Instant::now()));
        assert!(t.apply_advert(peer, &advert(cidr("10.0.0.0/8"), origin, 2, vec![origin]), Instant::now()));
    }

    #[test]
    fn test_ttl_expiry_queues_withdraw() {
        let own = AgentId([1; 16]);
        let t = RouteTable::new(own, 8, Duration::from_secs(10));
        let peer = AgentId([2; 16]);
        let origin = AgentId([3; 16]);
        let now = Instant::now();
        t.apply_advert(peer, &advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]), now);

        t.expire(now + Duration::from_secs(5));
        assert_eq!(t.len(), 1);

        t.expire(now + Duration::from_secs(11));
        assert!(t.is_empty());
        assert_eq!(t.take_pending_withdraws(), vec![cidr("10.0.0.0/8")]);
        assert!(t.take_pending_withdraws().is_empty());
    }

    #[test]
    fn test_refresh_extends_ttl() {
        let own = AgentId([1; 16]);
        let t = RouteTable::new(own, 8, Duration::from_secs(10));
        let peer = AgentId([2; 16]);
        let origin = AgentId([3; 16]);
        let now = Instant::now();
        let a = advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]);

        t.apply_advert(peer, &a, now);
        t.apply_advert(peer, &a, now + Duration::from_secs(8));
        t.expire(now + Duration::from_secs(11));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_purge_peer() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let peer_a = AgentId([2; 16]);
        let peer_b = AgentId([3; 16]);
        let origin = AgentId([4; 16]);
        let now = Instant::now();

        t.apply_advert(peer_a, &advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]), now);
        t.apply_advert(peer_b, &advert(cidr("172.16.0.0/12"), origin, 1, vec![origin]), now);

        let gone = t.purge_peer(peer_a);
        assert_eq!(gone, vec![cidr("10.0.0.0/8")]);
        assert!(t.lookup_ip("10.1.1.1".parse().unwrap(), None).is_none());
        assert!(t.lookup_ip("172.16.1.1".parse().unwrap(), None).is_some());
    }

    #[test]
    fn test_split_horizon() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let peer = AgentId([2; 16]);
        let other = AgentId([3; 16]);
        let origin = AgentId([4; 16]);
        let now = Instant::now();

        t.apply_advert(peer, &advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]), now);

        assert!(t.adverts_for(peer).is_empty());
        let for_other = t.adverts_for(other);
        assert_eq!(for_other.len(), 1);
        assert_eq!(for_other[0].path, vec![origin, own]);
    }

    #[test]
    fn test_domain_matching() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("example.com", "EXAMPLE.COM"));
        assert!(!domain_matches("example.com", "www.example.com"));
        assert!(domain_matches("*.example.com", "www.example.com"));
        assert!(!domain_matches("*.example.com", "example.com"));
        assert!(!domain_matches("*.example.com", "a.b.example.com"));
        assert!(!domain_matches("*.example.com", "notexample.com"));
    }

    #[test]
    fn test_domain_lookup_prefers_exact() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let origin = AgentId([2; 16]);
        let wild_hop = AgentId([3; 16]);
        let exact_hop = AgentId([4; 16]);
        let now = Instant::now();

        t.apply_advert(
            wild_hop,
            &advert(RoutePrefix::Domain("*.example.com".into()), origin, 1, vec![origin]),
            now,
        );
        t.apply_advert(
            exact_hop,
            &advert(RoutePrefix::Domain("www.example.com".into()), origin, 2, vec![origin]),
            now,
        );

        assert_eq!(
            t.lookup_domain("www.example.com", None),
            Some(RouteTarget::Peer(exact_hop))
        );
        assert_eq!(
            t.lookup_domain("api.example.com", None),
            Some(RouteTarget::Peer(wild_hop))
        );
    }

    #[test]
    fn test_dynamic_route_idempotence() {
        let own = AgentId([1; 16]);
        let t = table(own);
        t.add_dynamic(cidr("192.168.0.0/16"));
        t.add_dynamic(cidr("192.168.0.0/16"));
        assert_eq!(t.dynamic_routes().len(), 1);

        t.remove_dynamic(&cidr("192.168.0.0/16")).unwrap();
        assert!(t.remove_dynamic(&cidr("192.168.0.0/16")).is_err());
    }

    #[test]
    fn test_exclude_arrival_peer() {
        let own = AgentId([1; 16]);
        let t = table(own);
        let peer = AgentId([2; 16]);
        let origin = AgentId([3; 16]);
        t.apply_advert(peer, &advert(cidr("10.0.0.0/8"), origin, 1, vec![origin]), Instant::now());

        assert!(t.lookup_ip("10.1.1.1".parse().unwrap(), Some(peer)).is_none());
    }

    #[test]
    fn test_local_route_terminates() {
        let own = AgentId([1; 16]);
        let t = table(own);
        t.add_local(cidr("10.0.0.0/8"));
        assert_eq!(t.lookup_ip("10.1.1.1".parse().unwrap(), None), Some(RouteTarget::Local));
        assert!(t.local_covers_ip("10.9.9.9".parse().unwrap()));
        assert!(!t.local_covers_ip("11.0.0.1".parse().unwrap()));
    }
}
