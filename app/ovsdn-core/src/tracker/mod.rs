use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use kube::ResourceExt;
use log::{debug, info, warn};

use crate::ip::{generate_default_gateway, parse_ipv4, parse_ipv4_net};
use crate::resources::crd::v1::{HostSubnet, NetNamespace};

pub mod ping;

pub type Vnid = u32;

/// A single `{node IP, egress IP}` pair in a namespace's active assignment
/// list. The namespace's outbound traffic is steered to `node_ip` and leaves
/// the cluster with `egress_ip` as its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EgressIpAssignment {
    pub node_ip: Ipv4Addr,
    pub egress_ip: Ipv4Addr,
}

/// Receives egress IP state transitions from the [`EgressIpTracker`].
///
/// Callbacks are invoked synchronously from inside the tracker's critical
/// section. Implementations must return quickly, must not block on I/O, and
/// must not call back into the tracker; work that needs either belongs on a
/// separate task.
///
/// For any egress IP, `release_egress_ip` is always delivered before the next
/// `claim_egress_ip`, so an observer never holds two claims for the same IP.
pub trait EgressIpObserver: Send {
    /// `egress_ip` is now hosted by `node_ip` on behalf of namespace `vnid`.
    fn claim_egress_ip(&mut self, vnid: Vnid, egress_ip: Ipv4Addr, node_ip: Ipv4Addr);

    /// The prior claim of `egress_ip` by `node_ip` is withdrawn.
    fn release_egress_ip(&mut self, egress_ip: Ipv4Addr, node_ip: Ipv4Addr);

    /// The namespace requests no egress IPs; its traffic egresses normally.
    fn set_namespace_egress_normal(&mut self, vnid: Vnid);

    /// The namespace requests egress IPs but none is usable; its outbound
    /// traffic must be dropped.
    fn set_namespace_egress_dropped(&mut self, vnid: Vnid);

    /// The namespace's outbound traffic egresses via the listed assignments,
    /// in preference order.
    fn set_namespace_egress_via_egress_ips(
        &mut self,
        vnid: Vnid,
        assignments: &[EgressIpAssignment],
    );

    /// Automatic CIDR-based reallocation should be reconsidered.
    fn update_egress_cidrs(&mut self);

    /// The first full resync of both watched object types has completed.
    fn synced(&mut self);
}

#[derive(Debug)]
struct NodeEgress {
    name: String,
    node_ip: Ipv4Addr,
    sdn_ip: Option<Ipv4Addr>,
    offline: bool,
    requested_ips: HashSet<Ipv4Addr>,
    requested_cidrs: Vec<Ipv4Net>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EgressMode {
    Normal,
    Dropped,
    ViaEgressIps,
}

#[derive(Debug)]
struct NamespaceEgress {
    requested_ips: Vec<Ipv4Addr>,
    active_egress_ips: Vec<EgressIpAssignment>,
    mode: EgressMode,
}

impl NamespaceEgress {
    fn new() -> Self {
        Self {
            requested_ips: Vec::new(),
            active_egress_ips: Vec::new(),
            mode: EgressMode::Normal,
        }
    }
}

#[derive(Debug, Default)]
struct EgressIpInfo {
    /// Names of the nodes whose HostSubnet lists this IP, in observation
    /// order. Anything other than exactly one entry is a hosting conflict.
    nodes: Vec<String>,
    /// VNIDs of the namespaces requesting this IP, in observation order.
    /// Anything other than exactly one entry is a request conflict.
    namespaces: Vec<Vnid>,
    /// `(vnid, node_ip)` of the claim currently held by the observer.
    assigned: Option<(Vnid, Ipv4Addr)>,
}

/// Reconciles HostSubnet and NetNamespace state into a consistent assignment
/// of each egress IP to a hosting node and a requesting namespace, and into a
/// routing mode per namespace. All transitions are reported through the
/// [`EgressIpObserver`] passed at construction.
pub struct EgressIpTracker {
    observer: Box<dyn EgressIpObserver>,

    nodes: BTreeMap<String, NodeEgress>,
    node_names_by_ip: HashMap<Ipv4Addr, String>,
    namespaces_by_vnid: HashMap<Vnid, NamespaceEgress>,
    egress_ips: HashMap<Ipv4Addr, EgressIpInfo>,

    changed_egress_ips: HashSet<Ipv4Addr>,
    changed_namespaces: HashSet<Vnid>,
    reallocation_pending: bool,

    host_subnets_synced: bool,
    net_namespaces_synced: bool,
    synced_delivered: bool,
}

impl EgressIpTracker {
    pub fn new(observer: Box<dyn EgressIpObserver>) -> Self {
        Self {
            observer,
            nodes: BTreeMap::new(),
            node_names_by_ip: HashMap::new(),
            namespaces_by_vnid: HashMap::new(),
            egress_ips: HashMap::new(),
            changed_egress_ips: HashSet::new(),
            changed_namespaces: HashSet::new(),
            reallocation_pending: false,
            host_subnets_synced: false,
            net_namespaces_synced: false,
            synced_delivered: false,
        }
    }

    // ── HostSubnet events ───────────────────────────────────────────────

    pub fn host_subnet_applied(&mut self, subnet: &HostSubnet) {
        let name = subnet.name_any();
        let host_ip = match parse_ipv4(&subnet.spec.host_ip) {
            Ok(ip) => ip,
            Err(error) => {
                warn!("Ignoring HostSubnet '{name}': {error}");
                self.remove_node(&name);
                self.sync();
                return;
            }
        };
        let sdn_ip = subnet
            .spec
            .subnet
            .parse::<Ipv4Net>()
            .ok()
            .map(generate_default_gateway);

        match self.nodes.get(&name) {
            Some(node) if node.node_ip != host_ip => {
                info!("Node '{name}' changed IP from {} to {host_ip}", node.node_ip);
                let old_ip = node.node_ip;
                self.node_names_by_ip.remove(&old_ip);
                self.node_names_by_ip.insert(host_ip, name.clone());
                let node = self.nodes.get_mut(&name).unwrap();
                node.node_ip = host_ip;
                let hosted: Vec<_> = node.requested_ips.iter().copied().collect();
                for ip in hosted {
                    self.mark_egress_ip_changed(ip);
                }
            }
            Some(_) => {}
            None => {
                self.nodes.insert(
                    name.clone(),
                    NodeEgress {
                        name: name.clone(),
                        node_ip: host_ip,
                        sdn_ip,
                        offline: false,
                        requested_ips: HashSet::new(),
                        requested_cidrs: Vec::new(),
                    },
                );
                self.node_names_by_ip.insert(host_ip, name.clone());
            }
        }
        self.nodes.get_mut(&name).unwrap().sdn_ip = sdn_ip;

        let mut requested_ips = Vec::new();
        for raw in subnet.egress_ips() {
            match parse_ipv4(raw) {
                Ok(ip) if ip == host_ip => {
                    warn!("Ignoring egress IP {ip} on node '{name}': it is the node's primary IP!")
                }
                Ok(ip) if Some(ip) == sdn_ip => {
                    warn!("Ignoring egress IP {ip} on node '{name}': it is the node's SDN gateway!")
                }
                Ok(ip) => requested_ips.push(ip),
                Err(error) => warn!("Ignoring egress IP on node '{name}': {error}"),
            }
        }
        let mut requested_cidrs = Vec::new();
        for raw in subnet.egress_cidrs() {
            match parse_ipv4_net(raw) {
                Ok(cidr) => requested_cidrs.push(cidr),
                Err(error) => warn!("Ignoring egress CIDR on node '{name}': {error}"),
            }
        }

        let old_ips = self.nodes[&name].requested_ips.clone();
        let new_ips: HashSet<Ipv4Addr> = requested_ips.iter().copied().collect();
        let removed: Vec<_> = old_ips.difference(&new_ips).copied().collect();
        let added: Vec<_> = new_ips.difference(&old_ips).copied().collect();
        for ip in removed {
            self.node_egress_ip_removed(&name, ip);
        }
        for ip in added {
            self.node_egress_ip_added(&name, ip);
        }

        let old_cidrs: HashSet<Ipv4Net> =
            self.nodes[&name].requested_cidrs.iter().copied().collect();
        let new_cidrs: HashSet<Ipv4Net> = requested_cidrs.iter().copied().collect();
        if old_cidrs != new_cidrs {
            self.nodes.get_mut(&name).unwrap().requested_cidrs = requested_cidrs;
            self.reallocation_pending = true;
        }

        self.sync();
    }

    pub fn host_subnet_deleted(&mut self, subnet: &HostSubnet) {
        self.remove_node(&subnet.name_any());
        self.sync();
    }

    /// Applies a full relisting of HostSubnets, removing nodes that are no
    /// longer present, and marks the HostSubnet side of the initial resync
    /// as complete.
    pub fn host_subnets_resynced(&mut self, subnets: &[HostSubnet]) {
        let listed: HashSet<String> = subnets.iter().map(|subnet| subnet.name_any()).collect();
        let stale: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_node(&name);
        }
        for subnet in subnets {
            self.host_subnet_applied(subnet);
        }
        self.sync();
        self.host_subnets_synced = true;
        self.maybe_deliver_synced();
    }

    fn remove_node(&mut self, name: &str) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        let node_ip = node.node_ip;
        let had_cidrs = !node.requested_cidrs.is_empty();
        let hosted: Vec<_> = node.requested_ips.iter().copied().collect();
        for ip in hosted {
            self.node_egress_ip_removed(name, ip);
        }
        if had_cidrs {
            self.reallocation_pending = true;
        }
        self.nodes.remove(name);
        self.node_names_by_ip.remove(&node_ip);
    }

    fn node_egress_ip_added(&mut self, name: &str, ip: Ipv4Addr) {
        self.nodes.get_mut(name).unwrap().requested_ips.insert(ip);
        let info = self.egress_ips.entry(ip).or_default();
        if !info.nodes.iter().any(|node| node == name) {
            info.nodes.push(name.to_owned());
        }
        self.mark_egress_ip_changed(ip);
    }

    fn node_egress_ip_removed(&mut self, name: &str, ip: Ipv4Addr) {
        self.nodes.get_mut(name).unwrap().requested_ips.remove(&ip);
        if let Some(info) = self.egress_ips.get_mut(&ip) {
            info.nodes.retain(|node| node != name);
        }
        self.mark_egress_ip_changed(ip);
    }

    // ── NetNamespace events ─────────────────────────────────────────────

    pub fn net_namespace_applied(&mut self, netns: &NetNamespace) {
        let vnid = netns.spec.netid;

        let mut requested = Vec::new();
        for raw in netns.egress_ips() {
            match parse_ipv4(raw) {
                Ok(ip) if requested.contains(&ip) => {
                    warn!("Ignoring duplicate egress IP {ip} on VNID {vnid}")
                }
                Ok(ip) => requested.push(ip),
                Err(error) => warn!("Ignoring egress IP on VNID {vnid}: {error}"),
            }
        }

        if requested.is_empty() {
            self.remove_namespace(vnid);
            self.sync();
            return;
        }

        let existing = self
            .namespaces_by_vnid
            .get(&vnid)
            .map(|ns| ns.requested_ips.clone())
            .unwrap_or_default();
        if existing != requested {
            let removed: Vec<_> = existing
                .iter()
                .copied()
                .filter(|ip| !requested.contains(ip))
                .collect();
            let added: Vec<_> = requested
                .iter()
                .copied()
                .filter(|ip| !existing.contains(ip))
                .collect();
            for ip in removed {
                self.namespace_egress_ip_removed(vnid, ip);
            }
            self.namespaces_by_vnid
                .entry(vnid)
                .or_insert_with(NamespaceEgress::new)
                .requested_ips = requested;
            for ip in added {
                self.namespace_egress_ip_added(vnid, ip);
            }
            self.changed_namespaces.insert(vnid);
        }

        self.sync();
    }

    pub fn net_namespace_deleted(&mut self, netns: &NetNamespace) {
        self.remove_namespace(netns.spec.netid);
        self.sync();
    }

    /// Applies a full relisting of NetNamespaces, removing namespaces that
    /// are no longer present, and marks the NetNamespace side of the initial
    /// resync as complete.
    pub fn net_namespaces_resynced(&mut self, namespaces: &[NetNamespace]) {
        let listed: HashSet<Vnid> = namespaces.iter().map(|netns| netns.spec.netid).collect();
        let stale: Vec<Vnid> = self
            .namespaces_by_vnid
            .keys()
            .filter(|vnid| !listed.contains(vnid))
            .copied()
            .collect();
        for vnid in stale {
            self.remove_namespace(vnid);
        }
        for netns in namespaces {
            self.net_namespace_applied(netns);
        }
        self.sync();
        self.net_namespaces_synced = true;
        self.maybe_deliver_synced();
    }

    fn remove_namespace(&mut self, vnid: Vnid) {
        let Some(ns) = self.namespaces_by_vnid.get(&vnid) else {
            return;
        };
        let requested = ns.requested_ips.clone();
        for ip in requested {
            self.namespace_egress_ip_removed(vnid, ip);
        }
        if let Some(ns) = self.namespaces_by_vnid.get_mut(&vnid) {
            ns.requested_ips.clear();
        }
        self.changed_namespaces.insert(vnid);
    }

    fn namespace_egress_ip_added(&mut self, vnid: Vnid, ip: Ipv4Addr) {
        let info = self.egress_ips.entry(ip).or_default();
        if !info.namespaces.contains(&vnid) {
            info.namespaces.push(vnid);
        }
        self.mark_egress_ip_changed(ip);
    }

    fn namespace_egress_ip_removed(&mut self, vnid: Vnid, ip: Ipv4Addr) {
        if let Some(info) = self.egress_ips.get_mut(&ip) {
            info.namespaces.retain(|ns| *ns != vnid);
        }
        self.mark_egress_ip_changed(ip);
    }

    // ── Node liveness ───────────────────────────────────────────────────

    /// Marks a node offline or back online and re-evaluates every egress IP
    /// and namespace that depended on it.
    pub fn set_node_offline(&mut self, node_ip: Ipv4Addr, offline: bool) {
        let Some(name) = self.node_names_by_ip.get(&node_ip).cloned() else {
            return;
        };
        let node = self.nodes.get_mut(&name).unwrap();
        node.offline = offline;
        info!(
            "Node {node_ip} is {}",
            if offline { "offline" } else { "back online" }
        );
        let hosted: Vec<_> = node.requested_ips.iter().copied().collect();
        for ip in hosted {
            self.mark_egress_ip_changed(ip);
        }
        if !self.nodes[&name].requested_cidrs.is_empty() {
            self.reallocation_pending = true;
        }
        self.sync();
    }

    /// The address a liveness probe for `node_ip` should dial: the node's SDN
    /// gateway when its pod subnet is known (egress traffic flows over the
    /// SDN), otherwise the node IP itself. `None` when the node is unknown,
    /// which callers must treat as unreachable.
    pub fn ping_target(&self, node_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let name = self.node_names_by_ip.get(&node_ip)?;
        let node = self.nodes.get(name)?;
        Some(node.sdn_ip.unwrap_or(node.node_ip))
    }

    // ── Resync gating ───────────────────────────────────────────────────

    fn maybe_deliver_synced(&mut self) {
        if self.host_subnets_synced && self.net_namespaces_synced && !self.synced_delivered {
            self.synced_delivered = true;
            info!("Initial egress IP state synchronized");
            self.observer.synced();
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    fn mark_egress_ip_changed(&mut self, ip: Ipv4Addr) {
        self.changed_egress_ips.insert(ip);
        if let Some(info) = self.egress_ips.get(&ip) {
            self.changed_namespaces
                .extend(info.namespaces.iter().copied());
        }
    }

    fn sync(&mut self) {
        let mut changed_ips: Vec<Ipv4Addr> = self.changed_egress_ips.drain().collect();
        changed_ips.sort_unstable();
        let mut changed_vnids: Vec<Vnid> = self.changed_namespaces.drain().collect();
        changed_vnids.sort_unstable();

        for ip in changed_ips {
            self.sync_egress_ip_state(ip);
        }
        for vnid in changed_vnids {
            self.sync_namespace_state(vnid);
        }

        if self.reallocation_pending {
            self.reallocation_pending = false;
            self.observer.update_egress_cidrs();
        }
    }

    fn sync_egress_ip_state(&mut self, ip: Ipv4Addr) {
        let (claim, assigned) = {
            let Some(info) = self.egress_ips.get(&ip) else {
                return;
            };
            if info.nodes.len() > 1 {
                debug!("Egress IP {ip} is hosted by multiple nodes: {:?}", info.nodes);
            }
            if info.namespaces.len() > 1 {
                debug!(
                    "Egress IP {ip} is requested by multiple namespaces: {:?}",
                    info.namespaces
                );
            }
            let claim = match (info.nodes.as_slice(), info.namespaces.as_slice()) {
                ([node_name], [vnid]) => match self.nodes.get(node_name) {
                    Some(node) if !node.offline => Some((*vnid, node.node_ip)),
                    _ => None,
                },
                _ => None,
            };
            (claim, info.assigned)
        };

        if claim != assigned {
            // release first, so no observer ever holds two claims for one IP
            if let Some((_, node_ip)) = assigned {
                self.observer.release_egress_ip(ip, node_ip);
            }
            if let Some((vnid, node_ip)) = claim {
                self.observer.claim_egress_ip(vnid, ip, node_ip);
            }
            self.egress_ips.get_mut(&ip).unwrap().assigned = claim;
        }

        let info = &self.egress_ips[&ip];
        if info.nodes.is_empty() && info.namespaces.is_empty() {
            self.egress_ips.remove(&ip);
        }
    }

    fn sync_namespace_state(&mut self, vnid: Vnid) {
        let Some(ns) = self.namespaces_by_vnid.get(&vnid) else {
            return;
        };

        if ns.requested_ips.is_empty() {
            let was_normal = ns.mode == EgressMode::Normal;
            self.namespaces_by_vnid.remove(&vnid);
            if !was_normal {
                self.observer.set_namespace_egress_normal(vnid);
            }
            return;
        }

        let mut active = Vec::with_capacity(ns.requested_ips.len());
        for ip in &ns.requested_ips {
            let Some(info) = self.egress_ips.get(ip) else {
                continue;
            };
            if info.namespaces.len() > 1 {
                debug!("VNID {vnid} gets no egress: IP {ip} is requested by multiple namespaces");
                active.clear();
                break;
            }
            if let Some((_, node_ip)) = info.assigned {
                active.push(EgressIpAssignment {
                    node_ip,
                    egress_ip: *ip,
                });
            }
        }

        let ns = self.namespaces_by_vnid.get_mut(&vnid).unwrap();
        if active.is_empty() {
            if ns.mode != EgressMode::Dropped {
                ns.mode = EgressMode::Dropped;
                ns.active_egress_ips.clear();
                self.observer.set_namespace_egress_dropped(vnid);
            }
        } else if ns.mode != EgressMode::ViaEgressIps || ns.active_egress_ips != active {
            ns.mode = EgressMode::ViaEgressIps;
            ns.active_egress_ips = active.clone();
            self.observer
                .set_namespace_egress_via_egress_ips(vnid, &active);
        }
    }

    // ── Automatic allocation ────────────────────────────────────────────

    /// Recomputes the automatic placement of egress IPs across nodes with
    /// egress CIDRs and returns the new `EgressIPs` list for every node whose
    /// list changed. Manually assigned IPs (outside the node's CIDRs) are
    /// never touched.
    pub fn reallocate_egress_ips(&mut self) -> BTreeMap<String, Vec<Ipv4Addr>> {
        let mut allocation: BTreeMap<String, Vec<Ipv4Addr>> = BTreeMap::new();
        let mut already_allocated: HashSet<Ipv4Addr> = HashSet::new();
        let mut removed_egress_ips = false;

        for (name, node) in &self.nodes {
            if node.requested_cidrs.is_empty() {
                // out of the allocator's reach; whatever it hosts stays put
                already_allocated.extend(node.requested_ips.iter().copied());
            } else {
                allocation.insert(name.clone(), Vec::new());
            }
        }
        for (ip, info) in &self.egress_ips {
            if info.namespaces.len() > 1 {
                already_allocated.insert(*ip);
            }
        }

        // keep existing assignments that are still justified
        for (name, node) in &self.nodes {
            if !allocation.contains_key(name) {
                continue;
            }
            let mut hosted: Vec<_> = node.requested_ips.iter().copied().collect();
            hosted.sort_unstable();
            let mut kept = Vec::with_capacity(hosted.len());
            for ip in hosted {
                let automatic = node.requested_cidrs.iter().any(|cidr| cidr.contains(&ip));
                if !automatic {
                    kept.push(ip);
                    already_allocated.insert(ip);
                    continue;
                }
                let requested = self
                    .egress_ips
                    .get(&ip)
                    .map(|info| info.namespaces.len() == 1)
                    .unwrap_or(false);
                if requested && !already_allocated.contains(&ip) && !node.offline {
                    kept.push(ip);
                    already_allocated.insert(ip);
                } else {
                    removed_egress_ips = true;
                }
            }
            allocation.insert(name.clone(), kept);
        }

        // place requested-but-unhosted IPs on the least loaded eligible node
        let mut candidates: Vec<Ipv4Addr> = self
            .egress_ips
            .iter()
            .filter(|(ip, info)| info.namespaces.len() == 1 && !already_allocated.contains(*ip))
            .map(|(ip, _)| *ip)
            .collect();
        candidates.sort_unstable();
        for ip in candidates {
            let mut best: Option<String> = None;
            for (name, node) in &self.nodes {
                if node.offline {
                    continue;
                }
                let Some(assigned) = allocation.get(name) else {
                    continue;
                };
                if !node.requested_cidrs.iter().any(|cidr| cidr.contains(&ip)) {
                    continue;
                }
                match &best {
                    Some(current) if allocation[current].len() <= assigned.len() => {}
                    _ => best = Some(name.clone()),
                }
            }
            match best {
                Some(name) => allocation.get_mut(&name).unwrap().push(ip),
                None => debug!("No available node to host egress IP {ip}"),
            }
        }

        if removed_egress_ips {
            // the freed IPs can only be re-placed once the updated HostSubnets
            // have been observed, so ask for another pass
            self.reallocation_pending = true;
        }

        allocation.retain(|name, ips| {
            let new: HashSet<Ipv4Addr> = ips.iter().copied().collect();
            new != self.nodes[name].requested_ips
        });
        allocation
    }

    /// Nodes participating in automatic allocation, for master-side liveness
    /// monitoring.
    pub fn egress_cidr_nodes(&self) -> Vec<(String, Ipv4Addr)> {
        self.nodes
            .values()
            .filter(|node| !node.requested_cidrs.is_empty())
            .map(|node| (node.name.clone(), node.node_ip))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::resources::crd::v1::hostsubnet::HostSubnetSpec;
    use crate::resources::crd::v1::netnamespace::NetNamespaceSpec;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Claim(Vnid, Ipv4Addr, Ipv4Addr),
        Release(Ipv4Addr, Ipv4Addr),
        Normal(Vnid),
        Dropped(Vnid),
        Via(Vnid, Vec<EgressIpAssignment>),
        UpdateEgressCidrs,
        Synced,
    }

    #[derive(Clone, Default)]
    struct RecordingObserver {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingObserver {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut self.events.lock().unwrap())
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl EgressIpObserver for RecordingObserver {
        fn claim_egress_ip(&mut self, vnid: Vnid, egress_ip: Ipv4Addr, node_ip: Ipv4Addr) {
            self.push(Event::Claim(vnid, egress_ip, node_ip));
        }

        fn release_egress_ip(&mut self, egress_ip: Ipv4Addr, node_ip: Ipv4Addr) {
            self.push(Event::Release(egress_ip, node_ip));
        }

        fn set_namespace_egress_normal(&mut self, vnid: Vnid) {
            self.push(Event::Normal(vnid));
        }

        fn set_namespace_egress_dropped(&mut self, vnid: Vnid) {
            self.push(Event::Dropped(vnid));
        }

        fn set_namespace_egress_via_egress_ips(
            &mut self,
            vnid: Vnid,
            assignments: &[EgressIpAssignment],
        ) {
            self.push(Event::Via(vnid, assignments.to_vec()));
        }

        fn update_egress_cidrs(&mut self) {
            self.push(Event::UpdateEgressCidrs);
        }

        fn synced(&mut self) {
            self.push(Event::Synced);
        }
    }

    fn tracker() -> (EgressIpTracker, RecordingObserver) {
        let observer = RecordingObserver::default();
        let tracker = EgressIpTracker::new(Box::new(observer.clone()));
        (tracker, observer)
    }

    fn host_subnet(
        name: &str,
        host_ip: &str,
        subnet: &str,
        egress_ips: &[&str],
        egress_cidrs: &[&str],
    ) -> HostSubnet {
        HostSubnet::new(
            name,
            HostSubnetSpec {
                host: name.to_owned(),
                host_ip: host_ip.to_owned(),
                subnet: subnet.to_owned(),
                egress_ips: Some(egress_ips.iter().map(|ip| ip.to_string()).collect()),
                egress_cidrs: Some(egress_cidrs.iter().map(|cidr| cidr.to_string()).collect()),
            },
        )
    }

    fn net_namespace(name: &str, vnid: Vnid, egress_ips: &[&str]) -> NetNamespace {
        NetNamespace::new(
            name,
            NetNamespaceSpec {
                netname: name.to_owned(),
                netid: vnid,
                egress_ips: Some(egress_ips.iter().map(|ip| ip.to_string()).collect()),
            },
        )
    }

    fn ip(raw: &str) -> Ipv4Addr {
        raw.parse().unwrap()
    }

    fn assignment(node_ip: &str, egress_ip: &str) -> EgressIpAssignment {
        EgressIpAssignment {
            node_ip: ip(node_ip),
            egress_ip: ip(egress_ip),
        }
    }

    #[test]
    fn claims_egress_ip_when_hosted_and_requested() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        assert_eq!(observer.take(), vec![]);

        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.2", "192.168.1.100")]),
            ]
        );
    }

    #[test]
    fn drops_namespace_until_a_node_hosts_its_ip() {
        let (mut tracker, observer) = tracker();

        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        assert_eq!(observer.take(), vec![Event::Dropped(42)]);

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.2", "192.168.1.100")]),
            ]
        );
    }

    #[test]
    fn duplicate_namespace_request_drops_all_claimants() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.net_namespace_applied(&net_namespace("two", 43, &["192.168.1.100"]));
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Dropped(42),
                Event::Dropped(43),
            ]
        );

        // removing the second claimant resolves the conflict
        tracker.net_namespace_deleted(&net_namespace("two", 43, &["192.168.1.100"]));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.2", "192.168.1.100")]),
                Event::Normal(43),
            ]
        );
    }

    #[test]
    fn duplicate_node_hosting_releases_the_claim() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Dropped(42),
            ]
        );
    }

    #[test]
    fn offline_node_releases_its_claims() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.set_node_offline(ip("10.0.0.2"), true);
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Dropped(42),
            ]
        );

        tracker.set_node_offline(ip("10.0.0.2"), false);
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.2", "192.168.1.100")]),
            ]
        );
    }

    #[test]
    fn falls_back_to_the_next_requested_ip_in_order() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.101"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace(
            "one",
            42,
            &["192.168.1.100", "192.168.1.101"],
        ));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Claim(42, ip("192.168.1.101"), ip("10.0.0.3")),
                Event::Via(
                    42,
                    vec![
                        assignment("10.0.0.2", "192.168.1.100"),
                        assignment("10.0.0.3", "192.168.1.101"),
                    ]
                ),
            ]
        );

        tracker.set_node_offline(ip("10.0.0.2"), true);
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.3", "192.168.1.101")]),
            ]
        );
    }

    #[test]
    fn moving_an_ip_between_nodes_releases_before_claiming() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &[],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &[],
            &[],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.100"],
            &[],
        ));

        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Dropped(42),
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.3")),
                Event::Via(42, vec![assignment("10.0.0.3", "192.168.1.100")]),
            ]
        );
    }

    #[test]
    fn rejects_egress_ips_that_shadow_node_addresses() {
        let (mut tracker, observer) = tracker();

        // the node's own IP and its SDN gateway are not usable as egress IPs
        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["10.0.0.2", "10.128.0.1"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["10.0.0.2"]));
        assert_eq!(observer.take(), vec![Event::Dropped(42)]);
    }

    #[test]
    fn deleting_a_namespace_restores_normal_egress() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.net_namespace_deleted(&net_namespace("one", 42, &["192.168.1.100"]));
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Normal(42),
            ]
        );
    }

    #[test]
    fn redundant_updates_emit_nothing() {
        let (mut tracker, observer) = tracker();

        let subnet = host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        );
        let netns = net_namespace("one", 42, &["192.168.1.100"]);
        tracker.host_subnet_applied(&subnet);
        tracker.net_namespace_applied(&netns);
        observer.take();

        tracker.host_subnet_applied(&subnet);
        tracker.net_namespace_applied(&netns);
        assert_eq!(observer.take(), vec![]);
    }

    #[test]
    fn reallocates_requested_ip_onto_cidr_node() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        assert_eq!(observer.take(), vec![Event::UpdateEgressCidrs]);

        tracker.net_namespace_applied(&net_namespace("one", 7, &["192.168.1.50"]));
        assert_eq!(observer.take(), vec![Event::Dropped(7)]);

        let allocation = tracker.reallocate_egress_ips();
        assert_eq!(
            allocation,
            BTreeMap::from([("node-b".to_owned(), vec![ip("192.168.1.50")])])
        );

        // the master writes the allocation back; observing it claims the IP
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.50"],
            &["192.168.1.0/24"],
        ));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(7, ip("192.168.1.50"), ip("10.0.0.3")),
                Event::Via(7, vec![assignment("10.0.0.3", "192.168.1.50")]),
            ]
        );
    }

    #[test]
    fn reallocation_balances_across_nodes_and_tiebreaks_by_name() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 1, &["192.168.1.50"]));
        tracker.net_namespace_applied(&net_namespace("two", 2, &["192.168.1.51"]));
        observer.take();

        let allocation = tracker.reallocate_egress_ips();
        assert_eq!(
            allocation,
            BTreeMap::from([
                ("node-a".to_owned(), vec![ip("192.168.1.50")]),
                ("node-b".to_owned(), vec![ip("192.168.1.51")]),
            ])
        );
    }

    #[test]
    fn reallocation_removes_auto_ips_nobody_requests() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.50", "172.16.0.9"],
            &["192.168.1.0/24"],
        ));
        observer.take();

        // 192.168.1.50 is automatically allocated and unrequested: dropped.
        // 172.16.0.9 is outside the CIDRs (manually assigned): kept.
        let allocation = tracker.reallocate_egress_ips();
        assert_eq!(
            allocation,
            BTreeMap::from([("node-b".to_owned(), vec![ip("172.16.0.9")])])
        );
    }

    #[test]
    fn reallocation_moves_ips_off_offline_nodes() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.50"],
            &["192.168.1.0/24"],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-c",
            "10.0.0.4",
            "10.132.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 7, &["192.168.1.50"]));
        tracker.set_node_offline(ip("10.0.0.3"), true);
        observer.take();

        let allocation = tracker.reallocate_egress_ips();
        assert_eq!(
            allocation,
            BTreeMap::from([
                ("node-b".to_owned(), vec![]),
                ("node-c".to_owned(), vec![ip("192.168.1.50")]),
            ])
        );
    }

    #[test]
    fn reallocation_skips_conflicted_ips() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 7, &["192.168.1.50"]));
        tracker.net_namespace_applied(&net_namespace("two", 8, &["192.168.1.50"]));
        observer.take();

        assert_eq!(tracker.reallocate_egress_ips(), BTreeMap::new());
    }

    #[test]
    fn removing_an_auto_ip_requests_another_pass() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.50"],
            &["192.168.1.0/24"],
        ));
        observer.take();

        tracker.reallocate_egress_ips();

        // the writeback comes around as an update; the freed IP triggers a
        // follow-up reallocation hint
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &[],
            &["192.168.1.0/24"],
        ));
        assert!(observer.take().contains(&Event::UpdateEgressCidrs));
    }

    #[test]
    fn synced_fires_once_after_both_resyncs() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnets_resynced(&[host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        )]);
        assert_eq!(observer.take(), vec![]);

        tracker.net_namespaces_resynced(&[net_namespace("one", 42, &["192.168.1.100"])]);
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Via(42, vec![assignment("10.0.0.2", "192.168.1.100")]),
                Event::Synced,
            ]
        );

        tracker.net_namespaces_resynced(&[net_namespace("one", 42, &["192.168.1.100"])]);
        assert_eq!(observer.take(), vec![]);
    }

    #[test]
    fn resync_removes_vanished_objects() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.host_subnets_resynced(&[]);
        assert_eq!(
            observer.take(),
            vec![
                Event::Release(ip("192.168.1.100"), ip("10.0.0.2")),
                Event::Dropped(42),
            ]
        );
    }

    #[test]
    fn ping_target_prefers_the_sdn_gateway() {
        let (mut tracker, _observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &[],
            &[],
        ));

        assert_eq!(tracker.ping_target(ip("10.0.0.2")), Some(ip("10.128.0.1")));
        assert_eq!(tracker.ping_target(ip("10.0.0.99")), None);
    }

    #[test]
    fn hosting_is_unique_after_conflicts_settle() {
        let (mut tracker, observer) = tracker();

        tracker.host_subnet_applied(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.host_subnet_applied(&host_subnet(
            "node-b",
            "10.0.0.3",
            "10.130.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        tracker.net_namespace_applied(&net_namespace("one", 42, &["192.168.1.100"]));
        observer.take();

        tracker.host_subnet_deleted(&host_subnet(
            "node-a",
            "10.0.0.2",
            "10.128.0.0/23",
            &["192.168.1.100"],
            &[],
        ));
        assert_eq!(
            observer.take(),
            vec![
                Event::Claim(42, ip("192.168.1.100"), ip("10.0.0.3")),
                Event::Via(42, vec![assignment("10.0.0.3", "192.168.1.100")]),
            ]
        );
    }
}
