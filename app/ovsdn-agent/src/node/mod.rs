use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use kube::Client;
use log::{debug, error, info};
use ovsdn_core::tracker::{
    ping::ping_node, EgressIpAssignment, EgressIpObserver, EgressIpTracker, Vnid,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    join,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{sleep, Instant},
};

use crate::cniserver::{CniServer, CniServerConfig, PodRequest, PodRequestHandler};
use crate::config::NodeConfig;

pub mod arp;
pub mod iptables;
pub mod link;
pub mod mark;
pub mod ovs;

use self::iptables::{CommandIptables, EgressIptables, IptablesError};
use self::link::{egress_ip_label, NetlinkHandle};
use self::mark::mark_for_vnid;
use self::ovs::{EgressFlowProgrammer, EgressIpMetadata, OvsOfctlFlows};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const REPOLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Desired egress IP {} is the node IP!", .0)]
    EgressIpIsNodeIp(Ipv4Addr),
    #[error("Egress IP {egress_ip} is not in local network {network} of interface {link}!")]
    OutsideLocalNetwork {
        egress_ip: Ipv4Addr,
        network: Ipv4Net,
        link: String,
    },
    #[error("Link name '{}' is too long to label egress IPs!", .0)]
    LinkNameTooLong(String),
    #[error("No interface carries the node IP {}!", .0)]
    EgressLinkNotFound(Ipv4Addr),
    #[error("Link with index {} disappeared!", .0)]
    LinkNotFound(u32),
    #[error("Couldn't open a netlink connection! {}", .0)]
    NetlinkConnection(std::io::Error),
    #[error("Netlink operation failed! {}", .0)]
    Netlink(#[from] rtnetlink::Error),
    #[error("{}", .0)]
    Iptables(#[from] IptablesError),
}

pub async fn main_node(client: Client, config: NodeConfig) {
    let netlink = match NetlinkHandle::new() {
        Ok(handle) => handle,
        Err(error) => {
            error!("Couldn't set up the dataplane! {error:?}");
            exit(8)
        }
    };

    let (dataplane_tx, dataplane_rx) = unbounded_channel();
    let (monitor_tx, monitor_rx) = unbounded_channel();
    let watcher = EgressIpWatcher::new(
        config.node_ip,
        config.masquerade_bit,
        dataplane_tx,
        monitor_tx,
    );
    let tracker = Arc::new(Mutex::new(EgressIpTracker::new(Box::new(watcher))));

    let dataplane = Dataplane {
        local_ip: config.node_ip,
        netlink,
        iptables: Arc::new(CommandIptables::new()),
        flows: Arc::new(OvsOfctlFlows::new(config.ovs_bridge.clone(), config.node_ip)),
    };

    let (pod_tx, pod_rx) = unbounded_channel();
    let cni_server = CniServer::new(
        config.cni_rundir.clone(),
        CniServerConfig {
            mtu: config.mtu,
            service_network_cidr: config.service_network_cidr.to_string(),
        },
        Arc::new(SerializedPodHandler { requests: pod_tx }),
    );
    if let Err(error) = cni_server.start() {
        error!("Couldn't start the CNI server! {error:?}");
        exit(9)
    }

    join!(
        run_dataplane(dataplane, dataplane_rx),
        run_remote_monitor(tracker.clone(), monitor_rx),
        run_pod_request_dispatcher(pod_rx),
        crate::watchers::run_tracker_watchers(client, tracker),
    );
}

// ── Observer ────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum DataplaneOp {
    AssignEgressIp {
        egress_ip: Ipv4Addr,
        mark: String,
    },
    ReleaseEgressIp {
        egress_ip: Ipv4Addr,
        mark: String,
    },
    NamespaceEgressNormal {
        vnid: Vnid,
    },
    NamespaceEgressDropped {
        vnid: Vnid,
    },
    NamespaceEgressVia {
        vnid: Vnid,
        egress: Vec<EgressIpMetadata>,
    },
    CleanupStaleAddresses {
        keep: HashSet<Ipv4Addr>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum MonitorCmd {
    Add {
        node_ip: Ipv4Addr,
        egress_ip: Ipv4Addr,
    },
    Remove {
        node_ip: Ipv4Addr,
        egress_ip: Ipv4Addr,
    },
}

/// Translates tracker callbacks into local dataplane mutations and remote
/// node monitoring. Runs inside the tracker's critical section, so all real
/// work is forwarded to dedicated tasks over in-order channels.
struct EgressIpWatcher {
    local_ip: Ipv4Addr,
    masquerade_bit: u32,
    /// egress IP → packet mark, for every locally hosted egress IP
    iptables_mark: HashMap<Ipv4Addr, String>,
    /// packet mark → VNID it was handed to
    marks_in_use: HashMap<String, Vnid>,
    dataplane_tx: UnboundedSender<DataplaneOp>,
    monitor_tx: UnboundedSender<MonitorCmd>,
}

impl EgressIpWatcher {
    fn new(
        local_ip: Ipv4Addr,
        masquerade_bit: u32,
        dataplane_tx: UnboundedSender<DataplaneOp>,
        monitor_tx: UnboundedSender<MonitorCmd>,
    ) -> Self {
        Self {
            local_ip,
            masquerade_bit,
            iptables_mark: HashMap::new(),
            marks_in_use: HashMap::new(),
            dataplane_tx,
            monitor_tx,
        }
    }
}

impl EgressIpObserver for EgressIpWatcher {
    fn claim_egress_ip(&mut self, vnid: Vnid, egress_ip: Ipv4Addr, node_ip: Ipv4Addr) {
        if node_ip == self.local_ip {
            let mark = mark_for_vnid(vnid, self.masquerade_bit);
            if let Some(&owner) = self.marks_in_use.get(&mark) {
                if owner != vnid {
                    error!(
                        "Packet mark {mark} for VNID {vnid} collides with VNID {owner}; \
                         not assigning egress IP {egress_ip}!"
                    );
                    return;
                }
            }
            self.marks_in_use.insert(mark.clone(), vnid);
            self.iptables_mark.insert(egress_ip, mark.clone());
            let _ = self
                .dataplane_tx
                .send(DataplaneOp::AssignEgressIp { egress_ip, mark });
        } else {
            let _ = self.monitor_tx.send(MonitorCmd::Add { node_ip, egress_ip });
        }
    }

    fn release_egress_ip(&mut self, egress_ip: Ipv4Addr, node_ip: Ipv4Addr) {
        if node_ip == self.local_ip {
            let Some(mark) = self.iptables_mark.remove(&egress_ip) else {
                return;
            };
            if !self.iptables_mark.values().any(|used| *used == mark) {
                self.marks_in_use.remove(&mark);
            }
            let _ = self
                .dataplane_tx
                .send(DataplaneOp::ReleaseEgressIp { egress_ip, mark });
        } else {
            let _ = self
                .monitor_tx
                .send(MonitorCmd::Remove { node_ip, egress_ip });
        }
    }

    fn set_namespace_egress_normal(&mut self, vnid: Vnid) {
        let _ = self
            .dataplane_tx
            .send(DataplaneOp::NamespaceEgressNormal { vnid });
    }

    fn set_namespace_egress_dropped(&mut self, vnid: Vnid) {
        let _ = self
            .dataplane_tx
            .send(DataplaneOp::NamespaceEgressDropped { vnid });
    }

    fn set_namespace_egress_via_egress_ips(
        &mut self,
        vnid: Vnid,
        assignments: &[EgressIpAssignment],
    ) {
        let egress = assignments
            .iter()
            .map(|assignment| EgressIpMetadata {
                node_ip: assignment.node_ip,
                packet_mark: self
                    .iptables_mark
                    .get(&assignment.egress_ip)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        let _ = self
            .dataplane_tx
            .send(DataplaneOp::NamespaceEgressVia { vnid, egress });
    }

    fn update_egress_cidrs(&mut self) {}

    fn synced(&mut self) {
        let _ = self.dataplane_tx.send(DataplaneOp::CleanupStaleAddresses {
            keep: self.iptables_mark.keys().copied().collect(),
        });
    }
}

// ── Dataplane executor ──────────────────────────────────────────────────

struct Dataplane {
    local_ip: Ipv4Addr,
    netlink: NetlinkHandle,
    iptables: Arc<dyn EgressIptables>,
    flows: Arc<dyn EgressFlowProgrammer>,
}

async fn run_dataplane(dataplane: Dataplane, mut ops: UnboundedReceiver<DataplaneOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            DataplaneOp::AssignEgressIp { egress_ip, mark } => {
                if let Err(error) = assign_egress_ip(&dataplane, egress_ip, &mark).await {
                    error!("Error assigning egress IP {egress_ip}! {error}");
                }
            }
            DataplaneOp::ReleaseEgressIp { egress_ip, mark } => {
                if let Err(error) = release_egress_ip(&dataplane, egress_ip, &mark).await {
                    error!("Error releasing egress IP {egress_ip}! {error}");
                }
            }
            DataplaneOp::NamespaceEgressNormal { vnid } => {
                if let Err(error) = dataplane.flows.set_namespace_egress_normal(vnid).await {
                    error!("Error updating namespace egress rules for VNID {vnid}! {error}");
                }
            }
            DataplaneOp::NamespaceEgressDropped { vnid } => {
                if let Err(error) = dataplane.flows.set_namespace_egress_dropped(vnid).await {
                    error!("Error updating namespace egress rules for VNID {vnid}! {error}");
                }
            }
            DataplaneOp::NamespaceEgressVia { vnid, egress } => {
                if let Err(error) = dataplane
                    .flows
                    .set_namespace_egress_via_egress_ips(vnid, &egress)
                    .await
                {
                    error!("Error updating namespace egress rules for VNID {vnid}! {error}");
                }
            }
            DataplaneOp::CleanupStaleAddresses { keep } => {
                if let Err(error) = cleanup_stale_addresses(&dataplane, &keep).await {
                    error!("Couldn't check for stale egress IPs! {error}");
                }
            }
        }
    }
}

async fn assign_egress_ip(
    dataplane: &Dataplane,
    egress_ip: Ipv4Addr,
    mark: &str,
) -> Result<(), NodeError> {
    if egress_ip == dataplane.local_ip {
        return Err(NodeError::EgressIpIsNodeIp(egress_ip));
    }

    let link = dataplane.netlink.egress_link(dataplane.local_ip).await?;
    let label = egress_ip_label(&link.name)?;
    if !link.network.contains(&egress_ip) {
        return Err(NodeError::OutsideLocalNetwork {
            egress_ip,
            network: link.network.trunc(),
            link: link.name.clone(),
        });
    }

    dataplane
        .netlink
        .add_labeled_address(&link, egress_ip, &label)
        .await?;

    // other hosts may still resolve this IP to its previous home
    arp::announce_egress_ip(link.name.clone(), egress_ip);

    dataplane.iptables.add_egress_ip_rules(egress_ip, mark).await?;

    Ok(())
}

async fn release_egress_ip(
    dataplane: &Dataplane,
    egress_ip: Ipv4Addr,
    mark: &str,
) -> Result<(), NodeError> {
    if egress_ip == dataplane.local_ip {
        return Ok(());
    }

    let link = dataplane.netlink.egress_link(dataplane.local_ip).await?;
    dataplane.netlink.delete_address(&link, egress_ip).await?;
    dataplane
        .iptables
        .delete_egress_ip_rules(egress_ip, mark)
        .await?;

    Ok(())
}

/// Removes addresses bearing the egress label that no longer correspond to a
/// claimed egress IP, then has the filter layer resync its rules. Runs once,
/// after the first full resync.
async fn cleanup_stale_addresses(
    dataplane: &Dataplane,
    keep: &HashSet<Ipv4Addr>,
) -> Result<(), NodeError> {
    let link = dataplane.netlink.egress_link(dataplane.local_ip).await?;
    let label = egress_ip_label(&link.name)?;

    for (address, message) in dataplane.netlink.labeled_addresses(&link, &label).await? {
        if !keep.contains(&address) {
            info!("Cleaning up stale egress IP {address}");
            if let Err(error) = dataplane.netlink.delete_address_message(message).await {
                error!("Couldn't clean up stale egress IP {address}! {error}");
            }
        }
    }

    dataplane.iptables.sync_egress_ip_rules().await?;
    Ok(())
}

// ── Remote node monitoring ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct RemoteNode {
    egress_ips: HashSet<Ipv4Addr>,
    offline: bool,
    retries: u32,
}

/// Liveness-probes the remote nodes this node steers egress traffic through.
/// Probing runs only while the monitored set is non-empty.
async fn run_remote_monitor(
    tracker: Arc<Mutex<EgressIpTracker>>,
    mut commands: UnboundedReceiver<MonitorCmd>,
) {
    let mut nodes: HashMap<Ipv4Addr, RemoteNode> = HashMap::new();
    loop {
        if nodes.is_empty() {
            match commands.recv().await {
                Some(command) => {
                    apply_monitor_cmd(&mut nodes, command);
                    continue;
                }
                None => return,
            }
        }

        while let Ok(command) = commands.try_recv() {
            apply_monitor_cmd(&mut nodes, command);
        }
        if nodes.is_empty() {
            continue;
        }

        let start = Instant::now();
        let mut retry = check_remote_nodes(&tracker, &mut nodes, false).await;
        while retry {
            sleep(REPOLL_INTERVAL).await;
            while let Ok(command) = commands.try_recv() {
                apply_monitor_cmd(&mut nodes, command);
            }
            if nodes.is_empty() {
                break;
            }
            retry = check_remote_nodes(&tracker, &mut nodes, true).await;
        }

        let elapsed = start.elapsed();
        if elapsed < POLL_INTERVAL {
            tokio::select! {
                _ = sleep(POLL_INTERVAL - elapsed) => {}
                command = commands.recv() => match command {
                    Some(command) => apply_monitor_cmd(&mut nodes, command),
                    None => return,
                },
            }
        }
    }
}

fn apply_monitor_cmd(nodes: &mut HashMap<Ipv4Addr, RemoteNode>, command: MonitorCmd) {
    match command {
        MonitorCmd::Add { node_ip, egress_ip } => {
            let node = nodes.entry(node_ip).or_insert_with(|| {
                debug!("Monitoring node {node_ip}");
                RemoteNode::default()
            });
            node.egress_ips.insert(egress_ip);
        }
        MonitorCmd::Remove { node_ip, egress_ip } => {
            if let Some(node) = nodes.get_mut(&node_ip) {
                node.egress_ips.remove(&egress_ip);
                if node.egress_ips.is_empty() {
                    debug!("Unmonitoring node {node_ip}");
                    nodes.remove(&node_ip);
                }
            }
        }
    }
}

async fn check_remote_nodes(
    tracker: &Arc<Mutex<EgressIpTracker>>,
    nodes: &mut HashMap<Ipv4Addr, RemoteNode>,
    retrying: bool,
) -> bool {
    let probe_timeout = if retrying {
        REPOLL_INTERVAL
    } else {
        POLL_INTERVAL
    };

    let mut need_retry = false;
    let mut transitions = Vec::new();
    for (node_ip, node) in nodes.iter_mut() {
        if retrying && node.retries == 0 {
            continue;
        }

        let target = tracker.lock().ping_target(*node_ip);
        let online = match target {
            Some(target) => ping_node(target, probe_timeout).await,
            None => false,
        };

        if node.offline && online {
            node.offline = false;
            transitions.push((*node_ip, false));
        } else if !node.offline && !online {
            node.retries += 1;
            if node.retries > MAX_RETRIES {
                node.retries = 0;
                node.offline = true;
                transitions.push((*node_ip, true));
            } else {
                debug!("Node {node_ip} may be offline... retrying");
                need_retry = true;
            }
        }
    }

    // applied after the probe pass; set_node_offline re-enters the observer,
    // which must not happen while we hold any probe state borrows
    for (node_ip, offline) in transitions {
        tracker.lock().set_node_offline(node_ip, offline);
    }

    need_retry
}

// ── CNI pod request handling ────────────────────────────────────────────

type PodResponder = oneshot::Sender<anyhow::Result<Vec<u8>>>;

/// Forwards pod requests into a single consumer, so setup and teardown for
/// all pods are strictly serialized.
struct SerializedPodHandler {
    requests: UnboundedSender<(PodRequest, PodResponder)>,
}

#[async_trait]
impl PodRequestHandler for SerializedPodHandler {
    async fn handle(&self, request: PodRequest) -> anyhow::Result<Vec<u8>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.requests
            .send((request, result_tx))
            .map_err(|_| anyhow!("pod request dispatcher is gone"))?;
        result_rx
            .await
            .map_err(|_| anyhow!("pod request was dropped"))?
    }
}

async fn run_pod_request_dispatcher(mut requests: UnboundedReceiver<(PodRequest, PodResponder)>) {
    while let Some((request, responder)) = requests.recv().await {
        let result = process_pod_request(&request).await;
        let _ = responder.send(result);
    }
}

async fn process_pod_request(request: &PodRequest) -> anyhow::Result<Vec<u8>> {
    info!(
        "{:?} request for pod {}/{} (sandbox {})",
        request.command, request.pod_namespace, request.pod_name, request.sandbox_id
    );
    Ok(Vec::new())
}
