use std::collections::{BTreeMap, HashSet};
use std::future::{ready, Future};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, NodeStatus};
use kube::{
    api::PostParams,
    runtime::{
        reflector::{self, reflector, ObjectRef, Store},
        watcher::{watcher, Config},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use log::{debug, error, info, warn};
use ovsdn_core::{
    kubernetes::{operations::try_get_cluster_resource, GetApi},
    resources::crd::v1::HostSubnet,
    tracker::{ping::ping_node, EgressIpAssignment, EgressIpObserver, EgressIpTracker, Vnid},
};
use parking_lot::Mutex;
use tokio::{
    join,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    time::{sleep, Instant},
};

/// How long egress CIDR changes must stay quiet before reallocation runs.
const UPDATE_QUANTUM: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const REPOLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 2;

const WRITEBACK_CONFLICT_BACKOFF: [Duration; 4] = [
    Duration::from_millis(10),
    Duration::from_millis(50),
    Duration::from_millis(250),
    Duration::from_millis(1250),
];

pub async fn main_master(client: Client) {
    let (reallocate_tx, reallocate_rx) = unbounded_channel();
    let tracker = Arc::new(Mutex::new(EgressIpTracker::new(Box::new(MasterObserver {
        reallocate_tx,
    }))));

    let (node_reflector, node_store) = start_node_reflector(&client);
    let allocator = run_allocator(
        client.clone(),
        tracker.clone(),
        node_store,
        reallocate_rx,
    );
    let watchers = crate::watchers::run_tracker_watchers(client, tracker);

    join!(node_reflector, allocator, watchers);
}

/// The master only acts on reallocation hints; dataplane callbacks are the
/// node watcher's business.
struct MasterObserver {
    reallocate_tx: UnboundedSender<()>,
}

impl EgressIpObserver for MasterObserver {
    fn claim_egress_ip(&mut self, _vnid: Vnid, _egress_ip: Ipv4Addr, _node_ip: Ipv4Addr) {}

    fn release_egress_ip(&mut self, _egress_ip: Ipv4Addr, _node_ip: Ipv4Addr) {}

    fn set_namespace_egress_normal(&mut self, _vnid: Vnid) {}

    fn set_namespace_egress_dropped(&mut self, _vnid: Vnid) {}

    fn set_namespace_egress_via_egress_ips(
        &mut self,
        _vnid: Vnid,
        _assignments: &[EgressIpAssignment],
    ) {
    }

    fn update_egress_cidrs(&mut self) {
        let _ = self.reallocate_tx.send(());
    }

    fn synced(&mut self) {
        debug!("Master tracker synced");
    }
}

/// Watches Node objects, stripped down to the name and status conditions the
/// liveness check reads.
fn start_node_reflector(client: &Client) -> (impl Future<Output = ()>, Store<Node>) {
    let node_watcher = watcher(client.global_api::<Node>(), Config::default()).map_ok(|event| {
        event.modify(|node| {
            node.managed_fields_mut().clear();
            node.annotations_mut().clear();
            node.labels_mut().clear();
            node.finalizers_mut().clear();
            node.owner_references_mut().clear();
            node.spec = None;

            let conditions = node
                .status
                .as_ref()
                .and_then(|status| status.conditions.to_owned());

            node.status = Some(NodeStatus {
                conditions,
                ..Default::default()
            })
        })
    });
    let (store, writer) = reflector::store();
    let node_reflector = reflector(writer, node_watcher)
        .applied_objects()
        .for_each(|_| ready(()));

    (node_reflector, store)
}

#[derive(Debug)]
struct MonitoredNode {
    name: String,
    ip: Ipv4Addr,
    offline: bool,
    retries: u32,
}

type MonitorSet = Arc<Mutex<BTreeMap<Ipv4Addr, MonitoredNode>>>;

/// Coalesces reallocation hints, runs the tracker's reallocation once things
/// are stable, writes the result back to the changed HostSubnets, and keeps
/// the liveness poller targeting the current set of egress nodes.
async fn run_allocator(
    client: Client,
    tracker: Arc<Mutex<EgressIpTracker>>,
    node_store: Store<Node>,
    mut reallocate_rx: UnboundedReceiver<()>,
) {
    let monitor: MonitorSet = Arc::new(Mutex::new(BTreeMap::new()));
    let mut poll_stop: Option<watch::Sender<bool>> = None;

    while reallocate_rx.recv().await.is_some() {
        await_quiet_quantum(&mut reallocate_rx).await;

        let (allocation, egress_nodes) = {
            let mut tracker = tracker.lock();
            (tracker.reallocate_egress_ips(), tracker.egress_cidr_nodes())
        };

        for (node_name, egress_ips) in &allocation {
            write_back_egress_ips(&client, node_name, egress_ips).await;
        }

        {
            let mut monitor = monitor.lock();
            let mut next = BTreeMap::new();
            for (name, ip) in egress_nodes {
                let entry = monitor.remove(&ip).unwrap_or(MonitoredNode {
                    name,
                    ip,
                    offline: false,
                    retries: 0,
                });
                next.insert(ip, entry);
            }
            *monitor = next;
        }

        if monitor.lock().is_empty() {
            if let Some(stop) = poll_stop.take() {
                let _ = stop.send(true);
            }
        } else if poll_stop.is_none() {
            let (stop_tx, stop_rx) = watch::channel(false);
            poll_stop = Some(stop_tx);
            tokio::spawn(poll_nodes(
                tracker.clone(),
                node_store.clone(),
                monitor.clone(),
                stop_rx,
            ));
        }
    }
}

/// Returns once a full quantum has passed without another reallocation hint
/// arriving.
async fn await_quiet_quantum(reallocate_rx: &mut UnboundedReceiver<()>) {
    loop {
        sleep(UPDATE_QUANTUM).await;
        let mut notified_again = false;
        while reallocate_rx.try_recv().is_ok() {
            notified_again = true;
        }
        if !notified_again {
            return;
        }
    }
}

async fn write_back_egress_ips(client: &Client, node_name: &str, egress_ips: &[Ipv4Addr]) {
    let new_ips: Vec<String> = egress_ips.iter().map(|ip| ip.to_string()).collect();

    let mut backoff = WRITEBACK_CONFLICT_BACKOFF.iter();
    loop {
        match try_write_egress_ips(client, node_name, &new_ips).await {
            Ok(true) => {
                info!("Updated HostSubnet '{node_name}' egress IPs to {new_ips:?}");
                return;
            }
            Ok(false) => return,
            Err(kube::Error::Api(response)) if response.code == 409 => match backoff.next() {
                Some(delay) => {
                    debug!("Conflict updating HostSubnet '{node_name}', retrying...");
                    sleep(*delay).await;
                }
                None => {
                    error!("Couldn't update HostSubnet '{node_name}' egress IPs: too many conflicts!");
                    return;
                }
            },
            Err(error) => {
                error!("Couldn't update HostSubnet '{node_name}' egress IPs! {error}");
                return;
            }
        }
    }
}

/// Writes the new list if it differs from the stored one as a set. Returns
/// whether an update was issued.
async fn try_write_egress_ips(
    client: &Client,
    node_name: &str,
    new_ips: &[String],
) -> Result<bool, kube::Error> {
    let Some(mut subnet) = try_get_cluster_resource::<HostSubnet>(client, node_name).await? else {
        warn!("HostSubnet '{node_name}' disappeared before its egress IPs could be updated");
        return Ok(false);
    };

    let old: HashSet<&str> = subnet.egress_ips().iter().map(String::as_str).collect();
    let new: HashSet<&str> = new_ips.iter().map(String::as_str).collect();
    if old == new {
        return Ok(false);
    }

    subnet.spec.egress_ips = Some(new_ips.to_vec());
    let api: Api<HostSubnet> = client.global_api();
    api.replace(node_name, &PostParams::default(), &subnet)
        .await?;
    Ok(true)
}

fn node_is_ready(node: &Node) -> bool {
    let Some(conditions) = node.status.as_ref().and_then(|status| status.conditions.as_ref())
    else {
        return true;
    };
    !conditions
        .iter()
        .any(|cond| cond.type_ == "Ready" && (cond.status == "False" || cond.status == "Unknown"))
}

async fn poll_nodes(
    tracker: Arc<Mutex<EgressIpTracker>>,
    node_store: Store<Node>,
    monitor: MonitorSet,
    mut stop: watch::Receiver<bool>,
) {
    let mut retrying = false;
    loop {
        if *stop.borrow() {
            return;
        }

        let start = Instant::now();
        retrying = check_nodes(&tracker, &node_store, &monitor, retrying).await;
        if !retrying {
            let elapsed = start.elapsed();
            if elapsed < POLL_INTERVAL {
                tokio::select! {
                    _ = sleep(POLL_INTERVAL - elapsed) => {}
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

async fn check_nodes(
    tracker: &Arc<Mutex<EgressIpTracker>>,
    node_store: &Store<Node>,
    monitor: &MonitorSet,
    retrying: bool,
) -> bool {
    let probe_timeout = if retrying {
        REPOLL_INTERVAL
    } else {
        POLL_INTERVAL
    };

    let monitored: Vec<(Ipv4Addr, String, bool, u32)> = monitor
        .lock()
        .values()
        .map(|node| (node.ip, node.name.clone(), node.offline, node.retries))
        .collect();

    let mut need_retry = false;
    for (node_ip, node_name, offline, retries) in monitored {
        if retrying && retries == 0 {
            continue;
        }

        let Some(node) = node_store.get(&ObjectRef::new(&node_name)) else {
            warn!("Node '{node_name}' may have been deleted or not exist anymore");
            return false;
        };

        if !node_is_ready(&node) {
            warn!("Node '{node_name}' is not Ready");
            if let Some(entry) = monitor.lock().get_mut(&node_ip) {
                entry.offline = true;
            }
            tracker.lock().set_node_offline(node_ip, true);
            return false;
        }

        let target = tracker.lock().ping_target(node_ip);
        let online = match target {
            Some(target) => ping_node(target, probe_timeout).await,
            None => false,
        };

        if offline && online {
            if let Some(entry) = monitor.lock().get_mut(&node_ip) {
                entry.offline = false;
            }
            tracker.lock().set_node_offline(node_ip, false);
        } else if !offline && !online {
            let mut went_offline = false;
            {
                let mut monitor = monitor.lock();
                if let Some(entry) = monitor.get_mut(&node_ip) {
                    entry.retries += 1;
                    if entry.retries > MAX_RETRIES {
                        entry.retries = 0;
                        entry.offline = true;
                        went_offline = true;
                    } else {
                        need_retry = true;
                    }
                }
            }
            if went_offline {
                tracker.lock().set_node_offline(node_ip, true);
            } else {
                debug!("Node {node_ip} may be offline... retrying");
            }
        }
    }

    need_retry
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeCondition;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quiet_quantum_passes_when_nothing_arrives() {
        let (_tx, mut rx) = unbounded_channel::<()>();

        let start = Instant::now();
        await_quiet_quantum(&mut rx).await;

        assert_eq!(start.elapsed(), UPDATE_QUANTUM);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_quantum_defers_while_notifications_arrive() {
        let (tx, mut rx) = unbounded_channel::<()>();
        // lands inside the first quantum, postponing the work by another one
        tx.send(()).unwrap();

        let start = Instant::now();
        await_quiet_quantum(&mut rx).await;

        assert_eq!(start.elapsed(), 2 * UPDATE_QUANTUM);
    }

    fn node_with_ready_condition(status: &str) -> Node {
        let mut node = Node::default();
        node.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_owned(),
                status: status.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    #[test]
    fn ready_condition_false_or_unknown_means_not_ready() {
        assert!(node_is_ready(&node_with_ready_condition("True")));
        assert!(!node_is_ready(&node_with_ready_condition("False")));
        assert!(!node_is_ready(&node_with_ready_condition("Unknown")));
        assert!(node_is_ready(&Node::default()));
    }
}
