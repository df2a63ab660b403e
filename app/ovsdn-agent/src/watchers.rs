use std::future::ready;
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    runtime::watcher::{watcher, Config, Event},
    Client,
};
use log::warn;
use ovsdn_core::{
    kubernetes::GetApi,
    resources::crd::v1::{HostSubnet, NetNamespace},
    tracker::EgressIpTracker,
};
use parking_lot::Mutex;
use tokio::join;

/// Feeds HostSubnet and NetNamespace watch events into the shared tracker.
/// The initial relisting of each watch counts as its resync; the tracker
/// fires `synced()` once both have completed.
pub async fn run_tracker_watchers(client: Client, tracker: Arc<Mutex<EgressIpTracker>>) {
    let host_subnets = {
        let tracker = tracker.clone();
        watcher(client.global_api::<HostSubnet>(), Config::default()).for_each(move |event| {
            match event {
                Ok(Event::Applied(subnet)) => tracker.lock().host_subnet_applied(&subnet),
                Ok(Event::Deleted(subnet)) => tracker.lock().host_subnet_deleted(&subnet),
                Ok(Event::Restarted(subnets)) => tracker.lock().host_subnets_resynced(&subnets),
                Err(error) => warn!("HostSubnet watch failed! {error:#?}"),
            }
            ready(())
        })
    };

    let net_namespaces = {
        let tracker = tracker.clone();
        watcher(client.global_api::<NetNamespace>(), Config::default()).for_each(move |event| {
            match event {
                Ok(Event::Applied(netns)) => tracker.lock().net_namespace_applied(&netns),
                Ok(Event::Deleted(netns)) => tracker.lock().net_namespace_deleted(&netns),
                Ok(Event::Restarted(namespaces)) => {
                    tracker.lock().net_namespaces_resynced(&namespaces)
                }
                Err(error) => warn!("NetNamespace watch failed! {error:#?}"),
            }
            ready(())
        })
    };

    join!(host_subnets, net_namespaces);
}
