use std::net::Ipv4Addr;

use async_trait::async_trait;
use ovsdn_core::tracker::Vnid;
use thiserror::Error;
use tokio::process::Command;

const OVS_OFCTL_BIN: &str = "ovs-ofctl";
const OPENFLOW_VERSION: &str = "OpenFlow13";

/// Egress routing decisions live in this table, keyed by the packet's VNID
/// held in reg0. Local egress marks the packet and continues; remote egress
/// tunnels to the hosting node.
const EGRESS_TABLE: u32 = 100;
const EGRESS_DISPATCH_TABLE: u32 = 101;

const VXLAN_PORT: &str = "vxlan0";

/// How a namespace's traffic reaches one of its egress IPs: the node hosting
/// it and the packet mark its filter rules key on (empty when the mark is not
/// known locally).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressIpMetadata {
    pub node_ip: Ipv4Addr,
    pub packet_mark: String,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Couldn't run ovs-ofctl! {}", .0)]
    Spawn(std::io::Error),
    #[error("ovs-ofctl [{}] failed: {}", .0, .1)]
    CommandFailed(String, String),
}

/// The OVS flow table entries selecting a namespace's egress behavior.
#[async_trait]
pub trait EgressFlowProgrammer: Send + Sync {
    /// The namespace egresses normally, with no override flows.
    async fn set_namespace_egress_normal(&self, vnid: Vnid) -> Result<(), FlowError>;

    /// The namespace's outbound traffic is dropped.
    async fn set_namespace_egress_dropped(&self, vnid: Vnid) -> Result<(), FlowError>;

    /// The namespace's outbound traffic is steered to its egress IPs, in
    /// preference order.
    async fn set_namespace_egress_via_egress_ips(
        &self,
        vnid: Vnid,
        egress: &[EgressIpMetadata],
    ) -> Result<(), FlowError>;
}

pub struct OvsOfctlFlows {
    bridge: String,
    local_ip: Ipv4Addr,
}

impl OvsOfctlFlows {
    pub fn new(bridge: String, local_ip: Ipv4Addr) -> Self {
        Self { bridge, local_ip }
    }

    async fn run(&self, command: &str, flow: &str) -> Result<(), FlowError> {
        let args = ["-O", OPENFLOW_VERSION, command, self.bridge.as_str(), flow];
        let output = Command::new(OVS_OFCTL_BIN)
            .args(args)
            .output()
            .await
            .map_err(FlowError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FlowError::CommandFailed(
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        }
    }

    async fn clear_vnid_flows(&self, vnid: Vnid) -> Result<(), FlowError> {
        self.run("del-flows", &format!("table={EGRESS_TABLE},reg0={vnid}"))
            .await
    }
}

#[async_trait]
impl EgressFlowProgrammer for OvsOfctlFlows {
    async fn set_namespace_egress_normal(&self, vnid: Vnid) -> Result<(), FlowError> {
        self.clear_vnid_flows(vnid).await
    }

    async fn set_namespace_egress_dropped(&self, vnid: Vnid) -> Result<(), FlowError> {
        self.clear_vnid_flows(vnid).await?;
        self.run(
            "add-flow",
            &format!("table={EGRESS_TABLE},priority=100,reg0={vnid},actions=drop"),
        )
        .await
    }

    async fn set_namespace_egress_via_egress_ips(
        &self,
        vnid: Vnid,
        egress: &[EgressIpMetadata],
    ) -> Result<(), FlowError> {
        self.clear_vnid_flows(vnid).await?;
        for (position, metadata) in egress.iter().enumerate() {
            // earlier assignments win; later ones only matter once the
            // earlier flows are removed
            let priority = 100 - position as u32;
            let actions = if metadata.node_ip == self.local_ip {
                format!(
                    "set_field:{}->pkt_mark,goto_table:{EGRESS_DISPATCH_TABLE}",
                    metadata.packet_mark
                )
            } else {
                format!("set_field:{}->tun_dst,output:{VXLAN_PORT}", metadata.node_ip)
            };
            self.run(
                "add-flow",
                &format!("table={EGRESS_TABLE},priority={priority},reg0={vnid},ip,actions={actions}"),
            )
            .await?;
        }
        Ok(())
    }
}
