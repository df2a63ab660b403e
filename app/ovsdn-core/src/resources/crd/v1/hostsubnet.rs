use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Default, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "ovsdn.dev",
    version = "v1",
    kind = "HostSubnet",
    derive = "Default"
)]
pub struct HostSubnetSpec {
    /// name of the node this subnet belongs to (same as the object name)
    pub host: String,
    /// the node's primary IP address
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    /// pod CIDR slice carved out for this node
    pub subnet: String,
    /// egress IPs this node is willing and authoritative to host
    #[serde(rename = "egressIPs")]
    pub egress_ips: Option<Vec<String>>,
    /// CIDR ranges automatic egress IP allocation may draw from for this node
    #[serde(rename = "egressCIDRs")]
    pub egress_cidrs: Option<Vec<String>>,
}

impl HostSubnet {
    pub fn egress_ips(&self) -> &[String] {
        self.spec.egress_ips.as_deref().unwrap_or(&[])
    }

    pub fn egress_cidrs(&self) -> &[String] {
        self.spec.egress_cidrs.as_deref().unwrap_or(&[])
    }
}
