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
    kind = "NetNamespace",
    derive = "Default"
)]
pub struct NetNamespaceSpec {
    /// name of the tenant namespace this object binds
    pub netname: String,
    /// the namespace's virtual network ID
    pub netid: u32,
    /// egress IPs requested for the namespace's outbound traffic, in
    /// preference order
    #[serde(rename = "egressIPs")]
    pub egress_ips: Option<Vec<String>>,
}

impl NetNamespace {
    pub fn egress_ips(&self) -> &[String] {
        self.spec.egress_ips.as_deref().unwrap_or(&[])
    }
}
