use std::{env::var, net::Ipv4Addr, path::PathBuf};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::cniserver::CNI_SERVER_RUN_DIR;

const NODE_IP_ENV: &str = "OVSDN_NODE_IP";
const MASQUERADE_BIT_ENV: &str = "OVSDN_MASQUERADE_BIT";
const MTU_ENV: &str = "OVSDN_MTU";
const SERVICE_CIDR_ENV: &str = "OVSDN_SERVICE_CIDR";
const CNI_RUNDIR_ENV: &str = "OVSDN_CNI_RUNDIR";
const OVS_BRIDGE_ENV: &str = "OVSDN_OVS_BRIDGE";

const DEFAULT_MTU: u32 = 1450;
const DEFAULT_OVS_BRIDGE: &str = "br0";

#[derive(Debug, Error)]
pub enum FromError {
    #[error("Env var {} unavailable: {}", .0, .1)]
    VarUnset(&'static str, std::env::VarError),
    #[error("Env var {} couldn't be parsed: '{}'", .0, .1)]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// this node's primary IP, as published in its HostSubnet
    pub node_ip: Ipv4Addr,
    /// single-bit mask reserved for masquerade marking; egress packet marks
    /// must never collide with it
    pub masquerade_bit: u32,
    pub mtu: u32,
    pub service_network_cidr: Ipv4Net,
    pub cni_rundir: PathBuf,
    pub ovs_bridge: String,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, FromError> {
        Ok(Self {
            node_ip: parse_required(NODE_IP_ENV)?,
            masquerade_bit: match var(MASQUERADE_BIT_ENV) {
                Ok(raw) => {
                    let bit: u8 = raw
                        .parse()
                        .map_err(|_| FromError::InvalidValue(MASQUERADE_BIT_ENV, raw.clone()))?;
                    if bit > 31 {
                        return Err(FromError::InvalidValue(MASQUERADE_BIT_ENV, raw));
                    }
                    1 << u32::from(bit)
                }
                Err(_) => 0,
            },
            mtu: match var(MTU_ENV) {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| FromError::InvalidValue(MTU_ENV, raw))?,
                Err(_) => DEFAULT_MTU,
            },
            service_network_cidr: parse_required(SERVICE_CIDR_ENV)?,
            cni_rundir: var(CNI_RUNDIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(CNI_SERVER_RUN_DIR)),
            ovs_bridge: var(OVS_BRIDGE_ENV).unwrap_or_else(|_| DEFAULT_OVS_BRIDGE.to_owned()),
        })
    }
}

fn parse_required<T: std::str::FromStr>(name: &'static str) -> Result<T, FromError> {
    let raw = var(name).map_err(|error| FromError::VarUnset(name, error))?;
    raw.parse()
        .map_err(|_| FromError::InvalidValue(name, raw))
}
