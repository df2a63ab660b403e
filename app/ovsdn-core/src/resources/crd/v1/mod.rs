pub mod hostsubnet;
pub mod netnamespace;

pub use hostsubnet::HostSubnet;
pub use netnamespace::NetNamespace;
