use std::net::Ipv4Addr;
use std::process::Output;
use std::time::Duration;

use log::warn;
use tokio::process::Command;
use tokio::time::sleep;

const ARPING_BIN: &str = "/sbin/arping";
const ARP_UPDATE_DELAY: Duration = Duration::from_secs(2);

/// Updates other hosts' ARP caches after an egress IP lands on this node, in
/// case it was previously active elsewhere: an announce immediately, then an
/// update a little later. Runs in the background; failures are logged and
/// otherwise ignored.
pub fn announce_egress_ip(link_name: String, egress_ip: Ipv4Addr) {
    tokio::spawn(async move {
        match arping("-A", &link_name, egress_ip).await {
            Ok(output) if !output.status.success() => {
                warn!(
                    "Failed to send ARP claim for egress IP {egress_ip}: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                return;
            }
            Err(error) => {
                warn!("Failed to send ARP claim for egress IP {egress_ip}: {error}");
                return;
            }
            Ok(_) => {}
        }
        sleep(ARP_UPDATE_DELAY).await;
        let _ = arping("-U", &link_name, egress_ip).await;
    });
}

async fn arping(mode: &str, link_name: &str, egress_ip: Ipv4Addr) -> std::io::Result<Output> {
    Command::new(ARPING_BIN)
        .args(["-q", mode, "-c", "1", "-I", link_name])
        .arg(egress_ip.to_string())
        .output()
        .await
}
