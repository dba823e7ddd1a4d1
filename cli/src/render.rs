//! Pure formatting of config records into WireGuard INI text.
//!
//! The renderer never re-orders or rewrites anything: peer order, CIDR
//! order and key placement are all decided by the engine.

use std::fmt::{self, Display, Formatter};

use wgtopo_engine::{ConfigRecord, PeerBlock};

pub struct Conf<'a>(pub &'a ConfigRecord);

pub fn render(record: &ConfigRecord) -> String {
    Conf(record).to_string()
}

impl Display for Conf<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let interface = &self.0.interface;
        writeln!(f, "[Interface]")?;
        writeln!(f, "# Name = {}", interface.name)?;
        writeln!(f, "Address = {}", interface.address)?;
        writeln!(f, "PrivateKey = {}", interface.private_key)?;
        if let Some(port) = interface.listen_port {
            writeln!(f, "ListenPort = {port}")?;
        }
        if let Some(dns) = &interface.dns {
            writeln!(f, "DNS = {dns}")?;
        }
        if let Some(mtu) = interface.mtu {
            writeln!(f, "MTU = {mtu}")?;
        }
        for cmd in &interface.post_up {
            writeln!(f, "PostUp = {cmd}")?;
        }
        for cmd in &interface.post_down {
            writeln!(f, "PostDown = {cmd}")?;
        }

        for peer in &self.0.peers {
            writeln!(f)?;
            peer_block(f, peer)?;
        }
        Ok(())
    }
}

fn peer_block(f: &mut Formatter<'_>, peer: &PeerBlock) -> fmt::Result {
    writeln!(f, "[Peer]")?;
    writeln!(f, "# {}", peer.comment)?;
    writeln!(f, "PublicKey = {}", peer.public_key)?;
    if let Some(psk) = &peer.preshared_key {
        writeln!(f, "PresharedKey = {psk}")?;
    }
    let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
    writeln!(f, "AllowedIPs = {}", allowed.join(", "))?;
    if let Some(endpoint) = &peer.endpoint {
        writeln!(f, "Endpoint = {endpoint}")?;
    }
    if let Some(keepalive) = peer.persistent_keepalive {
        writeln!(f, "PersistentKeepalive = {keepalive}")?;
    }
    Ok(())
}
