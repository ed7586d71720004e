use std::net::SocketAddrV4;

use pnet::datalink::{self, Channel, DataLinkSender, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

const ETHERNET_HDR_LEN: usize = 14;
const IPV4_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

/// TTL of emitted frames. The collector is expected to sit inside the
/// local routing domain.
const TTL: u8 = 32;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("interface '{0}' has no MAC address")]
    NoInterfaceMac(String),

    #[error("cannot parse MAC address '{0}'")]
    InvalidMac(String),

    #[error("interface '{0}' does not provide an Ethernet channel")]
    NotEthernet(String),

    #[error("failed to open datalink channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("datagram of {len} bytes does not fit a single frame")]
    Oversize { len: usize },

    #[error("send on '{iface}' failed: {source}")]
    Send {
        iface: String,
        #[source]
        source: std::io::Error,
    },
}

/// Emits rewritten datagrams as raw Ethernet frames on a fixed interface.
///
/// Each payload is wrapped in Ethernet II + IPv4 + UDP with both checksums
/// computed. The IPv4 source address and UDP source port are the sFlow
/// agent's, so the downstream collector attributes the datagram to the
/// agent rather than to this forwarder; the frame's destination MAC is the
/// configured next hop.
pub struct FrameExporter {
    iface: String,
    src_mac: MacAddr,
    dst_mac: MacAddr,
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl FrameExporter {
    /// Opens a datalink channel on `iface_name`, sourcing frames from its
    /// MAC address and targeting the `dst_mac` next hop.
    pub fn open(iface_name: &str, dst_mac: &str) -> Result<Self, ExportError> {
        let dst_mac: MacAddr = dst_mac
            .parse()
            .map_err(|_| ExportError::InvalidMac(dst_mac.to_string()))?;

        let iface: NetworkInterface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == iface_name)
            .ok_or_else(|| ExportError::UnknownInterface(iface_name.to_string()))?;
        let src_mac = iface
            .mac
            .ok_or_else(|| ExportError::NoInterfaceMac(iface_name.to_string()))?;

        let tx = match datalink::channel(&iface, datalink::Config::default()) {
            Ok(Channel::Ethernet(tx, _rx)) => tx,
            Ok(_) => return Err(ExportError::NotEthernet(iface_name.to_string())),
            Err(err) => return Err(ExportError::Channel(err)),
        };

        info!(
            iface = iface_name,
            src_mac = %src_mac,
            dst_mac = %dst_mac,
            "opened datalink channel for rewritten datagrams"
        );

        Ok(Self {
            iface: iface_name.to_string(),
            src_mac,
            dst_mac,
            tx: Mutex::new(tx),
        })
    }

    /// Emits one payload, addressed from `agent` to `collector`.
    pub async fn send(
        &self,
        agent: SocketAddrV4,
        collector: SocketAddrV4,
        payload: &[u8],
    ) -> Result<(), ExportError> {
        if IPV4_HDR_LEN + UDP_HDR_LEN + payload.len() > u16::MAX as usize {
            return Err(ExportError::Oversize { len: payload.len() });
        }
        let frame_len = ETHERNET_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + payload.len();

        let mut tx = self.tx.lock().await;
        match tx.build_and_send(1, frame_len, &mut |frame| {
            fill_frame(frame, self.src_mac, self.dst_mac, agent, collector, payload);
        }) {
            Some(Ok(())) => Ok(()),
            Some(Err(source)) => Err(ExportError::Send {
                iface: self.iface.clone(),
                source,
            }),
            None => Err(ExportError::Oversize { len: payload.len() }),
        }
    }
}

/// Serializes Ethernet + IPv4 + UDP + payload into `frame`, which the
/// datalink channel sized to exactly the headers plus the payload.
fn fill_frame(
    frame: &mut [u8],
    src_mac: MacAddr,
    dst_mac: MacAddr,
    agent: SocketAddrV4,
    collector: SocketAddrV4,
    payload: &[u8],
) {
    let (eth_buf, ip_buf) = frame.split_at_mut(ETHERNET_HDR_LEN);

    let mut eth = MutableEthernetPacket::new(eth_buf).expect("frame sized for Ethernet header");
    eth.set_destination(dst_mac);
    eth.set_source(src_mac);
    eth.set_ethertype(EtherTypes::Ipv4);

    {
        let udp_buf = &mut ip_buf[IPV4_HDR_LEN..];
        let mut udp_pkt = MutableUdpPacket::new(udp_buf).expect("frame sized for UDP datagram");
        udp_pkt.set_source(agent.port());
        udp_pkt.set_destination(collector.port());
        udp_pkt.set_length((UDP_HDR_LEN + payload.len()) as u16);
        udp_pkt.set_payload(payload);
        udp_pkt.set_checksum(0);
        let csum = udp::ipv4_checksum(&udp_pkt.to_immutable(), agent.ip(), collector.ip());
        udp_pkt.set_checksum(csum);
    }

    let mut ip_pkt = MutableIpv4Packet::new(ip_buf).expect("frame sized for IPv4 header");
    ip_pkt.set_version(4);
    ip_pkt.set_header_length((IPV4_HDR_LEN / 4) as u8);
    ip_pkt.set_total_length((IPV4_HDR_LEN + UDP_HDR_LEN + payload.len()) as u16);
    ip_pkt.set_identification(0);
    ip_pkt.set_ttl(TTL);
    ip_pkt.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip_pkt.set_source(*agent.ip());
    ip_pkt.set_destination(*collector.ip());
    ip_pkt.set_checksum(0);
    let csum = ipv4::checksum(&ip_pkt.to_immutable());
    ip_pkt.set_checksum(csum);
}
