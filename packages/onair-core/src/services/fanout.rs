//! UDP fan-out of encoded broadcast frames.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::services::traits::SpeakerFanout;
use crate::session::SpeakerInfo;

/// Sends each frame as one datagram to every speaker.
///
/// A speaker address is either `ip:port` or a bare IP, which gets the
/// configured default port.
pub struct UdpFanout {
    socket: UdpSocket,
    default_port: u16,
}

impl UdpFanout {
    /// Binds an ephemeral UDP socket on `bind_ip`. Must run inside a Tokio runtime.
    pub fn bind(bind_ip: IpAddr, default_port: u16) -> io::Result<Self> {
        let socket = create_socket(bind_ip)?;
        log::info!(
            "[Fanout] UDP socket bound to {} (default speaker port {})",
            socket.local_addr()?,
            default_port
        );
        Ok(Self {
            socket,
            default_port,
        })
    }

    /// Binds on all IPv4 interfaces.
    pub fn bind_any(default_port: u16) -> io::Result<Self> {
        Self::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), default_port)
    }

    fn target(&self, speaker: &SpeakerInfo) -> Option<SocketAddr> {
        resolve_target(&speaker.address, self.default_port)
    }
}

fn resolve_target(address: &str, default_port: u16) -> Option<SocketAddr> {
    let address = address.trim();
    address
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| {
            address
                .parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, default_port))
        })
}

/// Creates a non-blocking UDP socket for sending.
///
/// SO_BROADCAST is enabled so a speaker group may be addressed by a
/// broadcast address.
fn create_socket(bind_ip: IpAddr) -> io::Result<UdpSocket> {
    let domain = match bind_ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_broadcast(true) {
        log::warn!("[Fanout] Failed to set SO_BROADCAST: {}", e);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(bind_ip, 0).into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

#[async_trait]
impl SpeakerFanout for UdpFanout {
    async fn send_audio_to_speakers(&self, speakers: &[SpeakerInfo], frame: &[u8]) -> usize {
        let sends = speakers.iter().map(|speaker| async move {
            let Some(target) = self.target(speaker) else {
                log::warn!(
                    "[Fanout] Speaker {} has unusable address '{}'",
                    speaker.id,
                    speaker.address
                );
                return false;
            };
            match self.socket.send_to(frame, target).await {
                Ok(_) => true,
                Err(e) => {
                    log::debug!("[Fanout] Send to {} failed: {}", target, e);
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }
}
