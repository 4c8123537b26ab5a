// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

/// Creates the sockets used to reach upstream servers and to serve queries. Callers that need
/// sockets bound to a device or a mark inject their own implementation.
pub trait SocketFactory {
    fn new_tcp_v4(&self) -> std::io::Result<TcpSocket>;

    fn new_tcp_v6(&self) -> std::io::Result<TcpSocket>;

    fn tcp_bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener>;

    fn udp_bind(&self, addr: SocketAddr) -> std::io::Result<UdpSocket>;
}

#[derive(Clone, Copy, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn new_tcp_v4(&self) -> std::io::Result<TcpSocket> {
        TcpSocket::new_v4()
    }

    fn new_tcp_v6(&self) -> std::io::Result<TcpSocket> {
        TcpSocket::new_v6()
    }

    fn tcp_bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let std_sock = std::net::TcpListener::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        TcpListener::from_std(std_sock)
    }

    fn udp_bind(&self, addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind(addr)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }
}

/// Connects to the destination with a socket of the matching family.
pub async fn connect(
    factory: &(dyn SocketFactory + Send + Sync),
    dest: SocketAddr,
) -> std::io::Result<TcpStream> {
    let socket = match dest {
        SocketAddr::V4(_) => factory.new_tcp_v4()?,
        SocketAddr::V6(_) => factory.new_tcp_v6()?,
    };
    socket.set_nodelay(true)?;
    socket.connect(dest).await
}

/// Binds an ephemeral UDP socket able to reach the destination.
pub fn udp_for(
    factory: &(dyn SocketFactory + Send + Sync),
    dest: SocketAddr,
) -> std::io::Result<UdpSocket> {
    let local = match dest {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    factory.udp_bind(SocketAddr::new(local, 0))
}

pub fn to_canonical(addr: SocketAddr) -> SocketAddr {
    // another match has to be used for IPv4 and IPv6 support
    let ip = addr.ip().to_canonical();
    SocketAddr::from((ip, addr.port()))
}
