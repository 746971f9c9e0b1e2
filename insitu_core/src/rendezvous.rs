//! The rendezvous socket: a plain TCP exchange of one port name.
//!
//! A consumer that only knows `(host, port)` connects, sends the name of the
//! group-channel port it is accepting on, and closes. The socket never carries
//! particle data.

use crate::error::{InSituError, Result};
use crate::wire;
use insitu_env::PortName;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Default producer listen port.
///
/// Historically documented as 290374, which does not fit in 16 bits and
/// wraps to this value.
pub const DEFAULT_PORT: u16 = 28230;

/// Listen backlog of the rendezvous socket.
pub const LISTEN_BACKLOG: u32 = 5;

/// Opens the rendezvous connection to a producer.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| InSituError::connect(target.clone(), e))?;
    tracing::debug!(target = %target, "Rendezvous connection open");
    Ok(stream)
}

/// Sends `name` over an open rendezvous connection and closes it.
pub async fn publish(mut stream: TcpStream, name: &PortName) -> Result<()> {
    wire::write_port_name(&mut stream, name).await?;
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(error = %e, "Rendezvous shutdown failed");
    }
    Ok(())
}

/// Connects to `(host, port)` and publishes `name`.
pub async fn announce(host: &str, port: u16, name: &PortName) -> Result<()> {
    let stream = connect(host, port).await?;
    publish(stream, name).await
}

/// Reads one port name from an accepted rendezvous connection.
pub async fn receive(stream: &mut TcpStream) -> Result<PortName> {
    wire::read_port_name(stream).await
}

/// Binds the producer's rendezvous listener with address reuse enabled.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |e: std::io::Error| InSituError::config(format!("cannot listen on {}: {}", addr, e));

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}
