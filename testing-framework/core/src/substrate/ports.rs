use std::{
    collections::BTreeMap,
    io,
    net::{Ipv4Addr, TcpListener as StdTcpListener},
    sync::LazyLock,
};

use tokio::sync::{RwLock, RwLockReadGuard};

use super::engine::PortBinding;

/// Serializes host-port reservation against container start across every
/// interchain in the process: a port is reserved by holding its listener and
/// only released right before the engine binds it.
static PORT_LOCK: LazyLock<RwLock<()>> = LazyLock::new(|| RwLock::new(()));

/// Listeners held until the owning container starts.
#[derive(Debug, Default)]
pub struct PortReservation {
    listeners: Vec<StdTcpListener>,
}

impl PortReservation {
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Frees the reserved ports; call while holding [`start_guard`].
    pub fn release(self) {
        drop(self.listeners);
    }
}

/// Binds an ephemeral port for every container port that has no fixed override.
pub async fn reserve_ports(
    container_ports: &[String],
    overrides: &BTreeMap<String, u16>,
) -> io::Result<(Vec<PortBinding>, PortReservation)> {
    let _guard = PORT_LOCK.write().await;

    let mut bindings = Vec::with_capacity(container_ports.len());
    let mut reservation = PortReservation::default();
    for container_port in container_ports {
        let host_port = if let Some(fixed) = overrides.get(container_port) {
            *fixed
        } else {
            let listener = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            let port = listener.local_addr()?.port();
            reservation.listeners.push(listener);
            port
        };
        bindings.push(PortBinding {
            container_port: container_port.clone(),
            host_ip: Ipv4Addr::UNSPECIFIED.to_string(),
            host_port: Some(host_port),
        });
    }

    Ok((bindings, reservation))
}

/// Held by a starter between releasing its reservation and the engine start.
pub async fn start_guard() -> RwLockReadGuard<'static, ()> {
    PORT_LOCK.read().await
}

/// Normalizes `26657` into `26657/tcp`.
#[must_use]
pub fn tcp_port(port: &str) -> String {
    if port.contains('/') {
        port.to_owned()
    } else {
        format!("{port}/tcp")
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, net::TcpListener};

    use super::*;

    #[tokio::test]
    async fn reserved_ports_are_held_until_release() {
        let ports = vec!["26657/tcp".to_owned(), "9090/tcp".to_owned()];
        let (bindings, reservation) = reserve_ports(&ports, &BTreeMap::new())
            .await
            .expect("reserve ports");

        assert_eq!(bindings.len(), 2);
        assert_eq!(reservation.len(), 2);
        let first = bindings[0].host_port.expect("port assigned");
        assert!(TcpListener::bind(("0.0.0.0", first)).is_err());

        let _guard = start_guard().await;
        reservation.release();
        assert!(TcpListener::bind(("0.0.0.0", first)).is_ok());
    }

    #[tokio::test]
    async fn overrides_skip_reservation() {
        let ports = vec!["26657/tcp".to_owned()];
        let overrides = BTreeMap::from([("26657/tcp".to_owned(), 36657)]);
        let (bindings, reservation) = reserve_ports(&ports, &overrides)
            .await
            .expect("reserve ports");

        assert!(reservation.is_empty());
        assert_eq!(bindings[0].host_port, Some(36657));
    }

    #[test]
    fn bare_ports_get_tcp_suffix() {
        assert_eq!(tcp_port("26657"), "26657/tcp");
        assert_eq!(tcp_port("30333/udp"), "30333/udp");
    }
}
