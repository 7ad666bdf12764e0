use std::net::SocketAddr;
use std::time::SystemTime;

use uuid::Uuid;

use crate::destination::Destination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub peer_addr: SocketAddr,
    pub destination: Destination,
    pub connected_at: SystemTime,
}

impl ConnectionInfo {
    pub fn new(peer_addr: SocketAddr, destination: Destination) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            peer_addr,
            destination,
            connected_at: SystemTime::now(),
        }
    }
}
