use std::sync::Arc;

use anyhow::Context;

use crate::multicast::receive_endpoint::ReceiveEndpoint;
use crate::multicast::send_endpoint::SendEndpoint;
use crate::multicast::{DatagramReceiver, DatagramSender};
use crate::relay::relay_config::RelayConfig;
use crate::relay::route_mapping::RouteMapping;

/// The sockets of one direction. They are owned by the direction and closed when it terminates.
pub struct DirectionEndpoints {
    pub receiver: Arc<dyn DatagramReceiver>,
    pub sender: Arc<dyn DatagramSender>,
}

/// Opens the endpoints for a direction. This is called once per direction at startup, and
///  again each time a direction is restarted.
pub trait EndpointFactory: Send + Sync + 'static {
    fn open(&self, mapping: &RouteMapping, config: &RelayConfig) -> anyhow::Result<DirectionEndpoints>;
}

/// Opens real multicast sockets
pub struct MulticastEndpointFactory;

impl EndpointFactory for MulticastEndpointFactory {
    fn open(&self, mapping: &RouteMapping, config: &RelayConfig) -> anyhow::Result<DirectionEndpoints> {
        let receiver = ReceiveEndpoint::open(*mapping.source.ip(), mapping.source.port(), mapping.interface, config.multicast_loop)
            .with_context(|| format!("route {}: cannot open receive endpoint for {}", mapping.name, mapping.source))?;
        let sender = SendEndpoint::open(mapping.interface, config.multicast_ttl)
            .with_context(|| format!("route {}: cannot open send endpoint", mapping.name))?;

        Ok(DirectionEndpoints {
            receiver: Arc::new(receiver),
            sender: Arc::new(sender),
        })
    }
}
