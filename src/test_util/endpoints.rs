use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use rustc_hash::FxHashMap;

use crate::relay::endpoint_factory::{DirectionEndpoints, EndpointFactory};
use crate::relay::relay_config::RelayConfig;
use crate::relay::route_mapping::RouteMapping;
use crate::test_util::datagram::{channel_receiver, ChannelReceiver, DatagramInjector, RecordingSender};

/// The test side of one direction's endpoints
#[derive(Clone)]
pub struct TestDirection {
    pub injector: DatagramInjector,
    pub sender: Arc<RecordingSender>,
}

struct TestEndpoints {
    receiver: Arc<ChannelReceiver>,
    sender: Arc<RecordingSender>,
    num_opened: usize,
}

/// An [EndpointFactory] handing out channel-backed endpoints for every route name that was
///  registered up front. Reopening a direction (after a restart) returns the same endpoints,
///  so a test can keep injecting through the same [DatagramInjector].
#[derive(Default)]
pub struct TestEndpointFactory {
    endpoints: Mutex<FxHashMap<String, TestEndpoints>>,
}

impl TestEndpointFactory {
    pub fn new() -> TestEndpointFactory {
        Default::default()
    }

    /// Creates a factory with endpoints for all routes, returning the test side for each route
    ///  in the same order
    pub fn for_routes(routes: &[RouteMapping]) -> (TestEndpointFactory, Vec<TestDirection>) {
        let factory = TestEndpointFactory::new();
        let directions = routes.iter()
            .map(|r| factory.register(&r.name))
            .collect();
        (factory, directions)
    }

    pub fn register(&self, route_name: &str) -> TestDirection {
        let (injector, receiver) = channel_receiver();
        let sender = Arc::new(RecordingSender::new());
        self.lock().insert(route_name.to_string(), TestEndpoints {
            receiver: Arc::new(receiver),
            sender: sender.clone(),
            num_opened: 0,
        });
        TestDirection { injector, sender }
    }

    pub fn num_opened(&self, route_name: &str) -> usize {
        self.lock().get(route_name)
            .map(|e| e.num_opened)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, TestEndpoints>> {
        self.endpoints.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl EndpointFactory for TestEndpointFactory {
    fn open(&self, mapping: &RouteMapping, _config: &RelayConfig) -> anyhow::Result<DirectionEndpoints> {
        let mut endpoints = self.lock();
        let endpoints = endpoints.get_mut(&mapping.name)
            .ok_or_else(|| anyhow!("no test endpoints registered for route {}", mapping.name))?;
        endpoints.num_opened += 1;

        Ok(DirectionEndpoints {
            receiver: endpoints.receiver.clone(),
            sender: endpoints.sender.clone(),
        })
    }
}
