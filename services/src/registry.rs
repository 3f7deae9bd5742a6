//! Microservice factory table.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use common::Error;
use network::fiber::Demux;

/// Free-form parameters of a service instantiation.
pub type Parameters = BTreeMap<String, String>;

/// A started microservice; stopping aborts its task.
pub struct RunningService {
    service_id: u32,
    task: tokio::task::JoinHandle<()>,
}

impl RunningService {
    pub fn new(service_id: u32, task: tokio::task::JoinHandle<()>) -> Self {
        Self { service_id, task }
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Factory = Box<dyn Fn(Demux, &Parameters) -> anyhow::Result<RunningService> + Send + Sync>;

/// Table of service constructors keyed by numeric service id. Registration
/// is explicit; the host owns the registry and tears it down with the
/// process.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: Mutex<HashMap<u32, Factory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor; fails with `address_in_use` on a duplicate
    /// id.
    pub fn register<F>(&self, service_id: u32, factory: F) -> Result<(), Error>
    where
        F: Fn(Demux, &Parameters) -> anyhow::Result<RunningService> + Send + Sync + 'static,
    {
        let mut factories = self.factories.lock().unwrap();
        if factories.contains_key(&service_id) {
            return Err(Error::AddressInUse);
        }
        factories.insert(service_id, Box::new(factory));
        Ok(())
    }

    pub fn unregister(&self, service_id: u32) {
        self.factories.lock().unwrap().remove(&service_id);
    }

    /// Instantiates a service on `demux`.
    pub fn create(
        &self,
        service_id: u32,
        demux: Demux,
        parameters: &Parameters,
    ) -> anyhow::Result<RunningService> {
        let factories = self.factories.lock().unwrap();
        let factory = factories
            .get(&service_id)
            .ok_or(Error::ProtocolNotSupported)?;
        factory(demux, parameters)
    }

    pub fn is_registered(&self, service_id: u32) -> bool {
        self.factories.lock().unwrap().contains_key(&service_id)
    }
}
