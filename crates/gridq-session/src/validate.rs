//! Dataset validation and staged-data readiness

use crate::error::{Result, SessionError};
use crate::registry::TargetSet;
use crate::session::Session;
use gridq_core::{CoordinatorMessage, DataElement, Dataset, WorkerId, WorkerRole};
use std::collections::HashMap;
use tracing::{debug, info};

impl Session {
    /// Validate a dataset's elements against the actual data on the workers.
    ///
    /// Unvalidated elements are distributed over the active workers (to the
    /// worker on the element's host where possible, round-robin otherwise)
    /// and the verdicts collected back into the dataset. Returns the number
    /// of elements that became valid.
    pub async fn validate_dataset(&mut self, dset: &mut Dataset) -> Result<usize> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        if dset.elements_valid() {
            return Ok(0);
        }

        let hosts: Vec<(WorkerId, String)> = self
            .registry
            .ids(TargetSet::Active)
            .into_iter()
            .filter_map(|id| {
                self.registry
                    .worker(id)
                    .filter(|w| w.is_valid())
                    .map(|w| (id, w.host().to_string()))
            })
            .collect();
        if hosts.is_empty() {
            return Err(SessionError::NoActiveWorkers);
        }

        // host-affine assignment first, round-robin for the rest
        let mut assignments: HashMap<WorkerId, Vec<DataElement>> = HashMap::new();
        let mut next = 0usize;
        for element in dset.elements.iter().filter(|e| !e.valid) {
            let local = (!element.host.is_empty())
                .then(|| hosts.iter().find(|(_, h)| *h == element.host))
                .flatten()
                .map(|(id, _)| *id);
            let target = local.unwrap_or_else(|| {
                let id = hosts[next % hosts.len()].0;
                next += 1;
                id
            });
            assignments.entry(target).or_default().push(element.clone());
        }

        self.validated.clear();
        let mut used = Vec::new();
        for (id, elements) in assignments {
            let transport = match self.registry.worker(id) {
                Some(w) if w.is_valid() => w.transport(),
                _ => None,
            };
            let Some(transport) = transport else { continue };
            debug!(worker = %id, elements = elements.len(), "sending elements for validation");
            if transport
                .send(CoordinatorMessage::ValidateElements { elements })
                .await
                .is_err()
            {
                self.mark_bad(id);
            } else {
                used.push(id);
            }
        }
        self.collect_workers(&used).await?;

        let verdicts = std::mem::take(&mut self.validated);
        let mut validated = 0;
        for element in &mut dset.elements {
            if !element.valid && verdicts.iter().any(|v| v.key() == element.key()) {
                element.valid = true;
                validated += 1;
            }
        }
        info!(validated, total = dset.elements.len(), "dataset validated");
        Ok(validated)
    }

    /// See whether the data staged behind the active submasters is ready to
    /// be analyzed. Returns (ready, total bytes, bytes ready).
    pub async fn is_data_ready(&mut self) -> Result<(bool, u64, u64)> {
        if !self.valid {
            return Err(SessionError::InvalidSession);
        }
        let submasters: Vec<WorkerId> = self
            .registry
            .ids(TargetSet::Active)
            .into_iter()
            .filter(|id| {
                self.registry
                    .worker(*id)
                    .map(|w| w.role() == WorkerRole::Submaster && w.is_valid())
                    .unwrap_or(false)
            })
            .collect();

        self.data_ready = true;
        self.total_bytes = 0;
        self.ready_bytes = 0;

        if !submasters.is_empty() {
            self.broadcast_to(&submasters, CoordinatorMessage::DataReady).await;
            self.collect_workers(&submasters).await?;
        }

        info!(
            ready = self.data_ready,
            bytes_ready = self.ready_bytes,
            total_bytes = self.total_bytes,
            "data readiness"
        );
        Ok((self.data_ready, self.total_bytes, self.ready_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::{channel_pair, Outbound, WorkerEndpoint};
    use crate::worker::Worker;
    use gridq_core::{WorkerMessage, WorkerSpec};
    use std::sync::Arc;

    fn session_with_hosts(hosts: &[&str]) -> (Session, Vec<(WorkerId, WorkerEndpoint)>) {
        let mut session = Session::new(SessionConfig::default());
        session.valid = true;
        let mut endpoints = Vec::new();
        for (i, host) in hosts.iter().enumerate() {
            let (transport, endpoint) = channel_pair();
            let spec = WorkerSpec::worker(*host, 9931, format!("0.{i}"));
            let id = session
                .registry
                .add(Worker::connected(spec, Arc::new(transport), 1))
                .unwrap();
            endpoints.push((id, endpoint));
        }
        session.registry.set_parallelism(u32::MAX);
        (session, endpoints)
    }

    #[tokio::test]
    async fn test_validate_assigns_by_host_and_applies_verdicts() {
        let (mut session, mut endpoints) = session_with_hosts(&["node0", "node1"]);

        let mut dset = Dataset::new();
        dset.add(DataElement::new("a.dat", 0, 100).on_host("node1"));
        dset.add(DataElement::new("b.dat", 0, 50));

        let mut drivers = Vec::new();
        for (_, mut endpoint) in endpoints.drain(..) {
            drivers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                if let Some(Outbound::Message(CoordinatorMessage::ValidateElements {
                    mut elements,
                })) = endpoint.recv().await
                {
                    for e in &mut elements {
                        e.valid = true;
                    }
                    got = elements.clone();
                    endpoint.send(WorkerMessage::ValidateElements { elements });
                }
                (got, endpoint)
            }));
        }

        let validated = session.validate_dataset(&mut dset).await.unwrap();
        assert_eq!(validated, 2);
        assert!(dset.elements_valid());

        let mut by_host = HashMap::new();
        for driver in drivers {
            let (got, endpoint) = driver.await.unwrap();
            for e in got {
                by_host.insert(e.file.clone(), ());
            }
            drop(endpoint);
        }
        assert_eq!(by_host.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_all_valid_is_noop() {
        let (mut session, _endpoints) = session_with_hosts(&["node0"]);
        let mut dset = Dataset::new();
        let mut element = DataElement::new("a.dat", 0, 10);
        element.valid = true;
        dset.add(element);

        assert_eq!(session.validate_dataset(&mut dset).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_data_ready_with_no_submasters() {
        let (mut session, _endpoints) = session_with_hosts(&["node0"]);
        let (ready, total, staged) = session.is_data_ready().await.unwrap();
        assert!(ready);
        assert_eq!(total, 0);
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_data_ready_aggregates_submasters() {
        let mut session = Session::new(SessionConfig::default());
        session.valid = true;
        let mut endpoints = Vec::new();
        for i in 0..2 {
            let (transport, endpoint) = channel_pair();
            let spec = WorkerSpec::submaster(format!("sm{i}"), 9931, format!("0.{i}"));
            session
                .registry
                .add(Worker::connected(spec, Arc::new(transport), 2))
                .unwrap();
            endpoints.push(endpoint);
        }
        session.registry.set_parallelism(u32::MAX);

        let mut drivers = Vec::new();
        for (i, mut endpoint) in endpoints.drain(..).enumerate() {
            drivers.push(tokio::spawn(async move {
                assert_eq!(
                    endpoint.recv_message().await,
                    Some(CoordinatorMessage::DataReady)
                );
                endpoint.send(WorkerMessage::DataReady {
                    ready: i == 0,
                    total_bytes: 1000,
                    ready_bytes: if i == 0 { 1000 } else { 400 },
                });
                endpoint
            }));
        }

        let (ready, total, staged) = session.is_data_ready().await.unwrap();
        assert!(!ready);
        assert_eq!(total, 2000);
        assert_eq!(staged, 1400);

        for driver in drivers {
            drop(driver.await.unwrap());
        }
    }
}
