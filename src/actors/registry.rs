use actix::prelude::*;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info};

use crate::actors::{ArtifactActor, HiveActor, SupervisorActor};
use crate::config::Config;
use crate::consumer::envelope::FrameMessage;
use crate::detection::{HivePipeline, PolygonMask};
use crate::error::{ErrorKind, HivewatchError};
use crate::messages::supervisor::RegisterActor;
use crate::messages::{ActorFailed, FrameOutcome, GetHiveStats, HiveStats, ProcessFrame};
use crate::store::ResultStore;

struct HiveHandle {
    addr: Addr<HiveActor>,
    arbiter: ArbiterHandle,
}

#[derive(Default)]
struct Hives {
    running: HashMap<String, HiveHandle>,
    /// Hives stopped by a configuration error, with the reason.
    halted: HashMap<String, String>,
}

/// Routes frames to per-hive workers, starting each on its own arbiter the
/// first time the hive is seen.
pub struct HiveRegistry {
    config: Arc<Config>,
    store: Arc<dyn ResultStore>,
    artifacts: Option<Addr<ArtifactActor>>,
    supervisor: Option<Addr<SupervisorActor>>,
    hives: Mutex<Hives>,
}

impl HiveRegistry {
    pub fn new(config: Arc<Config>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            config,
            store,
            artifacts: None,
            supervisor: None,
            hives: Mutex::new(Hives::default()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Addr<ArtifactActor>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Addr<SupervisorActor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Hives>, HivewatchError> {
        self.hives
            .lock()
            .map_err(|_| HivewatchError::Other("hive registry lock poisoned".to_string()))
    }

    /// Start workers for the configured hives. Any failure here is fatal.
    pub fn preload(&self) -> Result<(), HivewatchError> {
        for hive_id in &self.config.masks.hives {
            self.worker(hive_id)?;
        }
        Ok(())
    }

    /// Address of the hive's worker, starting it if needed.
    pub fn worker(&self, hive_id: &str) -> Result<Addr<HiveActor>, HivewatchError> {
        let mut hives = self.lock()?;
        if let Some(reason) = hives.halted.get(hive_id) {
            return Err(HivewatchError::Configuration(format!(
                "hive {} is halted: {}",
                hive_id, reason
            )));
        }
        if let Some(handle) = hives.running.get(hive_id) {
            return Ok(handle.addr.clone());
        }

        let mask = match PolygonMask::load(&self.config.masks.dir, hive_id) {
            Ok(mask) => mask,
            Err(err) => {
                drop(hives);
                self.halt(hive_id, &err);
                return Err(err);
            }
        };

        let pipeline = HivePipeline::from_config(Arc::new(mask), &self.config);
        let actor = HiveActor::new(pipeline, self.store.clone(), self.config.store.store_images)
            .with_artifacts(self.artifacts.clone());
        let arbiter = Arbiter::new().handle();
        let addr = HiveActor::start_in_arbiter(&arbiter, move |_ctx| actor);

        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(RegisterActor::new(format!("hive:{}", hive_id)));
        }
        info!(target: "hive", hive_id, "Started hive worker");

        hives.running.insert(
            hive_id.to_string(),
            HiveHandle {
                addr: addr.clone(),
                arbiter,
            },
        );
        Ok(addr)
    }

    /// Hand a frame to its hive worker and wait for the outcome.
    pub async fn dispatch(
        &self,
        frame: FrameMessage,
        timeout: Duration,
    ) -> Result<FrameOutcome, HivewatchError> {
        let hive_id = frame.hive_id.clone();
        let addr = self.worker(&hive_id)?;

        let outcome = match tokio::time::timeout(timeout, addr.send(ProcessFrame { frame })).await
        {
            Err(_) => Err(HivewatchError::timeout("hive worker")),
            Ok(Err(mailbox)) => Err(HivewatchError::TransientIo(format!(
                "hive {} worker unavailable: {}",
                hive_id, mailbox
            ))),
            Ok(Ok(outcome)) => outcome,
        };

        if let Err(err) = &outcome {
            if err.kind() == ErrorKind::Configuration {
                self.halt(&hive_id, err);
            }
        }
        outcome
    }

    /// Stop a hive after a configuration error. Later frames for it fail fast.
    pub fn halt(&self, hive_id: &str, err: &HivewatchError) {
        let Ok(mut hives) = self.lock() else {
            return;
        };
        if let Some(handle) = hives.running.remove(hive_id) {
            handle.arbiter.stop();
        }
        hives.halted.insert(hive_id.to_string(), err.to_string());
        drop(hives);

        error!(target: "hive", hive_id, "Hive halted: {}", err);
        if let Some(supervisor) = &self.supervisor {
            supervisor.do_send(ActorFailed {
                actor_name: format!("hive:{}", hive_id),
                error: err.to_string(),
            });
        }
    }

    pub fn is_halted(&self, hive_id: &str) -> bool {
        self.lock()
            .map(|hives| hives.halted.contains_key(hive_id))
            .unwrap_or(false)
    }

    pub fn hive_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .map(|hives| hives.running.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> Vec<HiveStats> {
        let addrs: Vec<Addr<HiveActor>> = self
            .lock()
            .map(|hives| hives.running.values().map(|h| h.addr.clone()).collect())
            .unwrap_or_default();

        let mut stats: Vec<HiveStats> = join_all(addrs.iter().map(|addr| addr.send(GetHiveStats)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        stats.sort_by(|a, b| a.hive_id.cmp(&b.hive_id));
        stats
    }

    /// Stop every hive arbiter. Queued frames are dropped; unacked messages are redelivered.
    pub fn shutdown(&self) {
        if let Ok(mut hives) = self.lock() {
            for (hive_id, handle) in hives.running.drain() {
                info!(target: "hive", hive_id = %hive_id, "Stopping hive worker");
                handle.arbiter.stop();
            }
        }
    }
}
