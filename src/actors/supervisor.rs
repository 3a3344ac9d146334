use actix::prelude::*;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::messages::supervisor::{RegisterActor, SystemShutdown, UnregisterActor};
use crate::messages::{ActorFailed, ActorHealth, GetSystemHealth, HealthCheck, SystemHealth};

/// SupervisorActor keeps the health of the service's components and
/// coordinates shutdown through a cancellation token.
pub struct SupervisorActor {
    start_time: Instant,
    actor_health: HashMap<String, ActorHealth>,
    shutdown: CancellationToken,
    shutdown_requested: bool,
}

impl Actor for SupervisorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("SupervisorActor started");

        // Schedule periodic health checks
        ctx.run_interval(Duration::from_secs(30), |actor, _ctx| {
            actor.perform_health_check();
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("SupervisorActor stopped");
    }
}

impl SupervisorActor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            start_time: Instant::now(),
            actor_health: HashMap::new(),
            shutdown,
            shutdown_requested: false,
        }
    }

    /// Register a new component for health monitoring
    pub fn register_actor(&mut self, name: String) {
        let health = ActorHealth {
            name: name.clone(),
            healthy: true,
            error_count: 0,
            last_error: None,
            last_seen: Some(Utc::now().timestamp()),
        };
        self.actor_health.insert(name.clone(), health);
        info!("Registered actor '{}' for monitoring", name);
    }

    fn perform_health_check(&self) {
        let unhealthy_actors: Vec<_> = self
            .actor_health
            .iter()
            .filter(|(_, health)| !health.healthy)
            .map(|(name, _)| name)
            .collect();

        if !unhealthy_actors.is_empty() {
            warn!("Unhealthy actors detected: {:?}", unhealthy_actors);
        }
    }

    fn is_system_healthy(&self) -> bool {
        !self.shutdown_requested && self.actor_health.values().all(|health| health.healthy)
    }
}

impl Handler<RegisterActor> for SupervisorActor {
    type Result = ();

    fn handle(&mut self, msg: RegisterActor, _ctx: &mut Self::Context) -> Self::Result {
        self.register_actor(msg.name);
    }
}

impl Handler<UnregisterActor> for SupervisorActor {
    type Result = ();

    fn handle(&mut self, msg: UnregisterActor, _ctx: &mut Self::Context) -> Self::Result {
        if self.actor_health.remove(&msg.name).is_some() {
            info!("Actor '{}' removed from monitoring", msg.name);
        }
    }
}

impl Handler<ActorFailed> for SupervisorActor {
    type Result = ();

    fn handle(&mut self, msg: ActorFailed, _ctx: &mut Self::Context) -> Self::Result {
        error!("Actor '{}' failed: {}", msg.actor_name, msg.error);

        let health = self
            .actor_health
            .entry(msg.actor_name.clone())
            .or_insert_with(|| ActorHealth {
                name: msg.actor_name.clone(),
                healthy: true,
                error_count: 0,
                last_error: None,
                last_seen: None,
            });
        health.healthy = false;
        health.error_count += 1;
        health.last_error = Some(msg.error);
        health.last_seen = Some(Utc::now().timestamp());
    }
}

impl Handler<HealthCheck> for SupervisorActor {
    type Result = ();

    fn handle(&mut self, msg: HealthCheck, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(health) = self.actor_health.get_mut(&msg.actor_name) {
            health.healthy = msg.healthy;
            health.last_seen = Some(Utc::now().timestamp());
            if msg.healthy {
                health.last_error = None;
            }
        }
    }
}

impl Handler<GetSystemHealth> for SupervisorActor {
    type Result = SystemHealth;

    fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Self::Context) -> Self::Result {
        SystemHealth {
            overall_healthy: self.is_system_healthy(),
            actor_statuses: self.actor_health.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            shutdown_requested: self.shutdown_requested,
        }
    }
}

impl Handler<SystemShutdown> for SupervisorActor {
    type Result = ();

    fn handle(&mut self, msg: SystemShutdown, _ctx: &mut Self::Context) -> Self::Result {
        if self.shutdown_requested {
            return;
        }
        info!("SupervisorActor: shutdown requested ({})", msg.reason);
        self.shutdown_requested = true;
        self.shutdown.cancel();
    }
}
