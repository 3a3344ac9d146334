use actix::prelude::*;

/// Message to tell the SupervisorActor to shut the service down.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SystemShutdown {
    pub reason: String,
}

/// Message to register a component with the supervisor for health monitoring
#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterActor {
    pub name: String,
}

impl RegisterActor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Message to drop a component from health monitoring, e.g. after a clean stop
#[derive(Message)]
#[rtype(result = "()")]
pub struct UnregisterActor {
    pub name: String,
}
