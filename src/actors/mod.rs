pub mod artifact;
pub mod hive;
pub mod registry;
pub mod supervisor;

pub use artifact::ArtifactActor;
pub use hive::HiveActor;
pub use registry::HiveRegistry;
pub use supervisor::SupervisorActor;
