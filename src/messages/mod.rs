pub mod artifact;
pub mod hive;
pub mod supervisor;
pub mod system;

pub use artifact::*;
pub use hive::*;
pub use system::*;
