pub mod background;
pub mod detector;
pub mod mask;
pub mod pipeline;

pub use background::{BackgroundModel, BackgroundSnapshot};
pub use detector::{Detection, Detector};
pub use mask::{MaskDefinition, Point, PolygonMask};
pub use pipeline::{Analysis, HivePipeline};
