//! Sliding-window statistics.

mod bucket;
mod leap_array;
mod node;
mod registry;

pub use bucket::Bucket;
pub use bucket::MetricBucket;
pub use bucket::MetricEvent;
pub use leap_array::LeapArray;
pub use leap_array::WindowWrap;
pub use node::EntryType;
pub use node::ResourceNode;
pub use node::ResourceSnapshot;
pub use registry::NodeRegistry;
