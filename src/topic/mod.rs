mod registry;

pub use registry::{ResolveContext, TopicRegistry};
