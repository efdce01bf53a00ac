pub mod builder;
pub mod publisher;
pub mod tag;
pub mod types;

pub use publisher::Publisher;
pub use tag::TagGenerator;
pub use types::{Artifact, BuildContext, Digest, ImageSource, PublishError, PublishOptions, PublishResult};
