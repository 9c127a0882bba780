mod artifact;

pub(crate) use self::artifact::ArtifactRow;
pub use self::artifact::{Artifact, CacheKey};
