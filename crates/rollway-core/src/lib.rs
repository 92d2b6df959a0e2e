mod channel;
mod error;
mod manifest;
mod release;
mod version;

pub use channel::Channel;
pub use error::UpdateError;
pub use manifest::{PackageManifest, PACKAGE_MANIFEST_FILE};
pub use release::ReleaseRecord;
pub use version::{parse_version, sort_versions_descending};
