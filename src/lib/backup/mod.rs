pub mod archive;
pub mod manager;
pub mod types;

pub use manager::{BackupCoordinator, BackupPaths};
pub use types::{BackupArchive, BackupSelection};
