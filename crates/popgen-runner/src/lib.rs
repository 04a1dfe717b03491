//! popgen runner - generator supervision, output discovery, archive cache and
//! run lifecycle

pub mod archive;
pub mod invoker;
pub mod locator;
pub mod manager;
pub mod registry;

pub use archive::{archive_file_name, ArchiveCache, ArtifactState, ARCHIVE_EXTENSION};
pub use invoker::{build_args, GeneratorInvoker, GeneratorOutput};
pub use locator::latest_run_directory;
pub use manager::{ArchiveHandle, RunManager};
pub use registry::{JsonRunRegistry, RunRegistry};
