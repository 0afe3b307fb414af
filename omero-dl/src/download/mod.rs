mod engine;
mod fileset;
mod progress;

pub use engine::{DownloadError, DownloadRun, Tick};
pub use fileset::{FilesetIndex, FilesetResolver, collect_fileset_ids};
pub use progress::{DownloadProgressState, ProgressObserver, ProgressThrottle};
