pub mod flags;
pub mod output;
pub mod pid;
pub mod plane;

pub use flags::{CrawlFlags, FlagFile};
pub use output::{OutputCallbacks, OutputEvent, Reporter};
pub use plane::{ChildProcessBackend, ControlPlane, ControlStatus, InProcessBackend, WorkerBackend};
