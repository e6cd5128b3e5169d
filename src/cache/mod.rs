pub mod error;
pub mod layout;
pub mod locks;
pub mod orchestrator;
pub mod probe;
pub mod transport;

pub use error::{ErrorKind, MirrorError};
pub use layout::MirrorLayout;
pub use orchestrator::{CacheLimits, MirrorCache};
pub use probe::{ProbeError, RemoteProber};
pub use transport::MirrorTransport;
