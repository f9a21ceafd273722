//! Test harness: an in-memory remote store plus recording renderer and
//! notifier, wired into a ready-to-drive [`TestApp`].

pub mod app;
pub mod memory_remote;
pub mod recorder;

pub use app::{HOUSEHOLD, START_MS, TestApp, UID};
pub use memory_remote::{CommitRecord, Fault, MemoryRemote, RemoteOp};
pub use recorder::{RecordingNotifier, RecordingRenderer};

use tracing_subscriber::EnvFilter;

/// Route engine logs to the test writer. `RUST_LOG` overrides the default
/// `warn` level. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
