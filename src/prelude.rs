pub use anyhow::Context;
pub use tracing::{debug, error, info, instrument, trace, warn};
