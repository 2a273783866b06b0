//! Standard APIs we use everywhere.

pub use std::sync::Arc;

pub use serde::{Deserialize, Serialize};
pub use serde_json::{Value, json};
#[allow(unused_imports)]
pub use tracing::{debug, error, info, instrument, trace, warn};

pub use crate::error::{ConductorError, Result};
