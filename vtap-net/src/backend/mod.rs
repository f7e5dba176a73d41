//! Network-stack backends.
//!
//! The backend is picked once from configuration. The tap device only ever
//! sees `Arc<dyn StackAdapter>`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::TapSettings;
use crate::stack::{LinkInfo, StackAdapter};

pub mod smoltcp_stack;

pub use smoltcp_stack::SmoltcpStack;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No stack; only raw sockets work
    None,
    #[default]
    Smoltcp,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::None => f.write_str("none"),
            BackendKind::Smoltcp => f.write_str("smoltcp"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(BackendKind::None),
            "smoltcp" => Ok(BackendKind::Smoltcp),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Instantiate the backend for one device.
pub fn select(
    kind: BackendKind,
    link: &LinkInfo,
    settings: &TapSettings,
) -> Option<Arc<dyn StackAdapter>> {
    let adapter: Arc<dyn StackAdapter> = match kind {
        BackendKind::None => return None,
        BackendKind::Smoltcp => Arc::new(SmoltcpStack::new(link, settings)),
    };
    info!(device = %link.name(), backend = adapter.name(), "Selected network stack");
    Some(adapter)
}
