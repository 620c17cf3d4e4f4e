//! Node wiring: configuration, relay election, startup sequence.

pub mod config;
pub mod mode;
pub mod node;

pub use config::{NodeConfig, CONFIG_FILE};
pub use mode::{select_mode, MdnsLocator, Mode, RelayLocator};
pub use node::{local_ip, run};
