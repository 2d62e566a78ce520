//! CLI command implementations.
//!
//! | Module       | Commands handled |
//! |--------------|------------------|
//! | `run`        | `Run`, `Manifest`|
//! | `coordinate` | `Coordinate`     |
//! | `config`     | `Config`         |
//! | `demo`       | catalog shared by all of them |

pub mod config;
pub mod coordinate;
pub mod demo;
pub mod run;

pub use config::cmd_config;
pub use coordinate::cmd_coordinate;
pub use run::{cmd_manifest, cmd_run};
