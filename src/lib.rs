//! gridrun: drive an in-process test suite runner from a remote coordinator.
//!
//! | Module        | Role                                                    |
//! |---------------|---------------------------------------------------------|
//! | `suite`       | Collection phase, suite tree, test ids, manifests       |
//! | `engine`      | Executes one suite: hooks, retries, timeouts, events    |
//! | `report`      | Engine outcomes → protocol results                      |
//! | `session`     | Runner half of the coordinator protocol                 |
//! | `coordinator` | Coordinator half, plus a scripted coordinator           |
//! | `bridge`      | One session, one suite run per dispatched test case     |
//! | `source`      | Test-file discovery and loading                         |
//! | `config`      | `gridrun.toml` + environment settings                   |

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod output;
pub mod report;
pub mod session;
pub mod source;
pub mod suite;

pub use bridge::{Bridge, SessionSummary};
pub use config::BridgeConfig;
pub use errors::{BridgeError, StructuralError, SuiteLoadError};
pub use source::{SuiteCatalog, TestSource};
pub use suite::SuiteBuilder;
