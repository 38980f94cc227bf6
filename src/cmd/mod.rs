//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `tasks`         | `InitDb`, `Sweep`, `Tasks`, `Status`               |
//! | `breakers`      | `Breakers`                                         |
//! | `config`        | `Config`                                           |

pub mod breakers;
pub mod config;
pub mod serve;
pub mod tasks;

pub use breakers::cmd_breakers;
pub use config::cmd_config;
pub use serve::cmd_serve;
pub use tasks::{cmd_init_db, cmd_status, cmd_sweep, cmd_tasks};
