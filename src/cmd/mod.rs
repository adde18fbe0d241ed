//! CLI command implementations.
//!
//! | Module          | Commands handled        |
//! |-----------------|-------------------------|
//! | `serve`         | `Serve`                 |
//! | `compile`       | `Compile`               |
//! | `config`        | `Config`                |

pub mod compile;
pub mod config;
pub mod serve;

pub use compile::cmd_compile;
pub use config::cmd_config;
pub use serve::cmd_serve;
