pub mod logging;

pub use logging::{
    FileLogger, StdoutLogger, format_timestamp, format_today, init_file_logger,
    init_stdout_logger, level_from_env,
};

// Re-export log crate so downstream crates can use ember_base::log::*
pub use log;
