//! Process exit codes, kept in step with existing deployments.

pub const SUCCESS: i32 = 0;
pub const OPTION_ERROR: i32 = -1;
pub const SERIAL_SETUP_ERROR: i32 = -3;
pub const FILE_OPEN_ERROR: i32 = -4;
