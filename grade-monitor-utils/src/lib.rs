#[macro_use]
pub mod macros;

pub mod credentials;
pub mod fs_json_util;
