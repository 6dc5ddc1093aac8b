pub mod common;
pub mod creative;
pub mod ui;
