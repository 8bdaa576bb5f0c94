pub mod budget;
pub mod chat;
pub mod config_cmd;
pub mod tools;
