pub mod command;
pub mod config;
pub mod dedup;
pub mod definition;
pub mod directory_sensor;
pub mod due;
pub mod error;
pub mod evaluation;
pub mod instance;
pub mod io;
pub mod launcher;
pub mod paths;
pub mod schedule;
pub mod state;
pub mod storage;
pub mod tick;
pub mod workspace;

pub use error::{InstigateError, Result};
