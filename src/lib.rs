//! Devgate - A development reverse proxy that keeps its backend up to date
//!
//! Before relaying a request the gate:
//! - Runs a staleness check command and, if the backend is out of date or not
//!   running, stops it, rebuilds it and starts it again
//! - Polls the backend URL until it answers, giving up after a fixed budget
//! - Serializes all of this behind a single lock, so concurrent requests
//!   collapse into one reload
//! - Answers failed reloads (and backend server errors) with the captured
//!   build and run output instead of a bare connection error

pub mod builder;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod proxy;
pub mod relay;
pub mod staleness;
pub mod stats;
