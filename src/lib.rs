pub mod board;
pub mod clock;
pub mod config;
pub mod conversions;
pub mod destination;
pub mod error;
pub mod fusion;
pub mod markers;
pub mod network;
pub mod node;
pub mod pipeline;
pub mod queue;
pub mod reading;
pub mod readings_log;
pub mod replay;
pub mod sleep;
pub mod stats;
