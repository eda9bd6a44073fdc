//! Background search worker of the channel subscription bot

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod job;
pub mod search;
pub mod transport;
pub mod types;
