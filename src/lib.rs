//! Announcement dispatch for a speaker-attached playback daemon.
//!
//! The daemon side consists of a [`token`] store, an audio [`catalog`], the
//! [`player`] engine that owns the single audio output, and the HTTP
//! [`server`]. The controller side is the [`client`] with its persisted
//! [`settings`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod player;
pub mod server;
pub mod settings;
pub mod signal;
pub mod token;
