//! wipd: Windows image preparation daemon.
//!
//! Accepts build requests over HTTP, resolves drivers and updates for the
//! target device, drives the imaging tool through a fixed pipeline, and
//! exports a finished installation image. The imaging boundary is a trait,
//! so the whole engine runs against a simulated tool on any platform.

pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod imaging;
pub mod logging;
pub mod web;
