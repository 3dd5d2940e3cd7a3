//! Core types, config, errors, and the control-event wire model for Lisan.

pub mod config;
pub mod error;
pub mod lesson;
pub mod protocol;
