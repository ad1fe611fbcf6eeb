//! Binary support library: CLI surface, configuration, and the resolver
//! that couples search, the rapid pipeline and the HTTP engine.

pub mod cli;
pub mod config;
pub mod extract;
pub mod observer;
pub mod resolver;
