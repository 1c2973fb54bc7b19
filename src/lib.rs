//! CAS login service library
//!
//! Protects axum routers with CAS single sign-on.

#![deny(dead_code)]

pub mod cas;
pub mod config;
pub mod web;

use cas::{CasLogin, HttpValidator, MemorySessions};

/// Login filter as wired by the binary
pub type AppLogin = CasLogin<MemorySessions, HttpValidator>;
