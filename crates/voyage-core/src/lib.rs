//! Session core for the Voyage travel-booking client: credential persistence, observable
//! session state, the auth API calls and the authenticated request pipeline.

pub mod api;
pub mod auth;
pub mod config;
pub mod logging;
