//! Credential core for read-only E*TRADE access: OAuth 1.0a signing, the three-legged
//! authorization handshake, per-profile token storage and renewal, and an authenticated
//! client with thin account and market-data services on top.

pub mod api;
pub mod auth;
pub mod config;
pub mod profile;
pub mod services;
