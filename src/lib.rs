//! soundwatch - a polling notification bot for TikTok sounds and hashtags
//!
//! Chats subscribe to targets (sound ids or hashtags) via Telegram commands.
//! A scheduler loop polls each target's public page, computes the new-item
//! subset against persisted state, commits the updated state, and fans one
//! notification per (subscriber, new item) pair out to Telegram.

pub mod commands;
pub mod config;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod novelty;
pub mod scheduler;
pub mod store;
