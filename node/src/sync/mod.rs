// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Peer-to-peer chain synchronization.
//!
//! One session per peer connection, all sessions independent; every
//! resulting commit funnels through the chain store's single write path.

pub mod listener;
pub mod session;
pub mod wire;
