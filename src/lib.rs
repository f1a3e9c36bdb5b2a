#![forbid(unsafe_code)]

// parley — real-time session layer for multi-party video calls: WebSocket
// signaling, in-memory rooms, WebRTC mesh relay, and an SFU control plane.

pub mod auth;
pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod store;
pub mod turn;
