//! Push-based discovery protocol
//!
//! Data-plane subscribers open a long-lived framed stream, authenticate
//! with their proxy token, and subscribe to resource collections. The
//! server pushes every snapshot version change for the subscriber's
//! cluster; subscribers ack or nack each push.

pub mod server;
pub mod wire;

pub use server::{DiscoveryLimits, DiscoveryServer};
pub use wire::{AckFrame, DiscoveryResponse, Frame, NackFrame, Resources, SubscribeRequest};
