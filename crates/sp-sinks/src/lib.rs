// SPDX-License-Identifier: Apache-2.0

//! Concrete sink implementations, one module per protocol.
//!
//! Every module exposes a `register(registry: &mut SinkRegistry)` that wires
//! its factory under the kind string the configuration schema expects;
//! [`register_all`] is the single call site the processor root uses at boot.

pub mod mjpeg;
pub mod rtsp;
pub mod webhook;
pub mod websocket;

use fnmesh_sink::SinkRegistry;

pub fn register_all(registry: &mut SinkRegistry) {
    mjpeg::register(registry);
    rtsp::register(registry);
    websocket::register(registry);
    webhook::register(registry);
}
