// SPDX-License-Identifier: Apache-2.0

//! Concrete trigger implementations, one module per protocol.
//!
//! Every module exposes a `register(registry: &mut TriggerRegistry)` that
//! wires its factory under the kind string the configuration schema expects;
//! [`register_all`] is the single call site the processor root uses at boot.

pub mod extproc;
pub mod job;
pub mod mjpeg;
pub mod openinference;
pub mod ringbuffer;
pub mod rtsp;
pub mod websocket;

use fnmesh_trigger::TriggerRegistry;

pub fn register_all(registry: &mut TriggerRegistry) {
    mjpeg::register(registry);
    rtsp::register(registry);
    websocket::register(registry);
    extproc::register(registry);
    job::register(registry);
    openinference::register(registry);
}
