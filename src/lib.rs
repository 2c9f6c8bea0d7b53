//! LE Connected Isochronous Stream link layer controller.
//!
//! Implements the CIS sub-state-machine of a BLE link layer: stream and
//! group registries, the establishment and termination actions, the
//! nested LLCP termination procedure, and the host notifications. The
//! surrounding controller (baseband scheduler, timers, codec, transmit
//! power table, dispatch loop) is abstracted behind
//! [`ops::ControllerOps`].

pub mod llcp;
pub mod ops;
pub mod packets;

pub use llcp::iso::{
    AclParameters, CigContext, CigParameters, CisContext, CisParameters, CisState, CloseOutcome,
    Config, IsoDataPathId, IsoManager,
};
pub use llcp::manager::{CisEvent, LinkLayer, LinkLayerError, LlcpCisEvent};
pub use ops::{BodHandle, ControllerOps, Message, PhyOptions, TimerId};
