// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::packets::hci;

/// Opaque handle of the baseband operation descriptor scheduling a CIG's
/// recurring radio activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BodHandle(pub u32);

/// Timers driven by the surrounding controller on behalf of this
/// subsystem. Expiry comes back as an event, never as a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    /// CIS supervision timer, keyed by CIS connection handle.
    CisSupervision(u16),
    /// LLCP procedure response timer, keyed by ACL connection handle.
    LlcpResponse(u16),
}

/// PHY options applied to a transmit channel configuration. S2 and S8
/// select the LE Coded scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhyOptions {
    Default,
    S2,
    S8,
}

/// Internal messages exchanged between dispatch handlers. The variant
/// selects the destination handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    /// Host disconnect request deferred to the connection-level
    /// dispatcher, which drives the LLCP termination handshake.
    ApiDisconnect { acl_handle: u16, cis_handle: u16, reason: hci::ErrorCode },
    /// CIS termination procedure completed; close the stream.
    CisClosed { cis_handle: u16 },
}

/// Link layer callbacks: every service this subsystem consumes from the
/// surrounding controller. Implementations use interior mutability where
/// they keep state.
pub trait ControllerOps {
    /// Queue a serialized control PDU for transmission on an ACL
    /// connection.
    fn send_llcp_packet(&self, acl_handle: u16, pdu: &[u8]);

    /// Forward an event record to the host event sink.
    fn send_hci_event(&self, event: hci::Event);

    /// Post an internal message to the dispatch loop.
    fn send_message(&self, msg: Message);

    fn start_or_restart_timer(&self, timer: TimerId, duration_ms: u32);

    fn stop_timer(&self, timer: TimerId);

    /// Remove a CIG's scheduling block from the baseband scheduler.
    fn deschedule_bod(&self, bod: BodHandle);

    /// Query the managed transmit power for a PHY/options pair on an ACL
    /// connection. `None` means the power is not yet managed.
    fn get_managed_tx_power(
        &self,
        acl_handle: u16,
        phy: hci::PhyType,
        options: PhyOptions,
    ) -> Option<i8>;

    fn set_managed_tx_power(
        &self,
        acl_handle: u16,
        phy: hci::PhyType,
        options: PhyOptions,
        level: i8,
    );

    /// Stop the vendor codec instance bound to a CIS output data path.
    fn codec_stop(&self, cis_handle: u16);
}

impl<O: ControllerOps + ?Sized> ControllerOps for &O {
    fn send_llcp_packet(&self, acl_handle: u16, pdu: &[u8]) {
        (**self).send_llcp_packet(acl_handle, pdu)
    }

    fn send_hci_event(&self, event: hci::Event) {
        (**self).send_hci_event(event)
    }

    fn send_message(&self, msg: Message) {
        (**self).send_message(msg)
    }

    fn start_or_restart_timer(&self, timer: TimerId, duration_ms: u32) {
        (**self).start_or_restart_timer(timer, duration_ms)
    }

    fn stop_timer(&self, timer: TimerId) {
        (**self).stop_timer(timer)
    }

    fn deschedule_bod(&self, bod: BodHandle) {
        (**self).deschedule_bod(bod)
    }

    fn get_managed_tx_power(
        &self,
        acl_handle: u16,
        phy: hci::PhyType,
        options: PhyOptions,
    ) -> Option<i8> {
        (**self).get_managed_tx_power(acl_handle, phy, options)
    }

    fn set_managed_tx_power(
        &self,
        acl_handle: u16,
        phy: hci::PhyType,
        options: PhyOptions,
        level: i8,
    ) {
        (**self).set_managed_tx_power(acl_handle, phy, options, level)
    }

    fn codec_stop(&self, cis_handle: u16) {
        (**self).codec_stop(cis_handle)
    }
}
