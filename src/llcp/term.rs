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

//! CIS termination procedure, nested in the ACL connection's LLCP state
//! machine. The procedure exchanges LL_CIS_TERMINATE_IND and hands the
//! stream back to the CIS state machine through an internal message once
//! the teardown is acknowledged.

use log::warn;

use crate::llcp::iso::{IsoManager, LLCP_RESP_TIMEOUT_MS};
use crate::ops::{ControllerOps, Message, TimerId};
use crate::packets::llcp;

impl<O: ControllerOps> IsoManager<O> {
    /// Host initiated disconnect of a CIS on this connection: send
    /// LL_CIS_TERMINATE_IND with the stored reason and arm the procedure
    /// response timer.
    pub fn llcp_act_host_disc(&mut self, acl_handle: u16, cis_handle: u16) {
        self.send_cis_terminate_ind(acl_handle, cis_handle);
    }

    /// Internally requested disconnect. Same wire behavior as the host
    /// initiated variant; reached from a different event in the
    /// connection state machine.
    pub fn llcp_act_int_host_disc(&mut self, acl_handle: u16, cis_handle: u16) {
        self.send_cis_terminate_ind(acl_handle, cis_handle);
    }

    /// Peer initiated disconnect: record the reason carried by the
    /// received LL_CIS_TERMINATE_IND and require a termination
    /// acknowledgment before the connection's own teardown can complete.
    pub fn llcp_act_peer_disc(
        &mut self,
        acl_handle: u16,
        cis_handle: u16,
        pdu: &llcp::CisTerminateInd,
    ) {
        self.store_terminate_reason(cis_handle, pdu);
        self.require_term_ack(acl_handle);
    }

    /// Internally signalled peer disconnect. The termination PDU was
    /// already sent by the peer side of this path; only the
    /// acknowledgment requirement is recorded.
    pub fn llcp_act_int_peer_disc(&mut self, acl_handle: u16, _cis_handle: u16) {
        self.require_term_ack(acl_handle);
    }

    /// Termination confirmed: stop the procedure response timer and close
    /// the stream through the CIS state machine, decoupled by message
    /// passing.
    pub fn llcp_act_cis_term(&mut self, acl_handle: u16, cis_handle: u16) {
        self.ops.stop_timer(TimerId::LlcpResponse(acl_handle));
        self.ops.send_message(Message::CisClosed { cis_handle });
    }

    fn send_cis_terminate_ind(&mut self, acl_handle: u16, cis_handle: u16) {
        let Some(cis) = self.cis_connections.get(&cis_handle) else {
            warn!("no CIS connection with handle 0x{:x}", cis_handle);
            return;
        };
        let pdu = llcp::CisTerminateInd {
            cig_id: cis.cig_id,
            cis_id: cis.cis_id,
            error_code: cis.reason,
        };
        self.ops.send_llcp_packet(acl_handle, &pdu.encode_to_vec());
        self.ops.start_or_restart_timer(TimerId::LlcpResponse(acl_handle), LLCP_RESP_TIMEOUT_MS);
    }

    fn require_term_ack(&mut self, acl_handle: u16) {
        match self.acl_connections.get_mut(&acl_handle) {
            Some(conn) => conn.cis_term_ack_reqd = true,
            None => warn!("no ACL connection with handle 0x{:x}", acl_handle),
        }
    }
}
