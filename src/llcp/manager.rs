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

use log::warn;
use thiserror::Error;

use crate::llcp::iso::{
    AclParameters, CigContext, CigParameters, CisContext, CisParameters, CisState, Config,
    IsoDataPathId, IsoManager,
};
use crate::ops::{ControllerOps, Message};
use crate::packets::{hci, llcp};

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum LinkLayerError {
    #[error("Unknown ACL connection")]
    UnknownAclConnection,
    #[error("Unknown CIG")]
    UnknownCig,
    #[error("Unknown CIS handle")]
    UnknownCisHandle,
    #[error("CIG already exists")]
    CigAlreadyExists,
    #[error("CIS already exists")]
    CisAlreadyExists,
    #[error("Resource limit reached")]
    LimitReached,
    #[error("Invalid CIG parameters")]
    InvalidParameters,
    #[error("Invalid LLCP packet")]
    InvalidLlcpPacket(#[from] llcp::DecodeError),
}

/// Events consumed by the CIS main state machine, one per incoming
/// message of the dispatch loop. The dispatcher pairs each event with its
/// reason setter before running the generic action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CisEvent {
    /// A CIS request PDU was queued for transmission and is outstanding.
    RequestSent,
    /// The stream achieved sync at the baseband.
    Established,
    /// The stream failed to establish within the supervision window.
    FailedToEstablish,
    /// The LLCP procedure response timer fired.
    ResponseTimeout,
    /// The CIS supervision timer fired.
    SupervisionTimeout,
    /// A received payload failed its message integrity check.
    MicFailure,
    /// A local resource needed to maintain the stream was exhausted.
    LocalResourceLimit,
    /// The host requested a disconnect with the given reason.
    HostDisconnect { reason: hci::ErrorCode },
    /// The termination procedure completed; the stream is closed.
    Closed,
}

/// Events consumed by the CIS termination procedure nested in an ACL
/// connection's LLCP state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlcpCisEvent {
    /// Host disconnect request forwarded by the connection dispatcher.
    HostDisconnect,
    /// LL_CIS_TERMINATE_IND received from the peer.
    TerminateReceived(llcp::CisTerminateInd),
    /// The peer acknowledged the termination.
    TerminateConfirmed,
    /// Internally requested disconnect.
    IntHostDisconnect,
    /// Internally signalled peer disconnect.
    IntPeerDisconnect,
}

/// Link layer facade over the ISO manager: routes received control PDUs,
/// internal messages and timer/baseband events into the state machine
/// actions.
pub struct LinkLayer<O: ControllerOps> {
    iso: IsoManager<O>,
}

impl<O: ControllerOps> LinkLayer<O> {
    pub fn new(ops: O, config: Config) -> LinkLayer<O> {
        LinkLayer { iso: IsoManager::new(ops, config) }
    }

    pub fn add_acl_connection(&mut self, params: AclParameters) {
        self.iso.add_acl_connection(params);
    }

    pub fn remove_acl_connection(&mut self, acl_handle: u16) {
        self.iso.remove_acl_connection(acl_handle);
    }

    pub fn on_peer_power_control_request(&mut self, acl_handle: u16) {
        self.iso.on_peer_power_control_request(acl_handle);
    }

    pub fn create_cig(&mut self, params: CigParameters) -> Result<(), LinkLayerError> {
        self.iso.create_cig(params)
    }

    pub fn create_cis(&mut self, params: CisParameters) -> Result<u16, LinkLayerError> {
        self.iso.create_cis(params)
    }

    pub fn set_iso_data_path_out(&mut self, cis_handle: u16, id: IsoDataPathId) {
        self.iso.set_iso_data_path_out(cis_handle, id);
    }

    pub fn get_cis(&self, cis_handle: u16) -> Option<&CisContext> {
        self.iso.get_cis(cis_handle)
    }

    pub fn get_cig(&self, cig_id: u8) -> Option<&CigContext> {
        self.iso.get_cig(cig_id)
    }

    pub fn get_cis_connection_handle<F>(&self, predicate: F) -> Option<u16>
    where
        F: Fn(&CisContext) -> bool,
    {
        self.iso.get_cis_connection_handle(predicate)
    }

    /// Scheduling block boundary callback; see
    /// [`IsoManager::on_cig_boundary`].
    pub fn on_cig_boundary(&mut self, cig_id: u8) -> Vec<u16> {
        self.iso.on_cig_boundary(cig_id)
    }

    /// Drive the CIS main state machine with one event. Events that have
    /// no transition from the current state are logged and ignored.
    pub fn dispatch_cis_event(
        &mut self,
        cis_handle: u16,
        event: CisEvent,
    ) -> Result<(), LinkLayerError> {
        let (state, cig_id) = {
            let cis = self.iso.get_cis(cis_handle).ok_or(LinkLayerError::UnknownCisHandle)?;
            (cis.state, cis.cig_id)
        };

        match (state, event) {
            (CisState::Idle, CisEvent::RequestSent) => {
                if let Some(cis) = self.iso.cis_mut(cis_handle) {
                    cis.state = CisState::Requesting;
                    cis.cis_req_pend = true;
                }
            }
            (CisState::Requesting, CisEvent::Established) => {
                let cig_sync_delay_usec =
                    self.iso.get_cig(cig_id).map(|cig| cig.cig_sync_delay_usec).unwrap_or(0);
                if let Some(cis) = self.iso.cis_mut(cis_handle) {
                    cis.state = CisState::Established;
                    cis.cis_req_pend = false;
                }
                self.iso.act_cis_est(cis_handle);
                self.iso.notify_host_cis_est(
                    cis_handle,
                    hci::ErrorCode::Success,
                    cig_sync_delay_usec,
                );
            }
            (CisState::Requesting, CisEvent::ResponseTimeout) => {
                self.iso.store_llcp_timeout_terminate_reason(cis_handle);
                self.iso.act_cis_est_fail(cis_handle);
            }
            (CisState::Requesting, CisEvent::FailedToEstablish) => {
                self.iso.store_conn_fail_establish_terminate_reason(cis_handle);
                self.iso.act_cis_est_fail(cis_handle);
            }
            (CisState::Established, CisEvent::SupervisionTimeout) => {
                self.iso.store_conn_timeout_terminate_reason(cis_handle);
                self.iso.act_fail(cis_handle);
            }
            (CisState::Established, CisEvent::ResponseTimeout) => {
                self.iso.store_llcp_timeout_terminate_reason(cis_handle);
                self.iso.act_fail(cis_handle);
            }
            (CisState::Established, CisEvent::MicFailure) => {
                self.iso.store_mic_failed_terminate_reason(cis_handle);
                self.iso.act_fail(cis_handle);
            }
            (CisState::Established, CisEvent::LocalResourceLimit) => {
                self.iso.store_local_low_resource_terminate_reason(cis_handle);
                self.iso.act_fail(cis_handle);
            }
            (CisState::Established, CisEvent::HostDisconnect { reason }) => {
                self.iso.store_disconnect_reason(cis_handle, reason);
                self.iso.act_disc(cis_handle);
            }
            (CisState::Requesting, CisEvent::Closed)
            | (CisState::Established, CisEvent::Closed) => {
                self.iso.act_closed(cis_handle);
            }
            (state, event) => {
                warn!("skipping CIS event {:?} in state {:?}", event, state);
            }
        }
        Ok(())
    }

    /// Drive the CIS termination procedure of an ACL connection with one
    /// event.
    pub fn dispatch_llcp_cis_event(
        &mut self,
        acl_handle: u16,
        cis_handle: u16,
        event: LlcpCisEvent,
    ) -> Result<(), LinkLayerError> {
        if self.iso.get_cis(cis_handle).is_none() {
            return Err(LinkLayerError::UnknownCisHandle);
        }
        if self.iso.get_conn(acl_handle).is_none() {
            return Err(LinkLayerError::UnknownAclConnection);
        }

        match event {
            LlcpCisEvent::HostDisconnect => self.iso.llcp_act_host_disc(acl_handle, cis_handle),
            LlcpCisEvent::TerminateReceived(pdu) => {
                self.iso.llcp_act_peer_disc(acl_handle, cis_handle, &pdu)
            }
            LlcpCisEvent::TerminateConfirmed => self.iso.llcp_act_cis_term(acl_handle, cis_handle),
            LlcpCisEvent::IntHostDisconnect => {
                self.iso.llcp_act_int_host_disc(acl_handle, cis_handle)
            }
            LlcpCisEvent::IntPeerDisconnect => {
                self.iso.llcp_act_int_peer_disc(acl_handle, cis_handle)
            }
        }
        Ok(())
    }

    /// Route an internal message back into the state machines.
    pub fn ingest_message(&mut self, msg: Message) -> Result<(), LinkLayerError> {
        match msg {
            Message::ApiDisconnect { acl_handle, cis_handle, .. } => {
                self.dispatch_llcp_cis_event(acl_handle, cis_handle, LlcpCisEvent::HostDisconnect)
            }
            Message::CisClosed { cis_handle } => {
                self.dispatch_cis_event(cis_handle, CisEvent::Closed)
            }
        }
    }

    /// Decode and route a control PDU received on an ACL connection.
    pub fn ingest_llcp(&mut self, acl_handle: u16, pdu: &[u8]) -> Result<(), LinkLayerError> {
        match llcp::LlcpPacket::decode(pdu)? {
            llcp::LlcpPacket::CisTerminateInd(pdu) => {
                let cis_handle = self.iso.get_cis_connection_handle(|cis| {
                    cis.acl_handle == acl_handle
                        && cis.cig_id == pdu.cig_id
                        && cis.cis_id == pdu.cis_id
                });
                match cis_handle {
                    Some(cis_handle) => self.dispatch_llcp_cis_event(
                        acl_handle,
                        cis_handle,
                        LlcpCisEvent::TerminateReceived(pdu),
                    ),
                    None => {
                        warn!("skipping out of place packet LL_CIS_TERMINATE_IND");
                        Ok(())
                    }
                }
            }
            llcp::LlcpPacket::RejectExtInd(pdu) => {
                if pdu.reject_opcode != llcp::Opcode::LlCisReq as u8 {
                    return Ok(());
                }
                let cis_handle = self.iso.get_cis_connection_handle(|cis| {
                    cis.acl_handle == acl_handle
                        && cis.role == hci::Role::Central
                        && cis.state == CisState::Requesting
                });
                match cis_handle {
                    Some(cis_handle) => {
                        self.iso.store_llcp_peer_rej_terminate_reason(cis_handle, &pdu);
                        self.iso.act_cis_est_fail(cis_handle);
                        Ok(())
                    }
                    None => {
                        warn!("skipping out of place packet LL_REJECT_EXT_IND");
                        Ok(())
                    }
                }
            }
        }
    }
}
