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

use std::collections::HashMap;

use log::warn;

use crate::llcp::manager::LinkLayerError;
use crate::ops::{BodHandle, ControllerOps, Message, PhyOptions, TimerId};
use crate::packets::{hci, llcp};

// Description of CIS configuration parameters:
//
// - ISO_Interval (multiple of 1.25ms)
//      ISO_Interval is the time between the CIS anchor points of adjacent CIS
//      events. ISO_Interval is equal for all CISes in a CIG.
// - NSE
//      NSE is the maximum number of subevents in each CIS event.
// - BN (Burst Number)
//      BN is the number of payloads expected in each CIS event.
// - FT (Flush Timeout)
//      The Flush Timeout (FT) parameter is the maximum number of CIS events
//      that may be used to transmit (and retransmit) a given payload
// - Framed
//      Framed indicates whether the CIS carries framed or unframed data; the
//      value shall be the same in both directions.
//
// The CIG synchronization point is approximated as the next event anchor,
// so CIG_Sync_Delay = CIS_Sync_Delay = ISO_Interval.

#[allow(non_camel_case_types)]
pub type microseconds = u32;

#[allow(non_camel_case_types)]
pub type slots = u16;

/// LLCP procedure response timeout, 40 seconds.
pub const LLCP_RESP_TIMEOUT_MS: u32 = 40_000;

/// Output data path bound to a CIS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsoDataPathId {
    Disabled,
    Hci,
    Vendor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CisState {
    Idle,
    Requesting,
    Established,
    Closing,
}

/// Outcome of the closed action. A stream whose establishment failed in
/// the same interval has no scheduling block to wait for and is released
/// within the action; every other teardown is deferred to the CIG
/// scheduling boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    DeferredClose,
    ImmediateRelease,
}

/// Registry limits and defaults.
#[derive(Clone, Debug)]
pub struct Config {
    pub max_cig: usize,
    pub max_cis: usize,
    /// Default transmit power level in dBm, applied when a PHY's power
    /// becomes managed.
    pub def_tx_power: i8,
}

impl Default for Config {
    fn default() -> Config {
        Config { max_cig: 4, max_cis: 8, def_tx_power: 0 }
    }
}

/// CIG creation parameters. SDU intervals and maximum transport latencies
/// are provided in microseconds.
#[derive(Clone, Debug)]
pub struct CigParameters {
    pub cig_id: u8,
    pub bod: BodHandle,
    pub sdu_interval_c_to_p: microseconds,
    pub sdu_interval_p_to_c: microseconds,
    pub max_transport_latency_c_to_p: microseconds,
    pub max_transport_latency_p_to_c: microseconds,
    pub ft_c_to_p: u8,
    pub ft_p_to_c: u8,
    pub framed: bool,
}

/// CIS creation parameters.
#[derive(Clone, Debug)]
pub struct CisParameters {
    pub cig_id: u8,
    pub cis_id: u8,
    pub acl_handle: u16,
    pub phy_c_to_p: hci::PhyType,
    pub phy_p_to_c: hci::PhyType,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
}

/// CIG context, one per Connected Isochronous Group. Lives from the first
/// member CIS creation until the last member CIS is released.
pub struct CigContext {
    pub cig_id: u8,
    pub bod: BodHandle,
    /// Member CIS streams currently established. Incremented by the
    /// establishment action, decremented only by the scheduling-boundary
    /// cleanup.
    pub num_cis_ested: u8,
    pub cig_sync_delay_usec: microseconds,
    pub iso_interval: slots,
    pub(super) sdu_interval_c_to_p: microseconds,
    pub(super) sdu_interval_p_to_c: microseconds,
    pub(super) ft_c_to_p: u8,
    pub(super) ft_p_to_c: u8,
    pub(super) framed: bool,
}

/// CIS context, one per established-or-establishing stream.
pub struct CisContext {
    pub cis_handle: u16,
    pub acl_handle: u16,
    pub cig_id: u8,
    pub cis_id: u8,
    pub role: hci::Role,
    pub state: CisState,
    /// Termination reason recorded for the current teardown episode.
    /// Meaningful only once a reason setter has run.
    pub reason: hci::ErrorCode,
    /// True while a CIS request PDU is outstanding and unanswered.
    pub cis_req_pend: bool,
    /// Latched when the context becomes eligible for cleanup at the next
    /// scheduling boundary.
    pub is_closing: bool,
    /// Set when a transmit power change indication must be queued for the
    /// peer.
    pub power_ind_req: bool,
    /// Transmit power of the CIS channel configuration. `None` while the
    /// power is unmanaged.
    pub tx_power: Option<i8>,
    pub iso_data_path_out: IsoDataPathId,
    // Parameters reported in the LE CIS Established event.
    pub phy_c_to_p: hci::PhyType,
    pub phy_p_to_c: hci::PhyType,
    pub cis_sync_delay_usec: microseconds,
    pub transport_latency_c_to_p: microseconds,
    pub transport_latency_p_to_c: microseconds,
    pub nse: u8,
    pub bn_c_to_p: u8,
    pub bn_p_to_c: u8,
    pub ft_c_to_p: u8,
    pub ft_p_to_c: u8,
    pub iso_interval: slots,
}

/// Per ACL connection state read and written by the CIS procedures.
pub struct ConnContext {
    pub acl_handle: u16,
    pub role: hci::Role,
    /// PHY options of the connection's initial transmit channel
    /// configuration.
    pub init_tx_phy_options: PhyOptions,
    /// Negotiated LL feature mask.
    pub used_features: u64,
    /// The peer has sent a power control request on this connection.
    pub peer_power_req_recvd: bool,
    /// The connection teardown must wait for a CIS termination
    /// acknowledgment.
    pub cis_term_ack_reqd: bool,
}

/// ACL connection registration parameters.
#[derive(Clone, Debug)]
pub struct AclParameters {
    pub acl_handle: u16,
    pub role: hci::Role,
    pub init_tx_phy_options: PhyOptions,
    pub used_features: u64,
}

/// ISO manager state: CIS/CIG/ACL registries and the CIS state machine.
pub struct IsoManager<O: ControllerOps> {
    pub(super) ops: O,
    pub(super) config: Config,
    pub(super) cig_contexts: HashMap<u8, CigContext>,
    pub(super) cis_connections: HashMap<u16, CisContext>,
    pub(super) acl_connections: HashMap<u16, ConnContext>,
}

impl<O: ControllerOps> IsoManager<O> {
    pub fn new(ops: O, config: Config) -> IsoManager<O> {
        IsoManager {
            ops,
            config,
            cig_contexts: Default::default(),
            cis_connections: Default::default(),
            acl_connections: Default::default(),
        }
    }

    pub fn add_acl_connection(&mut self, params: AclParameters) {
        self.acl_connections.insert(
            params.acl_handle,
            ConnContext {
                acl_handle: params.acl_handle,
                role: params.role,
                init_tx_phy_options: params.init_tx_phy_options,
                used_features: params.used_features,
                peer_power_req_recvd: false,
                cis_term_ack_reqd: false,
            },
        );
    }

    pub fn remove_acl_connection(&mut self, acl_handle: u16) {
        self.acl_connections.remove(&acl_handle);
    }

    /// Records that the peer opened the power control procedure on this
    /// connection; establishment then initializes unmanaged PHY powers.
    pub fn on_peer_power_control_request(&mut self, acl_handle: u16) {
        if let Some(conn) = self.acl_connections.get_mut(&acl_handle) {
            conn.peer_power_req_recvd = true;
        }
    }

    pub fn get_conn(&self, acl_handle: u16) -> Option<&ConnContext> {
        self.acl_connections.get(&acl_handle)
    }

    pub fn get_cig(&self, cig_id: u8) -> Option<&CigContext> {
        self.cig_contexts.get(&cig_id)
    }

    pub fn get_cis(&self, cis_handle: u16) -> Option<&CisContext> {
        self.cis_connections.get(&cis_handle)
    }

    pub(super) fn cis_mut(&mut self, cis_handle: u16) -> Option<&mut CisContext> {
        self.cis_connections.get_mut(&cis_handle)
    }

    pub fn get_cis_connection_handle<F>(&self, predicate: F) -> Option<u16>
    where
        F: Fn(&CisContext) -> bool,
    {
        self.cis_connections
            .iter()
            .filter(|(_, cis)| predicate(cis))
            .map(|(handle, _)| handle)
            .next()
            .cloned()
    }

    // Returns the first unused handle in the range 0xe00..0xefe.
    fn new_cis_connection_handle(&self) -> Option<u16> {
        (0xe00..0xefe).find(|handle| !self.cis_connections.contains_key(handle))
    }

    /// Register a CIG, deriving its ISO interval and synchronization
    /// delay from the group parameters.
    pub fn create_cig(&mut self, params: CigParameters) -> Result<(), LinkLayerError> {
        if self.cig_contexts.contains_key(&params.cig_id) {
            return Err(LinkLayerError::CigAlreadyExists);
        }
        if self.cig_contexts.len() >= self.config.max_cig {
            return Err(LinkLayerError::LimitReached);
        }
        let iso_interval = iso_interval(
            params.sdu_interval_c_to_p,
            params.sdu_interval_p_to_c,
            params.framed,
            params.max_transport_latency_c_to_p,
            params.max_transport_latency_p_to_c,
        )
        .ok_or(LinkLayerError::InvalidParameters)?;

        self.cig_contexts.insert(
            params.cig_id,
            CigContext {
                cig_id: params.cig_id,
                bod: params.bod,
                num_cis_ested: 0,
                cig_sync_delay_usec: iso_interval as u32 * 1250,
                iso_interval,
                sdu_interval_c_to_p: params.sdu_interval_c_to_p,
                sdu_interval_p_to_c: params.sdu_interval_p_to_c,
                ft_c_to_p: params.ft_c_to_p,
                ft_p_to_c: params.ft_p_to_c,
                framed: params.framed,
            },
        );
        Ok(())
    }

    /// Register a CIS under an existing CIG, deriving its burst and
    /// latency parameters. The context starts in the `Idle` state; the
    /// establishment signaling is driven by the dispatcher.
    pub fn create_cis(&mut self, params: CisParameters) -> Result<u16, LinkLayerError> {
        let cig = self.cig_contexts.get(&params.cig_id).ok_or(LinkLayerError::UnknownCig)?;
        let conn = self
            .acl_connections
            .get(&params.acl_handle)
            .ok_or(LinkLayerError::UnknownAclConnection)?;
        if self
            .cis_connections
            .values()
            .any(|cis| cis.cig_id == params.cig_id && cis.cis_id == params.cis_id)
        {
            return Err(LinkLayerError::CisAlreadyExists);
        }
        if self.cis_connections.len() >= self.config.max_cis {
            return Err(LinkLayerError::LimitReached);
        }
        let cis_handle = self.new_cis_connection_handle().ok_or(LinkLayerError::LimitReached)?;

        let bn_c_to_p = ((params.max_sdu_c_to_p + 250) / 251) as u8;
        let bn_p_to_c = ((params.max_sdu_p_to_c + 250) / 251) as u8;
        let nse = std::cmp::max(bn_c_to_p, bn_p_to_c);

        let cis = CisContext {
            cis_handle,
            acl_handle: params.acl_handle,
            cig_id: params.cig_id,
            cis_id: params.cis_id,
            role: conn.role,
            state: CisState::Idle,
            reason: hci::ErrorCode::Success,
            cis_req_pend: false,
            is_closing: false,
            power_ind_req: false,
            tx_power: None,
            iso_data_path_out: IsoDataPathId::Disabled,
            phy_c_to_p: params.phy_c_to_p,
            phy_p_to_c: params.phy_p_to_c,
            cis_sync_delay_usec: cig.cig_sync_delay_usec,
            transport_latency_c_to_p: transport_latency(
                cig.cig_sync_delay_usec,
                cig.iso_interval,
                cig.ft_c_to_p,
                cig.sdu_interval_c_to_p,
                cig.framed,
            ),
            transport_latency_p_to_c: transport_latency(
                cig.cig_sync_delay_usec,
                cig.iso_interval,
                cig.ft_p_to_c,
                cig.sdu_interval_p_to_c,
                cig.framed,
            ),
            nse,
            bn_c_to_p,
            bn_p_to_c,
            ft_c_to_p: cig.ft_c_to_p,
            ft_p_to_c: cig.ft_p_to_c,
            iso_interval: cig.iso_interval,
        };
        self.cis_connections.insert(cis_handle, cis);
        Ok(cis_handle)
    }

    pub fn set_iso_data_path_out(&mut self, cis_handle: u16, id: IsoDataPathId) {
        match self.cis_connections.get_mut(&cis_handle) {
            Some(cis) => cis.iso_data_path_out = id,
            None => warn!("no CIS connection with handle 0x{:x}", cis_handle),
        }
    }

    //
    // Termination reason recorder. One setter per trigger source; each is
    // a pure write consumed by whichever generic action fires next.
    //

    fn store_reason(&mut self, cis_handle: u16, reason: hci::ErrorCode) {
        match self.cis_connections.get_mut(&cis_handle) {
            Some(cis) => cis.reason = reason,
            None => warn!("no CIS connection with handle 0x{:x}", cis_handle),
        }
    }

    /// Record the reason carried by a received LL_CIS_TERMINATE_IND.
    pub fn store_terminate_reason(&mut self, cis_handle: u16, pdu: &llcp::CisTerminateInd) {
        self.store_reason(cis_handle, pdu.error_code);
    }

    /// Record the reason carried by a pending host disconnect request.
    pub fn store_disconnect_reason(&mut self, cis_handle: u16, reason: hci::ErrorCode) {
        self.store_reason(cis_handle, reason);
    }

    pub fn store_conn_fail_establish_terminate_reason(&mut self, cis_handle: u16) {
        self.store_reason(cis_handle, hci::ErrorCode::ConnectionFailedToBeEstablished);
    }

    pub fn store_conn_timeout_terminate_reason(&mut self, cis_handle: u16) {
        self.store_reason(cis_handle, hci::ErrorCode::ConnectionTimeout);
    }

    pub fn store_llcp_timeout_terminate_reason(&mut self, cis_handle: u16) {
        self.store_reason(cis_handle, hci::ErrorCode::LmpLlResponseTimeout);
    }

    pub fn store_local_low_resource_terminate_reason(&mut self, cis_handle: u16) {
        self.store_reason(cis_handle, hci::ErrorCode::MemoryCapacityExceeded);
    }

    /// Record the reason carried by a received LL_REJECT_EXT_IND.
    pub fn store_llcp_peer_rej_terminate_reason(&mut self, cis_handle: u16, pdu: &llcp::RejectExtInd) {
        self.store_reason(cis_handle, pdu.error_code);
    }

    pub fn store_mic_failed_terminate_reason(&mut self, cis_handle: u16) {
        self.store_reason(cis_handle, hci::ErrorCode::ConnectionTerminatedMicFailure);
    }

    //
    // CIS main state machine actions.
    //

    /// Establishment success. Counts the stream against its CIG and
    /// resolves the transmit power of the CIS channel configuration;
    /// always completes and leaves the CIS eligible to move data.
    pub fn act_cis_est(&mut self, cis_handle: u16) {
        let (acl_handle, cig_id, tx_phy) = match self.cis_connections.get(&cis_handle) {
            Some(cis) => (
                cis.acl_handle,
                cis.cig_id,
                match cis.role {
                    hci::Role::Central => cis.phy_c_to_p,
                    hci::Role::Peripheral => cis.phy_p_to_c,
                },
            ),
            None => {
                warn!("no CIS connection with handle 0x{:x}", cis_handle);
                return;
            }
        };

        match self.cig_contexts.get_mut(&cig_id) {
            Some(cig) => cig.num_cis_ested += 1,
            None => {
                warn!("CIS connection 0x{:x} established under unknown CIG {}", cis_handle, cig_id);
                return;
            }
        }

        let Some(conn) = self.acl_connections.get(&acl_handle) else {
            warn!("CIS connection 0x{:x} established on unknown ACL {}", cis_handle, acl_handle);
            return;
        };

        let options = conn.init_tx_phy_options;
        match self.ops.get_managed_tx_power(acl_handle, tx_phy, options) {
            None if conn.peer_power_req_recvd => {
                // The peer already opened the power control procedure;
                // bring the PHY under management at the default level.
                self.ops.set_managed_tx_power(acl_handle, tx_phy, options, self.config.def_tx_power);
                if tx_phy == hci::PhyType::LeCoded {
                    self.ops.set_managed_tx_power(
                        acl_handle,
                        hci::PhyType::LeCoded,
                        PhyOptions::S2,
                        self.config.def_tx_power,
                    );
                }
                if (conn.used_features & hci::LLFeaturesBits::LePowerChangeIndication as u64) != 0 {
                    if let Some(cis) = self.cis_connections.get_mut(&cis_handle) {
                        cis.power_ind_req = true;
                    }
                }
            }
            tx_power => {
                if let Some(cis) = self.cis_connections.get_mut(&cis_handle) {
                    cis.tx_power = tx_power;
                }
            }
        }
    }

    /// Establishment failure. A response timeout on a still pending CIS
    /// request means the peer never answered LL_CIS_REQ and is reported
    /// as an unsupported feature rather than as the raw timeout; the
    /// stored reason itself is not rewritten.
    pub fn act_cis_est_fail(&mut self, cis_handle: u16) {
        let status = match self.cis_connections.get_mut(&cis_handle) {
            Some(cis) => {
                if cis.cis_req_pend && cis.reason == hci::ErrorCode::LmpLlResponseTimeout {
                    cis.cis_req_pend = false;
                    hci::ErrorCode::UnsupportedFeatureOrParameterValue
                } else {
                    cis.reason
                }
            }
            None => {
                warn!("no CIS connection with handle 0x{:x}", cis_handle);
                return;
            }
        };
        // The group never achieved sync; CIG_Sync_Delay is reported as 0.
        self.notify_host_cis_est(cis_handle, status, 0);
        self.release_cis(cis_handle);
    }

    /// Host initiated disconnect. Defers the termination handshake to the
    /// connection-level LLCP dispatcher via an internal message.
    pub fn act_disc(&mut self, cis_handle: u16) {
        let Some(cis) = self.cis_connections.get(&cis_handle) else {
            warn!("no CIS connection with handle 0x{:x}", cis_handle);
            return;
        };
        self.ops.send_message(Message::ApiDisconnect {
            acl_handle: cis.acl_handle,
            cis_handle,
            reason: cis.reason,
        });
    }

    /// Stream closed. Tears down the data path and supervision timer and
    /// defers the context release to the CIG scheduling boundary, except
    /// when the stream failed to establish within the same interval, in
    /// which case there is no scheduling block to wait for and the
    /// context is released immediately.
    pub fn act_closed(&mut self, cis_handle: u16) -> Option<CloseOutcome> {
        let fast_fail = {
            let cis = match self.cis_connections.get_mut(&cis_handle) {
                Some(cis) => cis,
                None => {
                    warn!("no CIS connection with handle 0x{:x}", cis_handle);
                    return None;
                }
            };
            if cis.iso_data_path_out == IsoDataPathId::Vendor {
                self.ops.codec_stop(cis_handle);
            }
            self.ops.stop_timer(TimerId::CisSupervision(cis_handle));
            cis.is_closing = true;
            if cis.reason == hci::ErrorCode::ConnectionFailedToBeEstablished {
                cis.is_closing = false;
                true
            } else {
                cis.state = CisState::Closing;
                false
            }
        };

        if fast_fail {
            let status = hci::ErrorCode::ConnectionFailedToBeEstablished;
            self.notify_host_cis_est(cis_handle, status, 0);
            self.release_cis(cis_handle);
            Some(CloseOutcome::ImmediateRelease)
        } else {
            self.notify_host_cis_term(cis_handle);
            Some(CloseOutcome::DeferredClose)
        }
    }

    /// Connection maintenance failure on an established stream. Failure
    /// signals arriving in any other state are ignored here.
    pub fn act_fail(&mut self, cis_handle: u16) {
        let cig_id = {
            let cis = match self.cis_connections.get_mut(&cis_handle) {
                Some(cis) => cis,
                None => {
                    warn!("no CIS connection with handle 0x{:x}", cis_handle);
                    return;
                }
            };
            if cis.state != CisState::Established {
                return;
            }
            cis.is_closing = true;
            cis.state = CisState::Closing;
            cis.cig_id
        };
        if let Some(cig) = self.cig_contexts.get(&cig_id) {
            self.ops.deschedule_bod(cig.bod);
        }
        self.notify_host_cis_term(cis_handle);
    }

    //
    // Host notification emitters.
    //

    /// Forward the LE CIS Established event. The timing parameters are
    /// populated from the context on success and zeroed on failure.
    pub fn notify_host_cis_est(
        &self,
        cis_handle: u16,
        status: hci::ErrorCode,
        cig_sync_delay_usec: microseconds,
    ) {
        let event = match self.cis_connections.get(&cis_handle) {
            Some(cis) if status == hci::ErrorCode::Success => hci::LeCisEstablished {
                status,
                cis_handle,
                cig_sync_delay: cig_sync_delay_usec,
                cis_sync_delay: cis.cis_sync_delay_usec,
                transport_latency_c_to_p: cis.transport_latency_c_to_p,
                transport_latency_p_to_c: cis.transport_latency_p_to_c,
                phy_c_to_p: cis.phy_c_to_p,
                phy_p_to_c: cis.phy_p_to_c,
                nse: cis.nse,
                bn_c_to_p: cis.bn_c_to_p,
                bn_p_to_c: cis.bn_p_to_c,
                ft_c_to_p: cis.ft_c_to_p,
                ft_p_to_c: cis.ft_p_to_c,
                iso_interval: cis.iso_interval,
            },
            _ => hci::LeCisEstablished {
                status,
                cis_handle,
                cig_sync_delay: cig_sync_delay_usec,
                cis_sync_delay: 0,
                transport_latency_c_to_p: 0,
                transport_latency_p_to_c: 0,
                phy_c_to_p: hci::PhyType::NoPackets,
                phy_p_to_c: hci::PhyType::NoPackets,
                nse: 0,
                bn_c_to_p: 0,
                bn_p_to_c: 0,
                ft_c_to_p: 0,
                ft_p_to_c: 0,
                iso_interval: 0,
            },
        };
        self.ops.send_hci_event(event.into());
    }

    /// Forward the Disconnection Complete event with the stored reason.
    pub fn notify_host_cis_term(&self, cis_handle: u16) {
        let Some(cis) = self.cis_connections.get(&cis_handle) else {
            warn!("no CIS connection with handle 0x{:x}", cis_handle);
            return;
        };
        self.ops.send_hci_event(
            hci::DisconnectionComplete {
                status: hci::ErrorCode::Success,
                cis_handle,
                reason: cis.reason,
            }
            .into(),
        );
    }

    //
    // Cleanup.
    //

    /// Scheduling block boundary callback for a CIG. Releases every
    /// member context whose teardown was deferred, clearing `is_closing`
    /// and adjusting the group's establishment count. The terminating
    /// host notification was already emitted by the closing action.
    /// Returns the released CIS handles.
    pub fn on_cig_boundary(&mut self, cig_id: u8) -> Vec<u16> {
        let closing: Vec<u16> = self
            .cis_connections
            .values()
            .filter(|cis| cis.cig_id == cig_id && cis.is_closing)
            .map(|cis| cis.cis_handle)
            .collect();
        for &cis_handle in closing.iter() {
            if let Some(cis) = self.cis_connections.get_mut(&cis_handle) {
                cis.is_closing = false;
            }
            if let Some(cig) = self.cig_contexts.get_mut(&cig_id) {
                cig.num_cis_ested = cig.num_cis_ested.saturating_sub(1);
            }
            self.release_cis(cis_handle);
        }
        closing
    }

    fn release_cis(&mut self, cis_handle: u16) {
        if let Some(cis) = self.cis_connections.remove(&cis_handle) {
            let cig_id = cis.cig_id;
            if !self.cis_connections.values().any(|cis| cis.cig_id == cig_id) {
                self.cig_contexts.remove(&cig_id);
            }
        }
    }
}

/// Derive a valid ISO_Interval for a CIG from the group parameters.
/// SDU_Interval and Max_Transport_Latency are provided in microseconds.
pub(super) fn iso_interval(
    sdu_interval_c_to_p: microseconds,
    sdu_interval_p_to_c: microseconds,
    framed: bool,
    max_transport_latency_c_to_p: microseconds,
    max_transport_latency_p_to_c: microseconds,
) -> Option<slots> {
    if framed {
        let iso_interval = std::cmp::max(sdu_interval_c_to_p, sdu_interval_p_to_c);
        Some(((iso_interval + 1249) / 1250) as u16)
    } else {
        // Unframed PDUs shall only be used when the ISO_Interval is equal to
        // or an integer multiple of the SDU_Interval and a constant time offset
        // alignment is maintained between the SDU generation and the timing in
        // the isochronous transport.
        let iso_interval = num_integer::lcm(
            1250,
            match (sdu_interval_c_to_p, sdu_interval_p_to_c) {
                (0, 0) => return None,
                (0, _) => sdu_interval_p_to_c,
                (_, 0) => sdu_interval_c_to_p,
                _ => num_integer::lcm(sdu_interval_c_to_p, sdu_interval_p_to_c),
            },
        );
        let min_transport_latency_c_to_p = 2 * iso_interval - sdu_interval_c_to_p;
        let min_transport_latency_p_to_c = 2 * iso_interval - sdu_interval_p_to_c;

        ((iso_interval / 1250) <= u16::MAX as u32
            && (sdu_interval_c_to_p == 0
                || min_transport_latency_c_to_p <= max_transport_latency_c_to_p)
            && (sdu_interval_p_to_c == 0
                || min_transport_latency_p_to_c <= max_transport_latency_p_to_c))
            .then_some((iso_interval / 1250) as u16)
    }
}

/// Compute the transport latency for one direction of a CIS.
/// CIG_Sync_Delay and SDU_Interval are provided in microseconds,
/// ISO_Interval in multiples of 1.25ms.
pub(super) fn transport_latency(
    cig_sync_delay: microseconds,
    iso_interval: slots,
    ft: u8,
    sdu_interval: microseconds,
    framed: bool,
) -> microseconds {
    let iso_interval = iso_interval as u32 * 1250;
    if framed {
        cig_sync_delay + ft as u32 * iso_interval + sdu_interval
    } else {
        cig_sync_delay + ft as u32 * iso_interval - sdu_interval
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::llcp::test::*;
    use crate::packets::hci::ErrorCode;

    fn setup(ops: &TestOps) -> (IsoManager<&TestOps>, u16) {
        let mut iso = IsoManager::new(ops, Config::default());
        iso.add_acl_connection(default_acl_parameters());
        iso.create_cig(default_cig_parameters()).unwrap();
        let cis_handle = iso.create_cis(default_cis_parameters()).unwrap();
        (iso, cis_handle)
    }

    #[test]
    fn test_iso_interval() {
        assert!(iso_interval(0x7530, 0x7530, false, 0x7530, 0x7530).is_some());
        assert!(iso_interval(0x7530, 0, false, 0x7530, 0x7530).is_some());
        assert!(iso_interval(0x7530, 0x7530, false, 0x7000, 0x7000).is_none());
        assert!(iso_interval(0, 0, false, 0x7530, 0x7530).is_none());
        assert_eq!(iso_interval(0x7530, 0x7530, true, 0x7530, 0x7530), Some(24));
    }

    #[test]
    fn test_transport_latency() {
        // CIG_Sync_Delay 10ms, ISO_Interval 8 slots, FT 1, SDU_Interval 10ms.
        assert_eq!(transport_latency(10_000, 8, 1, 10_000, false), 10_000);
        assert_eq!(transport_latency(10_000, 8, 1, 10_000, true), 30_000);
        assert_eq!(transport_latency(10_000, 8, 2, 10_000, false), 20_000);
    }

    #[test]
    fn test_create_cig_validation() {
        let ops = TestOps::new();
        let mut iso = IsoManager::new(&ops, Config { max_cig: 1, ..Config::default() });
        iso.create_cig(default_cig_parameters()).unwrap();
        assert_eq!(
            iso.create_cig(default_cig_parameters()),
            Err(LinkLayerError::CigAlreadyExists)
        );
        assert_eq!(
            iso.create_cig(CigParameters { cig_id: 4, ..default_cig_parameters() }),
            Err(LinkLayerError::LimitReached)
        );
        let cig = iso.get_cig(CIG_ID).unwrap();
        assert_eq!(cig.iso_interval, 8);
        assert_eq!(cig.cig_sync_delay_usec, 10_000);
        assert_eq!(cig.num_cis_ested, 0);
    }

    #[test]
    fn test_create_cig_infeasible_latency() {
        let ops = TestOps::new();
        let mut iso = IsoManager::new(&ops, Config::default());
        let params = CigParameters {
            max_transport_latency_c_to_p: 5_000,
            max_transport_latency_p_to_c: 5_000,
            ..default_cig_parameters()
        };
        assert_eq!(iso.create_cig(params), Err(LinkLayerError::InvalidParameters));
    }

    #[test]
    fn test_create_cis_validation() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        assert_eq!(cis_handle, 0xe00);
        assert_eq!(
            iso.create_cis(default_cis_parameters()),
            Err(LinkLayerError::CisAlreadyExists)
        );
        assert_eq!(
            iso.create_cis(CisParameters { cig_id: 9, ..default_cis_parameters() }),
            Err(LinkLayerError::UnknownCig)
        );
        assert_eq!(
            iso.create_cis(CisParameters {
                cis_id: 2,
                acl_handle: 0xbad,
                ..default_cis_parameters()
            }),
            Err(LinkLayerError::UnknownAclConnection)
        );

        let cis = iso.get_cis(cis_handle).unwrap();
        assert_eq!(cis.state, CisState::Idle);
        assert_eq!(cis.nse, 1);
        assert_eq!(cis.bn_c_to_p, 1);
        assert_eq!(cis.iso_interval, 8);
        assert_eq!(cis.cis_sync_delay_usec, 10_000);
        assert_eq!(cis.transport_latency_c_to_p, 10_000);
    }

    #[test]
    fn test_act_cis_est_increments_established_count() {
        let ops = TestOps::new().with_tx_power(ACL_HANDLE, hci::PhyType::Le2m, PhyOptions::Default, 4);
        let (mut iso, cis_handle) = setup(&ops);
        iso.act_cis_est(cis_handle);
        assert_eq!(iso.get_cig(CIG_ID).unwrap().num_cis_ested, 1);
    }

    #[test]
    fn test_act_cis_est_managed_power() {
        let ops = TestOps::new().with_tx_power(ACL_HANDLE, hci::PhyType::Le2m, PhyOptions::Default, 4);
        let (mut iso, cis_handle) = setup(&ops);
        iso.act_cis_est(cis_handle);
        let cis = iso.get_cis(cis_handle).unwrap();
        assert_eq!(cis.tx_power, Some(4));
        assert!(!cis.power_ind_req);
    }

    #[test]
    fn test_act_cis_est_unmanaged_power_with_peer_request() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.on_peer_power_control_request(ACL_HANDLE);
        iso.act_cis_est(cis_handle);
        assert_eq!(
            ops.tx_power.borrow().get(&(ACL_HANDLE, hci::PhyType::Le2m, PhyOptions::Default)),
            Some(&0)
        );
        assert!(iso.get_cis(cis_handle).unwrap().power_ind_req);
    }

    #[test]
    fn test_act_cis_est_unmanaged_power_coded_phy() {
        let ops = TestOps::new();
        let mut iso = IsoManager::new(&ops, Config { def_tx_power: 6, ..Config::default() });
        iso.add_acl_connection(default_acl_parameters());
        iso.create_cig(default_cig_parameters()).unwrap();
        let cis_handle = iso
            .create_cis(CisParameters {
                phy_c_to_p: hci::PhyType::LeCoded,
                phy_p_to_c: hci::PhyType::LeCoded,
                ..default_cis_parameters()
            })
            .unwrap();
        iso.on_peer_power_control_request(ACL_HANDLE);
        iso.act_cis_est(cis_handle);
        let tx_power = ops.tx_power.borrow();
        assert_eq!(tx_power.get(&(ACL_HANDLE, hci::PhyType::LeCoded, PhyOptions::Default)), Some(&6));
        assert_eq!(tx_power.get(&(ACL_HANDLE, hci::PhyType::LeCoded, PhyOptions::S2)), Some(&6));
    }

    #[test]
    fn test_act_cis_est_unmanaged_power_without_peer_request() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.act_cis_est(cis_handle);
        let cis = iso.get_cis(cis_handle).unwrap();
        assert_eq!(cis.tx_power, None);
        assert!(!cis.power_ind_req);
        assert!(ops.tx_power.borrow().is_empty());
    }

    #[test]
    fn test_act_cis_est_fail_notifies_with_zero_sync_delay() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.store_conn_fail_establish_terminate_reason(cis_handle);
        iso.act_cis_est_fail(cis_handle);
        assert_eq!(ops.hci_events.borrow().len(), 1);
        let event = ops.hci_events.borrow_mut().pop_front().unwrap();
        match event {
            hci::Event::LeCisEstablished(event) => {
                assert_eq!(event.status, ErrorCode::ConnectionFailedToBeEstablished);
                assert_eq!(event.cig_sync_delay, 0);
                assert_eq!(event.nse, 0);
            }
            event => panic!("unexpected event {:?}", event),
        }
        assert!(iso.get_cis(cis_handle).is_none());
    }

    #[test]
    fn test_act_cis_est_fail_reinterprets_llcp_timeout() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Requesting;
        iso.cis_connections.get_mut(&cis_handle).unwrap().cis_req_pend = true;
        iso.store_llcp_timeout_terminate_reason(cis_handle);
        iso.act_cis_est_fail(cis_handle);
        match ops.hci_events.borrow_mut().pop_front().unwrap() {
            hci::Event::LeCisEstablished(event) => {
                assert_eq!(event.status, ErrorCode::UnsupportedFeatureOrParameterValue);
                assert_eq!(event.cig_sync_delay, 0);
            }
            event => panic!("unexpected event {:?}", event),
        }
        assert!(iso.get_cis(cis_handle).is_none());
    }

    #[test]
    fn test_act_cis_est_fail_reports_raw_reason_without_pending_request() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.store_llcp_timeout_terminate_reason(cis_handle);
        iso.act_cis_est_fail(cis_handle);
        let event = ops.hci_events.borrow_mut().pop_front().unwrap();
        match event {
            hci::Event::LeCisEstablished(event) => {
                assert_eq!(event.status, ErrorCode::LmpLlResponseTimeout);
            }
            event => panic!("unexpected event {:?}", event),
        }
    }

    #[test]
    fn test_act_disc_enqueues_api_disconnect() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.store_disconnect_reason(cis_handle, ErrorCode::RemoteUserTerminatedConnection);
        iso.act_disc(cis_handle);
        assert_eq!(
            ops.messages.borrow_mut().pop_front(),
            Some(Message::ApiDisconnect {
                acl_handle: ACL_HANDLE,
                cis_handle,
                reason: ErrorCode::RemoteUserTerminatedConnection,
            })
        );
        // The termination PDU is sent later by the LLCP procedure.
        assert!(ops.llcp_packets.borrow().is_empty());
        assert!(ops.hci_events.borrow().is_empty());
    }

    #[test]
    fn test_act_closed_defers_release() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.store_disconnect_reason(cis_handle, ErrorCode::RemoteUserTerminatedConnection);
        assert_eq!(iso.act_closed(cis_handle), Some(CloseOutcome::DeferredClose));

        let cis = iso.get_cis(cis_handle).unwrap();
        assert!(cis.is_closing);
        assert_eq!(cis.state, CisState::Closing);
        assert_eq!(
            ops.stopped_timers.borrow().as_slice(),
            &[TimerId::CisSupervision(cis_handle)]
        );
        let event = ops.hci_events.borrow_mut().pop_front().unwrap();
        match event {
            hci::Event::DisconnectionComplete(event) => {
                assert_eq!(event.reason, ErrorCode::RemoteUserTerminatedConnection);
            }
            event => panic!("unexpected event {:?}", event),
        }
    }

    #[test]
    fn test_act_closed_releases_immediately_on_establishment_failure() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.store_conn_fail_establish_terminate_reason(cis_handle);
        assert_eq!(iso.act_closed(cis_handle), Some(CloseOutcome::ImmediateRelease));
        assert!(iso.get_cis(cis_handle).is_none());
        let event = ops.hci_events.borrow_mut().pop_front().unwrap();
        match event {
            hci::Event::LeCisEstablished(event) => {
                assert_eq!(event.status, ErrorCode::ConnectionFailedToBeEstablished);
                assert_eq!(event.cig_sync_delay, 0);
            }
            event => panic!("unexpected event {:?}", event),
        }
    }

    #[test]
    fn test_act_closed_stops_vendor_codec() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.set_iso_data_path_out(cis_handle, IsoDataPathId::Vendor);
        iso.store_disconnect_reason(cis_handle, ErrorCode::RemoteUserTerminatedConnection);
        iso.act_closed(cis_handle);
        assert_eq!(ops.codec_stops.borrow().as_slice(), &[cis_handle]);
    }

    #[test]
    fn test_act_closed_skips_codec_for_hci_data_path() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.set_iso_data_path_out(cis_handle, IsoDataPathId::Hci);
        iso.store_disconnect_reason(cis_handle, ErrorCode::RemoteUserTerminatedConnection);
        iso.act_closed(cis_handle);
        assert!(ops.codec_stops.borrow().is_empty());
    }

    #[test]
    fn test_act_fail_ignored_outside_established_state() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        for state in [CisState::Idle, CisState::Requesting, CisState::Closing] {
            iso.cis_connections.get_mut(&cis_handle).unwrap().state = state;
            iso.act_fail(cis_handle);
            assert_eq!(iso.get_cis(cis_handle).unwrap().state, state);
            assert!(!iso.get_cis(cis_handle).unwrap().is_closing);
            assert!(ops.hci_events.borrow().is_empty());
            assert!(ops.descheduled_bods.borrow().is_empty());
        }
    }

    #[test]
    fn test_act_fail_descheduled_and_notifies() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.store_conn_timeout_terminate_reason(cis_handle);
        iso.act_fail(cis_handle);

        assert_eq!(ops.descheduled_bods.borrow().as_slice(), &[BOD_HANDLE]);
        assert_eq!(ops.hci_events.borrow().len(), 1);
        match ops.hci_events.borrow_mut().pop_front().unwrap() {
            hci::Event::DisconnectionComplete(event) => {
                assert_eq!(event.cis_handle, cis_handle);
                assert_eq!(event.reason, ErrorCode::ConnectionTimeout);
            }
            event => panic!("unexpected event {:?}", event),
        }
        let cis = iso.get_cis(cis_handle).unwrap();
        assert!(cis.is_closing);
        assert_eq!(cis.state, CisState::Closing);
    }

    #[test]
    fn test_reason_setters() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);

        iso.store_terminate_reason(
            cis_handle,
            &llcp::CisTerminateInd {
                cig_id: CIG_ID,
                cis_id: 1,
                error_code: ErrorCode::RemoteUserTerminatedConnection,
            },
        );
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::RemoteUserTerminatedConnection);

        iso.store_disconnect_reason(cis_handle, ErrorCode::ConnectionTerminatedByLocalHost);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::ConnectionTerminatedByLocalHost);

        iso.store_conn_fail_establish_terminate_reason(cis_handle);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::ConnectionFailedToBeEstablished);

        iso.store_conn_timeout_terminate_reason(cis_handle);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::ConnectionTimeout);

        iso.store_llcp_timeout_terminate_reason(cis_handle);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::LmpLlResponseTimeout);

        iso.store_local_low_resource_terminate_reason(cis_handle);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::MemoryCapacityExceeded);

        iso.store_llcp_peer_rej_terminate_reason(
            cis_handle,
            &llcp::RejectExtInd {
                reject_opcode: llcp::Opcode::LlCisReq as u8,
                error_code: ErrorCode::UnsupportedRemoteFeature,
            },
        );
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::UnsupportedRemoteFeature);

        iso.store_mic_failed_terminate_reason(cis_handle);
        assert_eq!(iso.get_cis(cis_handle).unwrap().reason, ErrorCode::ConnectionTerminatedMicFailure);
    }

    #[test]
    fn test_on_cig_boundary_releases_closing_contexts() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        iso.cig_contexts.get_mut(&CIG_ID).unwrap().num_cis_ested = 1;
        iso.store_conn_timeout_terminate_reason(cis_handle);
        iso.act_fail(cis_handle);
        ops.hci_events.borrow_mut().clear();

        assert_eq!(iso.on_cig_boundary(CIG_ID), vec![cis_handle]);
        assert!(iso.get_cis(cis_handle).is_none());
        // Last member released, the group is gone with it.
        assert!(iso.get_cig(CIG_ID).is_none());
        // The boundary cleanup never notifies.
        assert!(ops.hci_events.borrow().is_empty());
    }

    #[test]
    fn test_on_cig_boundary_ignores_open_contexts() {
        let ops = TestOps::new();
        let (mut iso, cis_handle) = setup(&ops);
        iso.cis_connections.get_mut(&cis_handle).unwrap().state = CisState::Established;
        assert!(iso.on_cig_boundary(CIG_ID).is_empty());
        assert!(iso.get_cis(cis_handle).is_some());
        assert!(iso.get_cig(CIG_ID).is_some());
    }
}
