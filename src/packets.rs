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

pub mod hci {
    //! Host facing types: error codes, roles, PHYs, LL feature bits and
    //! the event records forwarded to the host event sink.

    use num_derive::FromPrimitive;

    /// HCI error codes, used both as CIS termination reasons and as the
    /// status of host events.
    #[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum ErrorCode {
        Success = 0x00,
        UnknownConnection = 0x02,
        MemoryCapacityExceeded = 0x07,
        ConnectionTimeout = 0x08,
        ConnectionAlreadyExists = 0x0b,
        CommandDisallowed = 0x0c,
        UnsupportedFeatureOrParameterValue = 0x11,
        InvalidHciCommandParameters = 0x12,
        RemoteUserTerminatedConnection = 0x13,
        ConnectionTerminatedByLocalHost = 0x16,
        UnsupportedRemoteFeature = 0x1a,
        LmpLlResponseTimeout = 0x22,
        ConnectionTerminatedMicFailure = 0x3d,
        ConnectionFailedToBeEstablished = 0x3e,
        LimitReached = 0x43,
    }

    /// Connection role. The Central initiates the CIS request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Role {
        Central,
        Peripheral,
    }

    /// Radio PHY in use for one direction of a link.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum PhyType {
        NoPackets,
        Le1m,
        Le2m,
        LeCoded,
    }

    /// LL feature bits read out of a connection's negotiated feature set.
    #[derive(Clone, Copy, Debug)]
    #[repr(u64)]
    pub enum LLFeaturesBits {
        Le2mPhy = 1 << 8,
        LeCodedPhy = 1 << 11,
        ConnectedIsochronousStreamCentral = 1 << 28,
        ConnectedIsochronousStreamPeripheral = 1 << 29,
        ConnectedIsochronousStreamHostSupport = 1 << 32,
        LePowerControlRequest = 1 << 33,
        LePowerChangeIndication = 1 << 34,
    }

    /// LE CIS Established event record. The timing parameters are only
    /// meaningful when `status` is `Success`.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LeCisEstablished {
        pub status: ErrorCode,
        pub cis_handle: u16,
        pub cig_sync_delay: u32,
        pub cis_sync_delay: u32,
        pub transport_latency_c_to_p: u32,
        pub transport_latency_p_to_c: u32,
        pub phy_c_to_p: PhyType,
        pub phy_p_to_c: PhyType,
        pub nse: u8,
        pub bn_c_to_p: u8,
        pub bn_p_to_c: u8,
        pub ft_c_to_p: u8,
        pub ft_p_to_c: u8,
        pub iso_interval: u16,
    }

    /// Disconnection Complete event record.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct DisconnectionComplete {
        pub status: ErrorCode,
        pub cis_handle: u16,
        pub reason: ErrorCode,
    }

    /// Events forwarded to the host event sink.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        LeCisEstablished(LeCisEstablished),
        DisconnectionComplete(DisconnectionComplete),
    }

    impl From<LeCisEstablished> for Event {
        fn from(event: LeCisEstablished) -> Event {
            Event::LeCisEstablished(event)
        }
    }

    impl From<DisconnectionComplete> for Event {
        fn from(event: DisconnectionComplete) -> Event {
            Event::DisconnectionComplete(event)
        }
    }
}

pub mod llcp {
    //! LLCP control PDU codecs for the CIS termination procedure.
    //!
    //! Only the PDUs consumed or produced by this subsystem are encoded
    //! here; the establishment PDUs (LL_CIS_REQ, LL_CIS_RSP, LL_CIS_IND)
    //! belong to the connection update machinery and appear only as
    //! opcodes.

    use bytes::{Buf, BufMut};
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive as _;
    use thiserror::Error;

    use super::hci::ErrorCode;

    #[derive(FromPrimitive, Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Opcode {
        LlRejectExtInd = 0x11,
        LlCisReq = 0x1f,
        LlCisRsp = 0x20,
        LlCisInd = 0x21,
        LlCisTerminateInd = 0x22,
    }

    #[derive(Error, Clone, Debug, PartialEq, Eq)]
    pub enum DecodeError {
        #[error("empty control PDU")]
        EmptyPdu,
        #[error("unknown opcode {0:#04x}")]
        UnknownOpcode(u8),
        #[error("unhandled opcode {0:?}")]
        UnhandledOpcode(Opcode),
        #[error("invalid payload length {got} for {opcode:?}")]
        InvalidLength { opcode: Opcode, got: usize },
        #[error("invalid error code {0:#04x}")]
        InvalidErrorCode(u8),
    }

    /// LL_CIS_TERMINATE_IND.
    /// Wire layout: [opcode:1][cig_id:1][cis_id:1][error_code:1].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CisTerminateInd {
        pub cig_id: u8,
        pub cis_id: u8,
        pub error_code: ErrorCode,
    }

    impl CisTerminateInd {
        pub fn encode_to_vec(&self) -> Vec<u8> {
            let mut pdu = Vec::with_capacity(4);
            pdu.put_u8(Opcode::LlCisTerminateInd as u8);
            pdu.put_u8(self.cig_id);
            pdu.put_u8(self.cis_id);
            pdu.put_u8(self.error_code as u8);
            pdu
        }

        fn decode(mut payload: &[u8]) -> Result<CisTerminateInd, DecodeError> {
            if payload.len() != 3 {
                return Err(DecodeError::InvalidLength {
                    opcode: Opcode::LlCisTerminateInd,
                    got: payload.len(),
                });
            }
            let cig_id = payload.get_u8();
            let cis_id = payload.get_u8();
            let raw_error_code = payload.get_u8();
            let error_code = ErrorCode::from_u8(raw_error_code)
                .ok_or(DecodeError::InvalidErrorCode(raw_error_code))?;
            Ok(CisTerminateInd { cig_id, cis_id, error_code })
        }
    }

    /// LL_REJECT_EXT_IND.
    /// Wire layout: [opcode:1][reject_opcode:1][error_code:1].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RejectExtInd {
        pub reject_opcode: u8,
        pub error_code: ErrorCode,
    }

    impl RejectExtInd {
        pub fn encode_to_vec(&self) -> Vec<u8> {
            let mut pdu = Vec::with_capacity(3);
            pdu.put_u8(Opcode::LlRejectExtInd as u8);
            pdu.put_u8(self.reject_opcode);
            pdu.put_u8(self.error_code as u8);
            pdu
        }

        fn decode(mut payload: &[u8]) -> Result<RejectExtInd, DecodeError> {
            if payload.len() != 2 {
                return Err(DecodeError::InvalidLength {
                    opcode: Opcode::LlRejectExtInd,
                    got: payload.len(),
                });
            }
            let reject_opcode = payload.get_u8();
            let raw_error_code = payload.get_u8();
            let error_code = ErrorCode::from_u8(raw_error_code)
                .ok_or(DecodeError::InvalidErrorCode(raw_error_code))?;
            Ok(RejectExtInd { reject_opcode, error_code })
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum LlcpPacket {
        CisTerminateInd(CisTerminateInd),
        RejectExtInd(RejectExtInd),
    }

    impl LlcpPacket {
        pub fn decode(pdu: &[u8]) -> Result<LlcpPacket, DecodeError> {
            let (&opcode, payload) = pdu.split_first().ok_or(DecodeError::EmptyPdu)?;
            match Opcode::from_u8(opcode).ok_or(DecodeError::UnknownOpcode(opcode))? {
                Opcode::LlCisTerminateInd => {
                    CisTerminateInd::decode(payload).map(LlcpPacket::CisTerminateInd)
                }
                Opcode::LlRejectExtInd => {
                    RejectExtInd::decode(payload).map(LlcpPacket::RejectExtInd)
                }
                opcode => Err(DecodeError::UnhandledOpcode(opcode)),
            }
        }

        pub fn encode_to_vec(&self) -> Vec<u8> {
            match self {
                LlcpPacket::CisTerminateInd(pdu) => pdu.encode_to_vec(),
                LlcpPacket::RejectExtInd(pdu) => pdu.encode_to_vec(),
            }
        }
    }

}
