use crate::consts::tokens;

use bitfield::bitfield;
use defmt::Format;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    pub start_bit, _: 7;
}

impl R1Response {
    /// Card is initialized and no error flag is set.
    pub const READY_STATE: Self = Self(0x00);
    /// Card is in idle state and no error flag is set.
    pub const IN_IDLE_STATE: Self = Self(0x01);
    /// Idle state flag.
    const IDLE_MASK: u8 = 0x01;

    /// Raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Response starts with a zero bit.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }

    /// No flag other than idle is set.
    pub fn is_ok(&self) -> bool {
        self.0 & !Self::IDLE_MASK == 0
    }
}

impl From<u8> for R1Response {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// R3/R7 payload.
pub type R3OcrPayload = [u8; 4];

bitfield! {
    /// Operation Conditions Register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Ocr(u32);
    impl Debug;
    pub power_up_complete, _: 31;
    pub card_capacity_status, _: 30;
    pub uhs2_card_status, _: 29;
    pub switching_to_1v8_accepted, _: 24;
    pub u16, voltage_window, _: 23, 15;
}

impl From<R3OcrPayload> for Ocr {
    fn from(payload: R3OcrPayload) -> Self {
        Ocr(u32::from_be_bytes(payload))
    }
}

bitfield! {
    /// Card status, R2 response of `SEND_STATUS`.
    ///
    /// The high byte is the R1 response of the command.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CardStatus(u16);
    impl Debug;
    pub in_idle_state, _: 8;
    pub erase_reset, _: 9;
    pub illegal_command, _: 10;
    pub command_crc_error, _: 11;
    pub erase_sequence_error, _: 12;
    pub address_error, _: 13;
    pub parameter_error, _: 14;
    pub out_of_range, _: 7;
    pub erase_param, _: 6;
    pub write_protect_violation, _: 5;
    pub card_ecc_failed, _: 4;
    pub card_controller_error, _: 3;
    pub error, _: 2;
    pub write_protect_erase_skip, _: 1;
    pub card_locked, _: 0;
}

impl CardStatus {
    /// Builds the status from the R1 response and the byte following it.
    pub fn new(r1: R1Response, status: u8) -> Self {
        CardStatus((u16::from(r1.bits()) << 8) | u16::from(status))
    }

    /// Raw bits.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// R1 part of the status.
    pub fn r1(&self) -> R1Response {
        R1Response((self.0 >> 8) as u8)
    }
}

/// Data response token returned after a written block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum DataResponse {
    /// Data accepted.
    Accepted,
    /// Data rejected due to a CRC error.
    CrcError,
    /// Data rejected due to a write error.
    WriteError,
    /// Token with unknown status bits.
    Unknown(u8),
}

impl From<u8> for DataResponse {
    fn from(token: u8) -> Self {
        match token & tokens::DATA_RES_MASK {
            tokens::DATA_RES_ACCEPTED => DataResponse::Accepted,
            tokens::DATA_RES_CRC_ERROR => DataResponse::CrcError,
            tokens::DATA_RES_WRITE_ERROR => DataResponse::WriteError,
            other => DataResponse::Unknown(other),
        }
    }
}
