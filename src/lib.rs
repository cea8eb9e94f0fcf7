//! SD card block access over SPI, written in Embedded Rust.
//!
//! This crate negotiates SD cards (version 1, version 2 standard capacity
//! and SDHC/SDXC) on a SPI bus and reads or writes their 512-byte blocks.
//! The driver owns the bus for the card and carries the negotiated card
//! class; every block operation dispatches on it.

#![cfg_attr(not(test), no_std)]

mod cid;
mod clock;
mod config;
mod consts;
mod crc;
mod csd;
mod device;
mod init;
mod response;
mod transfer;

pub use crate::cid::{Cid, CidData};
pub use crate::clock::{ClockRate, SpiClock};
pub use crate::config::{DefaultSdMmcSpiConfig, SdMmcSpiConfig};
pub use crate::consts::{args, commands, tokens, BLOCK_SIZE};
pub use crate::csd::{capacity_in_blocks, CapacityProvider, Csd, CsdData, CsdError, CsdV1, CsdV2};
pub use crate::response::{CardStatus, DataResponse, Ocr, R1Response};
pub use crate::transfer::StreamOutcomeFor;
pub use diskio::{
    BlockSize, DiskioDevice, Error as DiskioError, IoctlCmd, Lba, Status, StatusFlag,
};

use crate::{
    consts::tokens::{AVAILABLE, DATA_START_BLOCK},
    crc::{crc16, crc7},
};

use core::{cell::RefCell, marker::PhantomData};
use defmt::{debug, warn, Format};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// One data block.
pub type Block = [u8; BLOCK_SIZE];

/// [`SdMmcSpi`] result error.
///
/// `T` - transport error type.
/// `S` - select switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<T, S> {
    /// Error from the SPI peripheral.
    Transport(T),
    /// Couldn't set a select.
    SelectError(S),
    /// Couldn't change the SPI clock rate.
    ClockError,
    /// No data token when reading data from the card.
    TimeoutReadBuffer,
    /// No response when waiting for the card to not be busy.
    TimeoutWaitAvailable,
    /// No response when executing this command.
    TimeoutCommand(u8),
    /// Command rejected with this R1 response.
    ErrorCommand(u8, u8),
    /// SEND_IF_COND echoed another voltage range.
    VoltageMismatch(u8),
    /// SEND_IF_COND echoed another check pattern.
    CheckPatternMismatch(u8),
    /// CSD register can't be interpreted.
    Csd(CsdError),
    /// Data block started with an unexpected token.
    MalformedDataBlock(u8),
    /// Written block was not accepted.
    TransferRejected(DataResponse),
    /// CRC mismatch (card, host).
    CrcError(u16, u16),
    /// Buffer length is not a non-zero multiple of the block size.
    InvalidBuffer(usize),
    /// Block index can't be addressed on this card.
    InvalidAddress(u32),
    /// Can't perform this operation with the card in this state.
    BadState,
    /// Couldn't find the card.
    CardNotFound,
}

/// Card class negotiated by [`SdMmcSpi::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum CardClass {
    /// No successful negotiation.
    Unclassified,
    /// Version 1 card, byte addressed.
    LegacyByteAddressed,
    /// Version 2 standard capacity card.
    StandardCapacityBlockAddressed,
    /// Version 2 high or extended capacity card, block addressed.
    HighOrExtendedCapacityBlockAddressed,
}

/// Outcome of a multiple block transfer.
///
/// A stream stopped by the card still ends with its stop sequence, so the
/// blocks before the failure are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome<E> {
    /// All requested blocks were transferred.
    Complete(usize),
    /// Stream stopped after `blocks` blocks because of `cause`.
    Stopped { blocks: usize, cause: E },
}

impl<E> StreamOutcome<E> {
    fn new(blocks: usize, cause: Option<E>) -> Self {
        match cause {
            None => StreamOutcome::Complete(blocks),
            Some(cause) => StreamOutcome::Stopped { blocks, cause },
        }
    }

    /// Count of transferred blocks.
    pub fn blocks(&self) -> usize {
        match self {
            StreamOutcome::Complete(blocks) | StreamOutcome::Stopped { blocks, .. } => *blocks,
        }
    }

    /// Whether the stream ran to the end.
    pub fn is_complete(&self) -> bool {
        matches!(self, StreamOutcome::Complete(_))
    }

    /// Error that stopped the stream.
    pub fn cause(&self) -> Option<&E> {
        match self {
            StreamOutcome::Complete(_) => None,
            StreamOutcome::Stopped { cause, .. } => Some(cause),
        }
    }

    /// Converts a stopped stream into its cause.
    pub fn into_result(self) -> Result<usize, E> {
        match self {
            StreamOutcome::Complete(blocks) => Ok(blocks),
            StreamOutcome::Stopped { cause, .. } => Err(cause),
        }
    }
}

/// Error type alias.
type ErrorFor<T> = <T as DiskioDevice>::HardwareError;

/// SD Card SPI driver.
///
/// `Spi` - SPI.
/// `Cs` - Chip select output switch.
/// `Clock` - SPI clock control.
/// `Config` - Config implementation of driver config trait.
pub struct SdMmcSpi<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig>
{
    spi: RefCell<Spi>,
    cs: RefCell<Cs>,
    clock: RefCell<Clock>,
    status: Status,
    class: CardClass,
    config: PhantomData<Config>,
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig>
    SdMmcSpi<Spi, Cs, Clock, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Receive transfer token.
    const RECEIVE_TRANSFER_TOKEN: u8 = 0xFF;
    /// CRC sent with data blocks when CRC checking is off.
    const DUMMY_CRC: u16 = 0xFFFF;

    /// Creates a new [`SdMmcSpi<Spi, Cs, Clock, Config>`].
    ///
    /// `spi` - SPI instance.
    /// `cs` - chip select output switch.
    /// `clock` - SPI clock control, `()` for a fixed clock.
    pub fn new(spi: Spi, cs: Cs, clock: Clock) -> Self {
        SdMmcSpi {
            spi: RefCell::new(spi),
            cs: RefCell::new(cs),
            clock: RefCell::new(clock),
            status: StatusFlag::NotInitialized.into(),
            class: CardClass::Unclassified,
            config: PhantomData::<Config>,
        }
    }

    /// Negotiated card class.
    pub fn class(&self) -> CardClass {
        self.class
    }

    /// Releases the bus.
    pub fn free(self) -> (Spi, Cs, Clock) {
        (
            self.spi.into_inner(),
            self.cs.into_inner(),
            self.clock.into_inner(),
        )
    }

    /// Validate buffer for multiple block transfers.
    fn validate_buffer_len(buf_len: usize) -> Result<(), ErrorFor<Self>> {
        if buf_len == 0 || buf_len % BLOCK_SIZE != 0 {
            warn!(
                "SD invalid buffer, length: {}, block size: {}",
                buf_len, BLOCK_SIZE
            );
            Err(Error::InvalidBuffer(buf_len))
        } else {
            Ok(())
        }
    }

    /// Validate initialzed.
    fn validate_initialized(&self) -> Result<(), ErrorFor<Self>> {
        if self.class == CardClass::Unclassified {
            Err(Error::BadState)
        } else {
            Ok(())
        }
    }

    /// Get count of blocks in buffer.
    fn get_block_count(buf_len: usize) -> usize {
        buf_len / BLOCK_SIZE
    }

    /// Delay.
    fn delay() {
        for i in 0..Config::DELAY_DUMMY_CYCLES {
            unsafe { core::ptr::read_volatile(&i) };
        }
    }

    /// Convert block index to the command argument.
    fn convert_lba(&self, block: u32) -> Result<u32, ErrorFor<Self>> {
        match self.class {
            CardClass::Unclassified => Err(Error::BadState),
            CardClass::LegacyByteAddressed | CardClass::StandardCapacityBlockAddressed => block
                .checked_mul(BLOCK_SIZE as u32)
                .ok_or(Error::InvalidAddress(block)),
            CardClass::HighOrExtendedCapacityBlockAddressed => Ok(block),
        }
    }

    /// Activate chip select.
    fn select(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().on().map_err(Error::SelectError)
    }

    /// Deactivate chip select.
    fn unselect(&self) -> Result<(), ErrorFor<Self>> {
        self.cs.borrow_mut().off().map_err(Error::SelectError)
    }

    /// Change SPI clock rate.
    fn set_clock(&self, rate: ClockRate) -> Result<(), ErrorFor<Self>> {
        self.clock.borrow_mut().set_rate(rate).map_err(|err| {
            warn!(
                "Failed to set SPI clock {}: {}",
                rate,
                defmt::Debug2Format(&err)
            );
            Error::ClockError
        })
    }

    /// Transaction scope, the card is deselected whatever the outcome.
    fn transaction<F, R>(&self, f: F) -> Result<R, ErrorFor<Self>>
    where
        F: FnOnce(&Self) -> Result<R, ErrorFor<Self>>,
    {
        let result = f(self);
        self.unselect()?;

        result
    }

    /// Send one byte and receive one byte.
    fn transfer(&self, data: u8) -> Result<u8, ErrorFor<Self>> {
        self.spi
            .borrow_mut()
            .transfer(&mut [data])
            .map(|b| b[0])
            .map_err(Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&self) -> Result<u8, ErrorFor<Self>> {
        self.transfer(Self::RECEIVE_TRANSFER_TOKEN)
    }

    /// Send a byte to the SD card.
    fn send(&self, data: u8) -> Result<(), ErrorFor<Self>> {
        self.transfer(data).map(|_| ())
    }

    /// Receive a slice from the SD card.
    fn receive_slice(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }

        Ok(())
    }

    /// Send a slice to the SD card.
    fn send_slice(&self, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        for byte in data.iter() {
            self.send(*byte)?;
        }

        Ok(())
    }

    /// Skip byte.
    fn skip_byte(&self) -> Result<(), ErrorFor<Self>> {
        self.receive().map(|_| ())
    }

    /// Wait for token.
    fn wait_for_token<F: Fn(u8) -> bool>(
        &self,
        token_validator: F,
        attempts: usize,
        error: ErrorFor<Self>,
    ) -> Result<u8, ErrorFor<Self>> {
        for _ in 0..attempts {
            let token = self.receive()?;

            if token_validator(token) {
                return Ok(token);
            }

            Self::delay();
        }

        Err(error)
    }

    /// Wait available state of card.
    fn wait_available_state(&self) -> Result<(), ErrorFor<Self>> {
        self.wait_for_token(
            |token| token == AVAILABLE,
            Config::CMD_MAX_ATTEMPTS,
            Error::TimeoutWaitAvailable,
        )
        .map(|_| ())
    }

    /// Send command implementation.
    fn send_command_impl(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        // STOP_TRANSMISSION is sent in the middle of a read stream.
        if cmd != commands::CMD12 {
            self.unselect()?;
            self.select()?;
            self.wait_available_state()?;
        }

        let mut buf = [
            commands::CMD_BASE | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        let crc_index = buf.len() - 1;

        buf[crc_index] = (crc7(&buf[..crc_index]) << 1) | 0x01;

        self.send_slice(&buf)?;

        if cmd == commands::CMD12 {
            self.skip_byte()?;
        }

        for _ in 0..Config::READ_R1_ATTEMPTS {
            let r1 = R1Response::from(self.receive()?);

            if r1.is_valid() {
                return Ok(r1);
            }
        }

        Err(Error::TimeoutCommand(cmd))
    }

    /// Send a command and return its R1 response.
    ///
    /// Commands carrying [`commands::ACMD_FLAG`] are preceded by `CMD55`;
    /// a `CMD55` response with any flag other than idle fails the command.
    /// The card stays selected after the response.
    pub fn send_command(&self, cmd: u8, arg: u32) -> Result<R1Response, ErrorFor<Self>> {
        if (cmd & commands::ACMD_FLAG) != 0 {
            let r1 = self.send_command_impl(commands::CMD55, 0x0000_0000)?;

            if !r1.is_ok() {
                return Err(Error::ErrorCommand(commands::CMD55, r1.bits()));
            }
        }

        self.send_command_impl(cmd & commands::INDEX_MASK, arg)
    }

    /// Send command and require exactly `expected` as response.
    fn expect_command(
        &self,
        cmd: u8,
        arg: u32,
        expected: R1Response,
    ) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(cmd, arg)?;

        if r1 != expected {
            warn!("Wrong response from CMD{}: 0x{:02X}", cmd, r1.bits());
            Err(Error::ErrorCommand(cmd, r1.bits()))
        } else {
            Ok(())
        }
    }

    /// Read data.
    fn read_data(&self, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        let token = self.wait_for_token(
            |token| token != AVAILABLE,
            Config::READ_TOKEN_ATTEMPTS,
            Error::TimeoutReadBuffer,
        )?;

        if token != DATA_START_BLOCK {
            return Err(Error::MalformedDataBlock(token));
        }

        self.receive_slice(data)?;

        let card_crc = (u16::from(self.receive()?) << 8) | u16::from(self.receive()?);

        if Config::DATA_CRC {
            let host_crc = crc16(data);

            if card_crc != host_crc {
                return Err(Error::CrcError(card_crc, host_crc));
            }
        }

        Ok(())
    }

    /// Write data.
    fn write_data(&self, token: u8, data: &[u8]) -> Result<(), ErrorFor<Self>> {
        let host_crc = if Config::DATA_CRC {
            crc16(data)
        } else {
            Self::DUMMY_CRC
        };

        self.send(token)?;
        self.send_slice(data)?;
        self.send((host_crc >> 8) as u8)?;
        self.send(host_crc as u8)?;

        match DataResponse::from(self.receive()?) {
            DataResponse::Accepted => Ok(()),
            response => {
                debug!("SD data response: {}", response);
                Err(Error::TransferRejected(response))
            }
        }
    }
}
