use crate::{
    consts::{args, commands, BLOCK_SIZE},
    response::{Ocr, R1Response, R3OcrPayload},
    CardClass, ClockRate, ErrorFor, SdMmcSpi, SdMmcSpiConfig, SpiClock,
};
use crate::{Error, Status, StatusFlag};

use defmt::{error, info, warn};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

/// Card generation, answered by SEND_IF_COND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generation {
    /// SEND_IF_COND is an illegal command.
    V1,
    /// SEND_IF_COND echoed the voltage range and check pattern.
    V2,
}

/// Negotiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    PowerOn,
    Idle,
    Branch(Generation),
    Ready(CardClass),
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig>
    SdMmcSpi<Spi, Cs, Clock, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Init sequence value.
    const INIT_SET_VALUE: u8 = 0xFF;
    /// Init sequence size, at least 74 clocks.
    const INIT_SET_SIZE: usize = 10;

    /// Negotiate the card and classify it.
    ///
    /// The previous class is dropped first; on failure the card stays
    /// [`CardClass::Unclassified`] and is deselected.
    pub fn reset(&mut self) -> Result<CardClass, ErrorFor<Self>> {
        info!("SD reset started");

        self.class = CardClass::Unclassified;
        self.status = StatusFlag::NotInitialized.into();

        let result = self.transaction(|s| s.negotiate());

        match &result {
            Ok(class) => {
                info!("SD successfully initialized, class: {}", class);
                self.class = *class;
                self.status = Status::default();
            }
            Err(err) => {
                error!("Failed to initialize SD: {}", defmt::Debug2Format(err));
                self.status = StatusFlag::ErrorOccured | StatusFlag::NotInitialized;
            }
        }

        result
    }

    /// Run the negotiation state machine.
    fn negotiate(&self) -> Result<CardClass, ErrorFor<Self>> {
        let mut state = InitState::PowerOn;

        loop {
            state = match state {
                InitState::PowerOn => {
                    self.power_on()?;
                    self.enter_spi_mode()?;
                    InitState::Idle
                }
                InitState::Idle => InitState::Branch(self.send_if_cond()?),
                InitState::Branch(Generation::V2) => InitState::Ready(self.init_v2()?),
                InitState::Branch(Generation::V1) => InitState::Ready(self.init_v1()?),
                InitState::Ready(class) => {
                    self.set_clock(ClockRate::Operating)?;
                    return Ok(class);
                }
            };
        }
    }

    /// Slow clock and dummy cycles with the card deselected.
    fn power_on(&self) -> Result<(), ErrorFor<Self>> {
        self.set_clock(ClockRate::Negotiation)?;
        self.unselect()?;

        for _ in 0..Self::INIT_SET_SIZE {
            self.send(Self::INIT_SET_VALUE)?;
        }

        Ok(())
    }

    /// Enter SD to SPI mode.
    fn enter_spi_mode(&self) -> Result<(), ErrorFor<Self>> {
        for i in 0..Config::ENTER_SPI_MODE_ATTEMPTS {
            info!("Enter to SPI mode for SD, attempt: {}", i + 1);

            match self.send_command(commands::CMD0, 0x0000_0000) {
                Ok(R1Response::IN_IDLE_STATE) => return Ok(()),
                Ok(r) => warn!("Wrong response from CMD{}: 0x{:02X}", commands::CMD0, r.bits()),
                Err(Error::TimeoutCommand(commands::CMD0)) | Err(Error::TimeoutWaitAvailable) => {}
                Err(err) => return Err(err),
            }

            Self::delay();
        }

        Err(Error::CardNotFound)
    }

    /// Verify SD Memory Card interface operating condition.
    fn send_if_cond(&self) -> Result<Generation, ErrorFor<Self>> {
        info!("Verifing SD Memory Card interface operating condition");

        let r1 = self.send_command(commands::CMD8, args::IF_COND)?;

        if r1 != R1Response::IN_IDLE_STATE {
            info!("CMD8 rejected with 0x{:02X}, version 1 card", r1.bits());
            return Ok(Generation::V1);
        }

        let mut echo: R3OcrPayload = Default::default();
        self.receive_slice(&mut echo)?;

        if echo[2] != args::IF_COND_VOLTAGE {
            return Err(Error::VoltageMismatch(echo[2]));
        }
        if echo[3] != args::IF_COND_CHECK_PATTERN {
            return Err(Error::CheckPatternMismatch(echo[3]));
        }

        Ok(Generation::V2)
    }

    /// Switch CRC checking on the card, off unless data CRC is configured.
    fn configure_crc(&self) -> Result<(), ErrorFor<Self>> {
        info!("Setting CRC checking for SD: {}", Config::DATA_CRC);

        self.expect_command(
            commands::CMD59,
            u32::from(Config::DATA_CRC),
            R1Response::IN_IDLE_STATE,
        )
    }

    /// Sends host capacity support information and activates.
    fn send_op_comd(&self, arg: u32) -> Result<(), ErrorFor<Self>> {
        info!("Sending host capacity support information and activates");

        for _ in 0..Config::INIT_ATTEMPTS {
            match self.send_command(commands::ACMD41, arg)? {
                R1Response::READY_STATE => return Ok(()),
                R1Response::IN_IDLE_STATE => Self::delay(),
                r1 => return Err(Error::ErrorCommand(commands::ACMD41, r1.bits())),
            }
        }

        Err(Error::TimeoutCommand(commands::ACMD41))
    }

    /// Read the OCR register.
    fn read_ocr(&self) -> Result<Ocr, ErrorFor<Self>> {
        self.expect_command(commands::CMD58, 0x0000_0000, R1Response::READY_STATE)?;

        let mut payload: R3OcrPayload = Default::default();
        self.receive_slice(&mut payload)?;

        Ok(Ocr::from(payload))
    }

    /// Version 2 card, classified by its capacity status.
    fn init_v2(&self) -> Result<CardClass, ErrorFor<Self>> {
        self.configure_crc()?;
        self.send_op_comd(args::HCS)?;

        let ocr = self.read_ocr()?;

        Ok(if ocr.card_capacity_status() {
            CardClass::HighOrExtendedCapacityBlockAddressed
        } else {
            CardClass::StandardCapacityBlockAddressed
        })
    }

    /// Version 1 card, block length fixed to the block size.
    fn init_v1(&self) -> Result<CardClass, ErrorFor<Self>> {
        self.configure_crc()?;
        self.send_op_comd(0x0000_0000)?;
        self.expect_command(commands::CMD16, BLOCK_SIZE as u32, R1Response::READY_STATE)?;

        Ok(CardClass::LegacyByteAddressed)
    }
}
