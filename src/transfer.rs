use crate::{
    cid::{Cid, CidData},
    consts::{
        commands,
        tokens::{DATA_START_BLOCK, STOP_TRAN, WRITE_MULTIPLE},
        BLOCK_SIZE,
    },
    csd::{CapacityProvider, Csd, CsdData},
    response::{CardStatus, R1Response},
    Block, Error, ErrorFor, SdMmcSpi, SdMmcSpiConfig, SpiClock, StreamOutcome,
};

use defmt::{debug, warn};
use embedded_hal::blocking::spi::Transfer;
use size::Size;
use switch_hal::OutputSwitch;

/// Outcome of a multiple block transfer on this driver.
pub type StreamOutcomeFor<T> = StreamOutcome<ErrorFor<T>>;

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig>
    SdMmcSpi<Spi, Cs, Clock, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Read a register delivered as a data block.
    fn read_register(&self, cmd: u8, data: &mut [u8]) -> Result<(), ErrorFor<Self>> {
        self.validate_initialized()?;

        self.transaction(|s| {
            s.expect_command(cmd, 0x0000_0000, R1Response::READY_STATE)?;
            s.read_data(data)
        })
    }

    /// Read the Card Identification register.
    pub fn read_cid(&self) -> Result<Cid, ErrorFor<Self>> {
        let mut cid_data: CidData = Default::default();

        self.read_register(commands::CMD10, &mut cid_data)?;

        Ok(Cid::from(cid_data))
    }

    /// Read the Card Specific Data register.
    pub fn read_csd(&self) -> Result<Csd, ErrorFor<Self>> {
        let mut csd_data: CsdData = Default::default();

        self.read_register(commands::CMD9, &mut csd_data)?;

        Csd::parse(&csd_data).map_err(Error::Csd)
    }

    /// Read the card status register.
    pub fn read_status(&self) -> Result<CardStatus, ErrorFor<Self>> {
        self.validate_initialized()?;

        self.transaction(|s| {
            s.expect_command(commands::CMD13, 0x0000_0000, R1Response::READY_STATE)?;
            let status = s.receive()?;

            Ok(CardStatus::new(R1Response::READY_STATE, status))
        })
    }

    /// Card capacity.
    pub fn card_capacity(&self) -> Result<Size, ErrorFor<Self>> {
        self.read_csd().map(|csd| csd.card_capacity())
    }

    /// Card capacity in blocks.
    pub fn card_capacity_blocks(&self) -> Result<u64, ErrorFor<Self>> {
        self.read_csd().map(|csd| csd.card_capacity_blocks())
    }

    /// Read one block.
    pub fn read_block(&self, block: u32, buf: &mut Block) -> Result<(), ErrorFor<Self>> {
        let address = self.convert_lba(block)?;

        debug!("SD read block {}", block);

        self.transaction(|s| {
            s.expect_command(commands::CMD17, address, R1Response::READY_STATE)?;
            s.read_data(buf)
        })
    }

    /// Read consecutive blocks starting at `start` into `buf`.
    ///
    /// The stream is stopped at the first block that can't be received;
    /// STOP_TRANSMISSION is sent in any case once the stream started. A
    /// failing stop is reported as the cause when no block failed before.
    pub fn read_blocks(
        &self,
        start: u32,
        buf: &mut [u8],
    ) -> Result<StreamOutcomeFor<Self>, ErrorFor<Self>> {
        Self::validate_buffer_len(buf.len())?;
        let address = self.convert_lba(start)?;

        debug!(
            "SD read {} blocks from {}",
            Self::get_block_count(buf.len()),
            start
        );

        self.transaction(|s| {
            s.expect_command(commands::CMD18, address, R1Response::READY_STATE)?;

            let mut blocks = 0;
            let mut cause = None;

            for chunk in buf.chunks_mut(BLOCK_SIZE) {
                if let Err(err) = s.read_data(chunk) {
                    warn!(
                        "SD read stream stopped after {} blocks: {}",
                        blocks,
                        defmt::Debug2Format(&err)
                    );
                    cause = Some(err);
                    break;
                }
                blocks += 1;
            }

            let stopped = s.stop_transmission();

            Ok(StreamOutcome::new(blocks, cause.or(stopped.err())))
        })
    }

    /// Send STOP_TRANSMISSION, flags of its response don't matter.
    fn stop_transmission(&self) -> Result<(), ErrorFor<Self>> {
        let r1 = self.send_command(commands::CMD12, 0x0000_0000)?;

        if r1 != R1Response::READY_STATE {
            warn!("Response of CMD{}: 0x{:02X}", commands::CMD12, r1.bits());
        }

        Ok(())
    }

    /// Write one block.
    pub fn write_block(&self, block: u32, buf: &Block) -> Result<(), ErrorFor<Self>> {
        let address = self.convert_lba(block)?;

        debug!("SD write block {}", block);

        self.transaction(|s| {
            s.expect_command(commands::CMD24, address, R1Response::READY_STATE)?;
            s.wait_available_state()?;
            s.write_data(DATA_START_BLOCK, buf)
        })
    }

    /// Write consecutive blocks starting at `start` from `buf`.
    ///
    /// The card is told how many blocks to pre-erase. The stream is stopped
    /// at the first block the card doesn't accept; the stop token is sent in
    /// any case once the stream started.
    pub fn write_blocks(
        &self,
        start: u32,
        buf: &[u8],
    ) -> Result<StreamOutcomeFor<Self>, ErrorFor<Self>> {
        Self::validate_buffer_len(buf.len())?;
        let address = self.convert_lba(start)?;
        let block_count = Self::get_block_count(buf.len());

        debug!("SD write {} blocks from {}", block_count, start);

        self.transaction(|s| {
            // Must precede WRITE_MULTIPLE_BLOCK, the card takes anything
            // after it as the data stream.
            s.expect_command(
                commands::ACMD23,
                block_count as u32,
                R1Response::READY_STATE,
            )?;
            s.expect_command(commands::CMD25, address, R1Response::READY_STATE)?;

            let mut blocks = 0;
            let mut cause = None;

            for chunk in buf.chunks(BLOCK_SIZE) {
                let written = s
                    .wait_available_state()
                    .and_then(|_| s.write_data(WRITE_MULTIPLE, chunk));

                if let Err(err) = written {
                    warn!(
                        "SD write stream stopped after {} blocks: {}",
                        blocks,
                        defmt::Debug2Format(&err)
                    );
                    cause = Some(err);
                    break;
                }
                blocks += 1;
            }

            // The stop token goes out even if the card is still busy.
            let available = s.wait_available_state();
            let stopped = s.send(STOP_TRAN);

            Ok(StreamOutcome::new(
                blocks,
                cause.or(available.err()).or(stopped.err()),
            ))
        })
    }
}
