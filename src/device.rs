use crate::{
    consts::BLOCK_SIZE, Block, CardClass, DiskioDevice, DiskioError, Error, IoctlCmd, Lba,
    SdMmcSpi, SdMmcSpiConfig, SpiClock, Status, StatusFlag,
};

use defmt::{info, warn};
use embedded_hal::blocking::spi::Transfer;
use switch_hal::OutputSwitch;

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig>
    SdMmcSpi<Spi, Cs, Clock, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    /// Block index of a disk LBA.
    fn disk_block(lba: Lba) -> Result<u32, DiskioError<Error<Spi::Error, Cs::Error>>> {
        u32::try_from(lba).map_err(|_| DiskioError::InvalidArgument)
    }
}

impl<Spi: Transfer<u8>, Cs: OutputSwitch, Clock: SpiClock, Config: SdMmcSpiConfig> DiskioDevice
    for SdMmcSpi<Spi, Cs, Clock, Config>
where
    Spi::Error: core::fmt::Debug,
    Cs::Error: core::fmt::Debug,
{
    type HardwareError = Error<Spi::Error, Cs::Error>;

    fn status(&self) -> Status {
        self.status
    }

    fn reset(&mut self) {
        info!("SD reset invoked");
        self.class = CardClass::Unclassified;
        self.status = StatusFlag::NotInitialized.into();
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>> {
        if !self.status.contains(StatusFlag::NotInitialized) {
            warn!("SD already is initialized");
            return Err(DiskioError::AlreadyInitialized);
        }

        SdMmcSpi::reset(self)
            .map(|_| ())
            .map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        if Self::validate_buffer_len(buf.len()).is_err() {
            return Err(DiskioError::InvalidArgument);
        }
        if self.validate_initialized().is_err() {
            return Err(DiskioError::NotInitialized);
        }

        let block = Self::disk_block(lba)?;

        if Self::get_block_count(buf.len()) == 1 {
            let buf: &mut Block = buf.try_into().map_err(|_| DiskioError::InvalidArgument)?;
            self.read_block(block, buf).map_err(DiskioError::Hardware)
        } else {
            self.read_blocks(block, buf)
                .and_then(|outcome| outcome.into_result())
                .map(|_| ())
                .map_err(DiskioError::Hardware)
        }
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>> {
        if Self::validate_buffer_len(buf.len()).is_err() {
            return Err(DiskioError::InvalidArgument);
        }
        if self.validate_initialized().is_err() {
            return Err(DiskioError::NotInitialized);
        }

        let block = Self::disk_block(lba)?;

        if Self::get_block_count(buf.len()) == 1 {
            let buf: &Block = buf.try_into().map_err(|_| DiskioError::InvalidArgument)?;
            self.write_block(block, buf).map_err(DiskioError::Hardware)
        } else {
            self.write_blocks(block, buf)
                .and_then(|outcome| outcome.into_result())
                .map(|_| ())
                .map_err(DiskioError::Hardware)
        }
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<(), DiskioError<Self::HardwareError>> {
        match cmd {
            IoctlCmd::CtrlSync => self
                .transaction(|s| {
                    s.select()?;
                    s.wait_available_state()
                })
                .map_err(DiskioError::Hardware),
            IoctlCmd::GetBlockSize(block_size) => {
                *block_size = BLOCK_SIZE;
                Ok(())
            }
            _ => Err(DiskioError::NotSupported),
        }
    }
}
