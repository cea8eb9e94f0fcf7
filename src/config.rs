/// Represents config for [`SdMmcSpi`](crate::SdMmcSpi).
pub trait SdMmcSpiConfig {
    /// Max attempts to wait for the card to release the bus.
    const CMD_MAX_ATTEMPTS: usize;
    /// Max attempts to read R1.
    const READ_R1_ATTEMPTS: usize;
    /// Max attempts to enter SPI mode.
    const ENTER_SPI_MODE_ATTEMPTS: usize;
    /// Max attempts to poll the card out of its initialization process.
    const INIT_ATTEMPTS: usize;
    /// Max attempts to wait for a data token.
    const READ_TOKEN_ATTEMPTS: usize;
    /// Count of dummy cycles for delay.
    const DELAY_DUMMY_CYCLES: usize;
    /// Enable CRC checking on the card and verify CRC-16 of data blocks.
    const DATA_CRC: bool;
}

/// Default implementation of [`SdMmcSpiConfig`](crate::SdMmcSpiConfig).
pub struct DefaultSdMmcSpiConfig;

impl SdMmcSpiConfig for DefaultSdMmcSpiConfig {
    const CMD_MAX_ATTEMPTS: usize = 256;
    const READ_R1_ATTEMPTS: usize = 8;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 10;
    const INIT_ATTEMPTS: usize = 1024;
    const READ_TOKEN_ATTEMPTS: usize = 4096;
    const DELAY_DUMMY_CYCLES: usize = 32;
    const DATA_CRC: bool = false;
}
