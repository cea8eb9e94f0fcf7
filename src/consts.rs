/// Size of a data block in bytes.
pub const BLOCK_SIZE: usize = 512;
/// Size of a data block in bytes, as `u64`.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Command indices.
///
/// The index is OR-ed with [`CMD_BASE`](commands::CMD_BASE) when framed.
/// Indices carrying [`ACMD_FLAG`](commands::ACMD_FLAG) are sent after `CMD55`.
pub mod commands {
    /// Start and transmission bits of the first frame byte.
    pub const CMD_BASE: u8 = 0x40;
    /// ACMD flag.
    pub const ACMD_FLAG: u8 = 0x80;
    /// Mask of the 6-bit command index.
    pub const INDEX_MASK: u8 = 0x3F;
    /// GO_IDLE_STATE - init card in spi mode if CS low.
    pub const CMD0: u8 = 0;
    /// SEND_IF_COND - verify SD Memory Card interface operating condition.
    pub const CMD8: u8 = 8;
    /// SEND_CSD - read the Card Specific Data (CSD register).
    pub const CMD9: u8 = 9;
    /// SEND_CID - read the Card Identification (CID register).
    pub const CMD10: u8 = 10;
    /// STOP_TRANSMISSION - end multiple block read sequence.
    pub const CMD12: u8 = 12;
    /// SEND_STATUS - read the card status register.
    pub const CMD13: u8 = 13;
    /// SET_BLOCKLEN - set the block length of a byte addressed card.
    pub const CMD16: u8 = 16;
    /// READ_SINGLE_BLOCK - read a single data block from the card.
    pub const CMD17: u8 = 17;
    /// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card.
    pub const CMD18: u8 = 18;
    /// WRITE_BLOCK - write a single data block to the card.
    pub const CMD24: u8 = 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION.
    pub const CMD25: u8 = 25;
    /// APP_CMD - escape for application specific command.
    pub const CMD55: u8 = 55;
    /// READ_OCR - read the OCR register of a card.
    pub const CMD58: u8 = 58;
    /// CRC_ON_OFF - enable or disable CRC checking.
    pub const CMD59: u8 = 59;
    /// SET_WR_BLK_ERASE_COUNT - number of blocks to pre-erase before a
    /// multiple block write.
    pub const ACMD23: u8 = ACMD_FLAG | 23;
    /// SD_SEND_OP_COMD - Sends host capacity support information and activates
    /// the card's initialization process.
    pub const ACMD41: u8 = ACMD_FLAG | 41;
}

/// Data tokens.
pub mod tokens {
    /// Bus released by the card.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start data token for read or write single block.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Stop token for write multiple blocks.
    pub const STOP_TRAN: u8 = 0xFD;
    /// Start data token for write multiple blocks.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Mask for data response tokens after a write block operation.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Write data accepted token.
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Write data rejected due to a CRC error.
    pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
    /// Write data rejected due to a write error.
    pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;
}

/// Command arguments.
pub mod args {
    /// Accepted voltage range 2.7-3.6V.
    pub const IF_COND_VOLTAGE: u8 = 0x01;
    /// Check pattern echoed back by SEND_IF_COND.
    pub const IF_COND_CHECK_PATTERN: u8 = 0xAA;
    /// SEND_IF_COND argument.
    pub const IF_COND: u32 = ((IF_COND_VOLTAGE as u32) << 8) | IF_COND_CHECK_PATTERN as u32;
    /// Host capacity support bit of SD_SEND_OP_COMD.
    pub const HCS: u32 = 1 << 30;
}
