use bitfield::bitfield;

/// Card Identification block.
pub type CidData = [u8; 16];

bitfield! {
    /// Card Identification register.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Cid(u128);
    impl Debug;
    pub u8, manufacturer_id, _: 127, 120;
    pub u16, oem_id, _: 119, 104;
    u64, product_name_raw, _: 103, 64;
    pub u8, product_revision, _: 63, 56;
    pub u32, serial_number, _: 55, 24;
    u16, manufacturing_date, _: 19, 8;
    pub u8, crc, _: 7, 1;
}

impl Cid {
    /// Five ASCII characters of the product name.
    pub fn product_name(&self) -> [u8; 5] {
        let raw = self.product_name_raw().to_be_bytes();
        [raw[3], raw[4], raw[5], raw[6], raw[7]]
    }

    /// Major and minor product revision.
    pub fn revision(&self) -> (u8, u8) {
        (self.product_revision() >> 4, self.product_revision() & 0x0F)
    }

    /// Year of manufacture.
    pub fn manufacturing_year(&self) -> u16 {
        2000 + (self.manufacturing_date() >> 4)
    }

    /// Month of manufacture, 1 to 12.
    pub fn manufacturing_month(&self) -> u8 {
        (self.manufacturing_date() & 0x0F) as u8
    }
}

impl From<CidData> for Cid {
    fn from(cid_data: CidData) -> Self {
        Cid(u128::from_be_bytes(cid_data))
    }
}
