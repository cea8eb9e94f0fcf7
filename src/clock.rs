use defmt::Format;

/// SPI clock rate requested by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum ClockRate {
    /// Card identification rate, 100-400 kHz.
    Negotiation,
    /// Data transfer rate.
    Operating,
}

/// Represents control over the SPI clock.
///
/// Card negotiation must run slowly; the rate is raised once the card is ready.
pub trait SpiClock {
    /// Error of a clock change.
    type Error: core::fmt::Debug;

    /// Switch the bus to `rate`.
    fn set_rate(&mut self, rate: ClockRate) -> Result<(), Self::Error>;
}

/// Bus with a fixed clock.
impl SpiClock for () {
    type Error = core::convert::Infallible;

    fn set_rate(&mut self, _rate: ClockRate) -> Result<(), Self::Error> {
        Ok(())
    }
}
