//! Byte level SD card model on a simulated SPI bus.

#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, convert::Infallible, mem, rc::Rc};

use embedded_hal::blocking::spi::Transfer;
use sdcard_spi::{ClockRate, SdMmcSpi, SdMmcSpiConfig, SpiClock, BLOCK_SIZE};
use switch_hal::OutputSwitch;

pub const CSD_V2: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3A, 0x91, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x05,
];
pub const CID: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x12, 0x34, 0x56, 0x78, 0x00, 0xD7, 0x8F,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    V1,
    V2Standard,
    V2High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub index: u8,
    pub arg: u32,
    pub app: bool,
}

enum Mode {
    Command,
    Reading { next: usize },
    ReadDone,
    Writing {
        block: usize,
        multi: bool,
        written: usize,
        buffer: Option<Vec<u8>>,
    },
}

pub struct Card {
    pub kind: Kind,
    pub storage: Vec<u8>,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub selected: bool,
    /// CMD0 frames ignored before the card answers.
    pub silent_cmd0: usize,
    /// ACMD41 polls answered idle before the card is ready, `None` for never.
    pub ready_after: Option<usize>,
    /// Voltage and check pattern echoed by CMD8 instead of the received ones.
    pub if_cond_echo: Option<(u8, u8)>,
    /// Index of the written block (in a command) rejected with a write error.
    pub write_error_at: Option<usize>,
    /// Index of the written block (in a command) after which the card stays
    /// busy until the stop token.
    pub busy_after_block: Option<usize>,
    /// Command index answered with this R1 instead.
    pub reject: Option<(u8, u8)>,
    /// Single block reads are accepted but no data token follows.
    pub withhold_data: bool,
    pub log: Vec<Command>,
    pub stop_tokens: usize,
    pub rates: Vec<ClockRate>,
    idle: bool,
    busy: bool,
    app: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    mode: Mode,
}

impl Card {
    pub fn new(kind: Kind, blocks: usize) -> Self {
        Card {
            kind,
            storage: vec![0; blocks * BLOCK_SIZE],
            csd: CSD_V2,
            cid: CID,
            selected: false,
            silent_cmd0: 0,
            ready_after: Some(1),
            if_cond_echo: None,
            write_error_at: None,
            busy_after_block: None,
            reject: None,
            withhold_data: false,
            log: Vec::new(),
            stop_tokens: 0,
            rates: Vec::new(),
            idle: false,
            busy: false,
            app: false,
            frame: Vec::new(),
            out: VecDeque::new(),
            mode: Mode::Command,
        }
    }

    pub fn block(&self, index: usize) -> &[u8] {
        &self.storage[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE]
    }

    pub fn fill_block(&mut self, index: usize, value: u8) {
        self.storage[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE].fill(value);
    }

    pub fn commands(&self, index: u8) -> Vec<Command> {
        self.log
            .iter()
            .filter(|command| command.index == index)
            .copied()
            .collect()
    }

    pub fn indices(&self) -> Vec<u8> {
        self.log.iter().map(|command| command.index).collect()
    }

    fn blocks(&self) -> usize {
        self.storage.len() / BLOCK_SIZE
    }

    fn select(&mut self, selected: bool) {
        self.selected = selected;
        self.frame.clear();
        self.out.clear();
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            return 0xFF;
        }

        if let Mode::Reading { next } = self.mode {
            if self.out.is_empty() && self.frame.is_empty() {
                self.stream_block(next);
            }
        }

        let idle_line = if self.busy { 0x00 } else { 0xFF };
        let miso = self.out.pop_front().unwrap_or(idle_line);
        self.consume(mosi);
        miso
    }

    fn stream_block(&mut self, next: usize) {
        if next < self.blocks() {
            self.out.extend([0xFF, 0xFE]);
            self.out.extend(self.block(next).to_vec());
            self.out.extend([0x00, 0x00]);
            self.mode = Mode::Reading { next: next + 1 };
        } else {
            // Out of range error token.
            self.out.extend([0xFF, 0x08]);
            self.mode = Mode::ReadDone;
        }
    }

    fn consume(&mut self, mosi: u8) {
        match &mut self.mode {
            Mode::Writing {
                buffer: Some(buffer),
                ..
            } => {
                buffer.push(mosi);
                if buffer.len() == BLOCK_SIZE + 2 {
                    self.finish_block();
                }
                return;
            }
            Mode::Writing {
                buffer: buffer @ None,
                multi,
                ..
            } => {
                match (mosi, *multi) {
                    (0xFE, false) | (0xFC, true) => *buffer = Some(Vec::new()),
                    (0xFD, true) => {
                        self.stop_tokens += 1;
                        self.busy = false;
                        self.mode = Mode::Command;
                        self.out.extend([0x00, 0x00]);
                    }
                    _ => {}
                }
                return;
            }
            _ => {}
        }

        if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }

        self.frame.push(mosi);

        if self.frame.len() == 6 {
            let frame = mem::take(&mut self.frame);
            self.execute(&frame);
        }
    }

    fn finish_block(&mut self) {
        let Mode::Writing {
            block,
            multi,
            written,
            buffer: Some(data),
        } = mem::replace(&mut self.mode, Mode::Command)
        else {
            unreachable!("not receiving a block");
        };

        let accepted = self.write_error_at != Some(written) && block < self.blocks();

        if accepted {
            self.storage[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE]
                .copy_from_slice(&data[..BLOCK_SIZE]);
            self.out.extend([0xE5, 0x00, 0x00]);
        } else {
            self.out.extend([0xED]);
        }

        if self.busy_after_block == Some(written) {
            self.busy = true;
        }

        if multi {
            self.mode = Mode::Writing {
                block: if accepted { block + 1 } else { block },
                multi,
                written: written + 1,
                buffer: None,
            };
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.out.clear();
        self.out.push_back(0xFF);
        self.out.extend(bytes);
    }

    fn respond_data(&mut self, r1: u8, data: &[u8]) {
        self.respond(&[r1, 0xFF, 0xFE]);
        self.out.extend(data);
        self.out.extend([0x00, 0x00]);
    }

    fn address(&self, arg: u32) -> Option<usize> {
        match self.kind {
            Kind::V2High => Some(arg as usize),
            Kind::V1 | Kind::V2Standard if arg as usize % BLOCK_SIZE == 0 => {
                Some(arg as usize / BLOCK_SIZE)
            }
            _ => None,
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = mem::take(&mut self.app);
        self.log.push(Command { index, arg, app });

        let idle = u8::from(self.idle);
        let crc_ok = match (index, arg) {
            (0, 0) => frame[5] == 0x95,
            (8, 0x1AA) => frame[5] == 0x87,
            _ => true,
        };

        if !crc_ok {
            self.respond(&[idle | 0x08]);
            return;
        }

        if let Some((_, r1)) = self.reject.filter(|&(rejected, _)| rejected == index) {
            self.respond(&[r1]);
            return;
        }

        match (index, app) {
            (0, _) => {
                if self.silent_cmd0 > 0 {
                    self.silent_cmd0 -= 1;
                    return;
                }
                self.idle = true;
                self.busy = false;
                self.mode = Mode::Command;
                self.respond(&[0x01]);
            }
            (8, _) => match self.kind {
                Kind::V1 => self.respond(&[idle | 0x04]),
                Kind::V2Standard | Kind::V2High => {
                    let [_, _, voltage, pattern] = arg.to_be_bytes();
                    let (voltage, pattern) =
                        self.if_cond_echo.unwrap_or((voltage & 0x0F, pattern));
                    self.respond(&[idle, 0x00, 0x00, voltage, pattern]);
                }
            },
            (59, _) => self.respond(&[idle]),
            (55, _) => {
                self.app = true;
                self.respond(&[idle]);
            }
            (41, true) => {
                match &mut self.ready_after {
                    Some(0) => self.idle = false,
                    Some(polls) => *polls -= 1,
                    None => {}
                }
                self.respond(&[u8::from(self.idle)]);
            }
            (58, _) => {
                let mut ocr: u32 = 0x00FF_8000;
                if !self.idle {
                    ocr |= 1 << 31;
                    if self.kind == Kind::V2High {
                        ocr |= 1 << 30;
                    }
                }
                let [a, b, c, d] = ocr.to_be_bytes();
                self.respond(&[idle, a, b, c, d]);
            }
            (16, _) => self.respond(&[if arg == 512 { idle } else { idle | 0x40 }]),
            (9, _) => {
                let csd = self.csd;
                self.respond_data(idle, &csd);
            }
            (10, _) => {
                let cid = self.cid;
                self.respond_data(idle, &cid);
            }
            (13, _) => self.respond(&[idle, 0x00]),
            (17, _) => match self.address(arg).filter(|&block| block < self.blocks()) {
                Some(_) if self.withhold_data => self.respond(&[idle]),
                Some(block) => {
                    let data = self.block(block).to_vec();
                    self.respond_data(idle, &data);
                }
                None => self.respond(&[idle | 0x20]),
            },
            (18, _) => match self.address(arg).filter(|&block| block <= self.blocks()) {
                Some(block) => {
                    self.respond(&[idle]);
                    self.mode = Mode::Reading { next: block };
                }
                None => self.respond(&[idle | 0x20]),
            },
            (12, _) => {
                self.out.clear();
                self.out.extend([0xFF, 0xFF, 0x00]);
                self.mode = Mode::Command;
            }
            (24, _) | (25, _) => match self.address(arg) {
                Some(block) => {
                    self.respond(&[idle]);
                    self.mode = Mode::Writing {
                        block,
                        multi: index == 25,
                        written: 0,
                        buffer: None,
                    };
                }
                None => self.respond(&[idle | 0x20]),
            },
            (23, true) => self.respond(&[idle]),
            _ => self.respond(&[idle | 0x04]),
        }
    }
}

pub struct Spi(pub Rc<RefCell<Card>>);

impl Transfer<u8> for Spi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

pub struct Cs(pub Rc<RefCell<Card>>);

impl OutputSwitch for Cs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(true);
        Ok(())
    }

    fn off(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(false);
        Ok(())
    }
}

pub struct Clock(pub Rc<RefCell<Card>>);

impl SpiClock for Clock {
    type Error = Infallible;

    fn set_rate(&mut self, rate: ClockRate) -> Result<(), Self::Error> {
        self.0.borrow_mut().rates.push(rate);
        Ok(())
    }
}

pub struct FastConfig;

impl SdMmcSpiConfig for FastConfig {
    const CMD_MAX_ATTEMPTS: usize = 16;
    const READ_R1_ATTEMPTS: usize = 8;
    const ENTER_SPI_MODE_ATTEMPTS: usize = 4;
    const INIT_ATTEMPTS: usize = 16;
    const READ_TOKEN_ATTEMPTS: usize = 16;
    const DELAY_DUMMY_CYCLES: usize = 0;
    const DATA_CRC: bool = false;
}

pub type Sd = SdMmcSpi<Spi, Cs, Clock, FastConfig>;

pub fn bus(card: Card) -> (Rc<RefCell<Card>>, Sd) {
    let card = Rc::new(RefCell::new(card));
    let sd = SdMmcSpi::new(
        Spi(card.clone()),
        Cs(card.clone()),
        Clock(card.clone()),
    );
    (card, sd)
}

/// Card already negotiated by the driver.
pub fn ready(kind: Kind, blocks: usize) -> (Rc<RefCell<Card>>, Sd) {
    let (card, mut sd) = bus(Card::new(kind, blocks));
    sd.reset().expect("card negotiation");
    card.borrow_mut().log.clear();
    (card, sd)
}
