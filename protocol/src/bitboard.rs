use serde::{Deserialize, Serialize};

/// A rectangular block of cells packed as a run-length-encoded bit stream.
///
/// Runs alternate in value starting from *dead*. A block that begins with an
/// alive cell gets a zero-length dead run prefixed so the alternation still
/// holds. Runs are capped at 255; a longer run is split with a zero-length
/// run of the opposite value in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitBoard {
    pub row_length: usize,
    pub num_rows: usize,
    pub bits: RleBits,
}

/// The encoded payload of a [`BitBoard`]: a total bit count plus the runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RleBits {
    pub total_bits: u64,
    pub runs: Vec<u8>,
    #[serde(skip)]
    last_bit: bool,
}

// `last_bit` is encoder scratch, not part of the value.
impl PartialEq for RleBits {
    fn eq(&self, other: &Self) -> bool {
        self.total_bits == other.total_bits && self.runs == other.runs
    }
}

impl Eq for RleBits {}

impl RleBits {
    /// Append one bit, extending the current run or opening a new one.
    fn push(&mut self, bit: bool) {
        if self.runs.is_empty() {
            if bit {
                // A leading alive run needs the zero-length dead prefix.
                self.runs.extend_from_slice(&[0, 1]);
            } else {
                self.runs.push(1);
            }
        } else if bit == self.last_bit {
            if *self.runs.last().unwrap() == 255 {
                // Run is full: a zero-length opposite run keeps alternation.
                self.runs.extend_from_slice(&[0, 1]);
            } else {
                *self.runs.last_mut().unwrap() += 1;
            }
        } else {
            self.runs.push(1);
        }
        self.last_bit = bit;
    }

    /// Expand the runs back into `total_bits` individual bits.
    pub fn decode(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(self.total_bits as usize);
        let mut val = false;
        for &run in &self.runs {
            for _ in 0..run {
                bits.push(val);
            }
            val = !val;
        }
        bits
    }
}

impl BitBoard {
    /// Encode `rows * cols` cells given in row-major order.
    pub fn from_cells(cells: &[bool], rows: usize, cols: usize) -> Self {
        debug_assert_eq!(cells.len(), rows * cols);
        let mut bits = RleBits {
            total_bits: (rows * cols) as u64,
            ..RleBits::default()
        };
        for &cell in cells {
            bits.push(cell);
        }
        BitBoard {
            row_length: cols,
            num_rows: rows,
            bits,
        }
    }

    /// Decode into a flat row-major cell vector of exactly
    /// `num_rows * row_length` entries.
    pub fn to_cells(&self) -> Vec<bool> {
        let mut cells = self.bits.decode();
        // The stored bit count is authoritative for the decoder.
        cells.truncate(self.bits.total_bits as usize);
        debug_assert_eq!(cells.len(), self.num_rows * self.row_length);
        cells
    }
}
