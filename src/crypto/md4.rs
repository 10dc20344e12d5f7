//! MD4 hash (RFC 1320).
//!
//! Only MS-CHAPv2 needs it: the NT password hash is MD4 over the UTF-16LE
//! password. Three rounds of 16 steps over little-endian message words.

/// MD4 block size in bytes.
const BLOCK_SIZE: usize = 64;

/// MD4 digest length in bytes.
pub const DIGEST_LEN: usize = 16;

const H0: [u32; 4] = [0x67452301, 0xEFCDAB89, 0x98BADCFE, 0x10325476];

/// Round 2 and 3 additive constants.
const K2: u32 = 0x5A827999;
const K3: u32 = 0x6ED9EBA1;

const R1_SHIFTS: [u32; 4] = [3, 7, 11, 19];
const R2_SHIFTS: [u32; 4] = [3, 5, 9, 13];
const R3_SHIFTS: [u32; 4] = [3, 9, 11, 15];
const R3_ORDER: [usize; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

/// MD4 hasher.
#[derive(Clone)]
pub struct Md4 {
    state: [u32; 4],
    buffer: [u8; BLOCK_SIZE],
    buffer_len: usize,
    total_len: u64,
}

impl Md4 {
    pub fn new() -> Self {
        Self {
            state: H0,
            buffer: [0u8; BLOCK_SIZE],
            buffer_len: 0,
            total_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total_len += data.len() as u64;

        if self.buffer_len > 0 {
            let space = BLOCK_SIZE - self.buffer_len;
            let to_copy = data.len().min(space);
            self.buffer[self.buffer_len..self.buffer_len + to_copy]
                .copy_from_slice(&data[..to_copy]);
            self.buffer_len += to_copy;
            data = &data[to_copy..];

            if self.buffer_len == BLOCK_SIZE {
                let block = self.buffer;
                self.process_block(&block);
                self.buffer_len = 0;
            }
        }

        while data.len() >= BLOCK_SIZE {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&data[..BLOCK_SIZE]);
            self.process_block(&block);
            data = &data[BLOCK_SIZE..];
        }

        if !data.is_empty() {
            self.buffer[..data.len()].copy_from_slice(data);
            self.buffer_len = data.len();
        }
    }

    pub fn finalize(mut self) -> [u8; DIGEST_LEN] {
        let total_bits = self.total_len.wrapping_mul(8);

        self.buffer[self.buffer_len] = 0x80;
        self.buffer_len += 1;

        if self.buffer_len > 56 {
            self.buffer[self.buffer_len..].fill(0);
            let block = self.buffer;
            self.process_block(&block);
            self.buffer_len = 0;
        }

        self.buffer[self.buffer_len..56].fill(0);
        // Length in bits, little-endian (SHA uses big-endian here).
        self.buffer[56..64].copy_from_slice(&total_bits.to_le_bytes());
        let block = self.buffer;
        self.process_block(&block);

        let mut digest = [0u8; DIGEST_LEN];
        for (i, h) in self.state.iter().enumerate() {
            digest[i * 4..(i + 1) * 4].copy_from_slice(&h.to_le_bytes());
        }
        digest
    }

    fn process_block(&mut self, block: &[u8; BLOCK_SIZE]) {
        let mut x = [0u32; 16];
        for (i, word) in x.iter_mut().enumerate() {
            let b = &block[i * 4..(i + 1) * 4];
            *word = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }

        let [mut a, mut b, mut c, mut d] = self.state;

        // Round 1: F(x,y,z) = (x & y) | (!x & z)
        for i in 0..16 {
            let f = (b & c) | (!b & d);
            let t = a
                .wrapping_add(f)
                .wrapping_add(x[i])
                .rotate_left(R1_SHIFTS[i % 4]);
            (a, b, c, d) = (d, t, b, c);
        }

        // Round 2: G(x,y,z) = majority, words taken column-wise
        for i in 0..16 {
            let k = (i % 4) * 4 + i / 4;
            let g = (b & c) | (b & d) | (c & d);
            let t = a
                .wrapping_add(g)
                .wrapping_add(x[k])
                .wrapping_add(K2)
                .rotate_left(R2_SHIFTS[i % 4]);
            (a, b, c, d) = (d, t, b, c);
        }

        // Round 3: H(x,y,z) = x ^ y ^ z
        for i in 0..16 {
            let h = b ^ c ^ d;
            let t = a
                .wrapping_add(h)
                .wrapping_add(x[R3_ORDER[i]])
                .wrapping_add(K3)
                .rotate_left(R3_SHIFTS[i % 4]);
            (a, b, c, d) = (d, t, b, c);
        }

        self.state[0] = self.state[0].wrapping_add(a);
        self.state[1] = self.state[1].wrapping_add(b);
        self.state[2] = self.state[2].wrapping_add(c);
        self.state[3] = self.state[3].wrapping_add(d);
    }

    /// Hash data in one call.
    pub fn hash(data: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for Md4 {
    fn default() -> Self {
        Self::new()
    }
}
