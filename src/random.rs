use parking_lot::Mutex;
use rand::RngCore;

const POOL_SIZE: usize = 64;

/// Process-wide buffered randomness.
///
/// Small draws are served from a refilled buffer under the pool's own lock,
/// so hot paths (query IDs, tie-breaks) do not hit the OS generator each
/// time. Oversized requests bypass the buffer.
pub struct RandomPool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    buf: [u8; POOL_SIZE],
    // consumed up to this index; POOL_SIZE means empty
    begin: usize,
}

impl RandomPool {
    pub fn new() -> Self {
        RandomPool {
            inner: Mutex::new(PoolState {
                buf: [0; POOL_SIZE],
                begin: POOL_SIZE,
            }),
        }
    }

    /// Fill `dst` with random bytes.
    pub fn fill(&self, dst: &mut [u8]) {
        if dst.len() > POOL_SIZE {
            rand::rng().fill_bytes(dst);
            return;
        }
        let mut state = self.inner.lock();
        let take = dst.len().min(POOL_SIZE - state.begin);
        let begin = state.begin;
        dst[..take].copy_from_slice(&state.buf[begin..begin + take]);
        if take == dst.len() {
            state.begin += take;
            return;
        }
        rand::rng().fill_bytes(&mut state.buf);
        let rest = dst.len() - take;
        dst[take..].copy_from_slice(&state.buf[..rest]);
        state.begin = rest;
    }

    pub fn random_u16(&self) -> u16 {
        let mut buf = [0u8; 2];
        self.fill(&mut buf);
        u16::from_be_bytes(buf)
    }

    /// Uniform index into `0..bound`; `bound` must be non-zero.
    pub fn pick(&self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_be_bytes(buf) as usize % bound
    }
}

impl Default for RandomPool {
    fn default() -> Self {
        Self::new()
    }
}
