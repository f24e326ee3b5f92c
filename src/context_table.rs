use super::cabac_contexts::*;
use super::common::*;
use super::slice_header::SliceType;
use debug_print::*;
use std::ops::{Index, IndexMut};

/// Probability state of one context: `state` is pStateIdx (0..=63), `mps` is
/// valMPS.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ContextState {
    pub state: u8,
    pub mps: bool,
}

impl ContextState {
    pub fn from_init_value(m: i8, n: i8, slice_qp: isize) -> ContextState {
        let qp = clip(slice_qp, 0, 51);
        let pre = clip(((m as isize * qp) >> 4) + n as isize, 1, 126);
        if pre <= 63 {
            ContextState {
                state: (63 - pre) as u8,
                mps: false,
            }
        } else {
            ContextState {
                state: (pre - 64) as u8,
                mps: true,
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContextTable {
    states: Vec<ContextState>,
    initialized: bool,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        ContextTable {
            states: vec![ContextState::default(); NUM_CTX],
            initialized: false,
        }
    }

    pub fn init_models(&mut self, slice_type: SliceType, cabac_init_idc: usize, slice_qp: isize) {
        let table_idx = if slice_type.is_intra() {
            0
        } else {
            assert!(cabac_init_idc <= 2, "invalid cabac_init_idc {cabac_init_idc}");
            cabac_init_idc + 1
        };
        debug_eprintln!(
            "init_models slice_type={:?}, cabac_init_idc={}, slice_qp={}",
            slice_type,
            cabac_init_idc,
            slice_qp
        );
        for (state, &[m, n]) in self.states.iter_mut().zip(cabac_init_table[table_idx].iter()) {
            *state = ContextState::from_init_value(m, n, slice_qp);
        }
        self.initialized = true;
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

impl Index<usize> for ContextTable {
    type Output = ContextState;

    fn index(&self, ctx_idx: usize) -> &Self::Output {
        assert!(self.initialized, "context table used before init_models");
        assert!(ctx_idx < NUM_CTX, "context index {ctx_idx} out of range");
        &self.states[ctx_idx]
    }
}

impl IndexMut<usize> for ContextTable {
    fn index_mut(&mut self, ctx_idx: usize) -> &mut Self::Output {
        assert!(self.initialized, "context table used before init_models");
        assert!(ctx_idx < NUM_CTX, "context index {ctx_idx} out of range");
        &mut self.states[ctx_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::StdRng, Rng, SeedableRng};

    #[test]
    fn init_models_is_deterministic() {
        let mut rng: StdRng = SeedableRng::seed_from_u64(2);
        for _ in 0..20 {
            let slice_type = [SliceType::I, SliceType::P, SliceType::B][rng.gen_range(0..3)];
            let idc = rng.gen_range(0..3);
            let qp = rng.gen_range(0..52);
            let mut t0 = ContextTable::new();
            let mut t1 = ContextTable::new();
            t0.init_models(slice_type, idc, qp);
            t1.init_models(slice_type, idc, qp);
            assert_eq!(t0, t1);
            // re-initialization discards adapted state
            t1[rng.gen_range(0..NUM_CTX)].state = 17;
            t1.init_models(slice_type, idc, qp);
            assert_eq!(t0, t1);
        }
    }

    #[test]
    fn init_value_mapping_works() {
        // mb_qp_delta first bin: m=0, n=41 at any qp
        let s = ContextState::from_init_value(0, 41, 26);
        assert_eq!(s, ContextState { state: 22, mps: false });
        // pre clipped to 126
        let s = ContextState::from_init_value(0, 127, 26);
        assert_eq!(s, ContextState { state: 62, mps: true });
        // pre clipped to 1
        let s = ContextState::from_init_value(-50, 0, 51);
        assert_eq!(s, ContextState { state: 62, mps: false });
        // qp clipped into 0..=51
        assert_eq!(
            ContextState::from_init_value(20, -15, 70),
            ContextState::from_init_value(20, -15, 51)
        );
        // pre = 64 is the first mps=1 state
        assert_eq!(
            ContextState::from_init_value(0, 64, 30),
            ContextState { state: 0, mps: true }
        );
    }

    #[test]
    fn intra_slice_ignores_init_idc() {
        let mut t0 = ContextTable::new();
        let mut t1 = ContextTable::new();
        t0.init_models(SliceType::I, 0, 30);
        t1.init_models(SliceType::SI, 2, 30);
        assert_eq!(t0, t1);
        for ctx in 0..t0.len() {
            assert!(t0[ctx].state <= 62);
        }
    }

    #[test]
    #[should_panic]
    fn uninitialized_table_panics() {
        let t = ContextTable::new();
        let _ = t[3];
    }

    #[test]
    #[should_panic]
    fn out_of_range_context_panics() {
        let mut t = ContextTable::new();
        t.init_models(SliceType::P, 1, 26);
        let _ = t[NUM_CTX];
    }
}
