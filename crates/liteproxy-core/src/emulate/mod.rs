//! Seam to the TVM get-method emulator.
//!
//! Emulation is a deterministic pure function of its inputs: contract code
//! and data, the caller-supplied stack (an opaque BOC the proxy never
//! interprets), balance, resolved libraries, the governance config of the
//! master block the state was read at, and wall-clock time. Implementations
//! are expected to terminate within the gas limit.

use ahash::HashSet;
use everscale_types::cell::{Cell, CellType, DynCell, HashBytes};
use everscale_types::dict::Dict;
use everscale_types::models::{BlockchainConfigParams, StdAddr};

#[derive(Debug, thiserror::Error)]
pub enum EmulateError {
    #[error("vm failure: {0}")]
    Vm(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct RunMethodParams {
    pub code: Cell,
    pub data: Cell,
    pub address: StdAddr,
    /// Serialized input stack, passed through untouched.
    pub stack: Vec<u8>,
    pub balance: u128,
    pub libraries: Dict<HashBytes, Cell>,
    pub config: BlockchainConfigParams,
    pub now: u32,
}

#[derive(Debug, Clone)]
pub struct RunMethodOutput {
    pub exit_code: i32,
    /// Serialized result stack.
    pub stack: Vec<u8>,
}

pub trait MethodEmulator: Send + Sync + 'static {
    fn run_get_method(
        &self,
        method_id: i32,
        params: RunMethodParams,
        gas_limit: u64,
    ) -> Result<RunMethodOutput, EmulateError>;
}

/// Collects the library hashes a code cell depends on.
///
/// Library cells carry an 8-bit type tag followed by the 256-bit hash of
/// the referenced library; ordinary cells contribute their references
/// recursively and their data is ignored. Duplicates are collapsed.
pub fn find_libs(code: &DynCell) -> Vec<HashBytes> {
    let mut found = Vec::new();
    let mut seen = HashSet::default();
    walk_libs(code, &mut found, &mut seen);
    found
}

fn walk_libs(cell: &DynCell, found: &mut Vec<HashBytes>, seen: &mut HashSet<HashBytes>) {
    if cell.reference_count() == 0 && cell.cell_type() == CellType::LibraryReference {
        let data = cell.data();
        if data.len() >= 33 {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[1..33]);
            let hash = HashBytes(hash);
            if seen.insert(hash) {
                found.push(hash);
            }
        }
        return;
    }
    for child in cell.references() {
        walk_libs(child, found, seen);
    }
}
