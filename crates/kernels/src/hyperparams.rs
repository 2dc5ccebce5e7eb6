//! Hyper-parameter points.
//!
//! A point is a triple of per-role value vectors. Roles A and B share the
//! "chiral" parameter set (micro-tile, padding, load flags, workspace mode);
//! role C carries the parameters that describe the work-group as a whole.
//!
//! String form, roles separated by a double underscore:
//!
//! ```text
//! A_MIC1_PAD0_PLU0_LIW0_MIW0_WOS0__B_MIC1_PAD2_PLU1_LIW1_MIW1_WOS0__C_UNR16_GAL2_PUN0_ICE1_NAW16_UFO0_MAC1_SKW10
//! ```

use crate::config::split_token;
use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operand role owning a parameter vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    A,
    B,
    C,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::A, Role::B, Role::C];

    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> &'static str {
        match self {
            Role::A => "A",
            Role::B => "B",
            Role::C => "C",
        }
    }

    pub fn from_letter(letter: &str) -> Result<Self> {
        match letter {
            "A" => Ok(Role::A),
            "B" => Ok(Role::B),
            "C" => Ok(Role::C),
            other => Err(TuneError::config(format!("unrecognised role `{other}`"))),
        }
    }

    /// Parameter keys of this role, in vector order.
    pub fn keys(self) -> &'static [&'static str] {
        match self {
            Role::A | Role::B => &CHI_KEYS,
            Role::C => &NON_CHI_KEYS,
        }
    }

    pub fn n_params(self) -> usize {
        self.keys().len()
    }

    pub fn key_index(self, key: &str) -> Result<usize> {
        self.keys().iter().position(|k| *k == key).ok_or_else(|| {
            TuneError::config(format!(
                "`{key}` is not a hyper-parameter of role {}",
                self.letter()
            ))
        })
    }
}

/// Parameters of the A and B roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chi {
    /// Micro-tile length along the operand's non-k dimension.
    Mic,
    /// Local memory padding.
    Pad,
    /// Load pattern toggle (interleaved vs. contiguous).
    Plu,
    /// Load-in-workgroup toggle.
    Liw,
    /// Micro-tile interwoven toggle.
    Miw,
    /// Workspace usage: see [`scratch`].
    Wos,
}

pub const CHI_KEYS: [&str; 6] = ["MIC", "PAD", "PLU", "LIW", "MIW", "WOS"];

impl Chi {
    pub fn idx(self) -> usize {
        self as usize
    }
}

/// Parameters of the C role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonChi {
    /// Unroll factor along k.
    Unr,
    /// Group allocation: see [`group_allocation`].
    Gal,
    /// Pragma-unroll toggle.
    Pun,
    /// k-split multiplicity ("ice"); above 1 the main kernel accumulates.
    Ice,
    /// Number of adjacent work-groups for super-column allocation.
    Naw,
    /// Unroll-for-offset toggle.
    Ufo,
    /// Work-items per work-group.
    Mac,
    /// Skew of the work-group grid around [`crate::derived::SKEW0`].
    Skw,
}

pub const NON_CHI_KEYS: [&str; 8] = ["UNR", "GAL", "PUN", "ICE", "NAW", "UFO", "MAC", "SKW"];

impl NonChi {
    pub fn idx(self) -> usize {
        self as usize
    }
}

pub mod binary {
    pub const NO: usize = 0;
    pub const YES: usize = 1;
}

pub mod scratch {
    pub const UNUSED: usize = 0;
    /// Copy the operand into workspace before the main kernel.
    pub const COPY: usize = 1;
    /// Copy into workspace in a tile-friendly "normal form".
    pub const NFORM: usize = 2;
}

pub mod group_allocation {
    pub const BY_ROW: usize = 1;
    pub const BY_COL: usize = 2;
    pub const SU_COL: usize = 3;
}

/// One point of the search space.
///
/// Points are never mutated in place: [`HyperParams::with`] returns a copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HyperParams {
    values: [Vec<usize>; 3],
}

impl HyperParams {
    pub fn new(a: Vec<usize>, b: Vec<usize>, c: Vec<usize>) -> Result<Self> {
        let values = [a, b, c];
        for role in Role::ALL {
            let got = values[role.idx()].len();
            if got != role.n_params() {
                return Err(TuneError::logic(format!(
                    "role {} expects {} hyper-parameters, got {}",
                    role.letter(),
                    role.n_params(),
                    got
                )));
            }
        }
        Ok(Self { values })
    }

    pub fn values(&self, role: Role) -> &[usize] {
        &self.values[role.idx()]
    }

    pub fn get(&self, role: Role, index: usize) -> usize {
        self.values[role.idx()][index]
    }

    pub fn chi(&self, role: Role, param: Chi) -> usize {
        debug_assert!(role != Role::C);
        self.get(role, param.idx())
    }

    pub fn non_chi(&self, param: NonChi) -> usize {
        self.get(Role::C, param.idx())
    }

    /// Copy of this point with one value replaced.
    pub fn with(&self, role: Role, index: usize, value: usize) -> Self {
        let mut next = self.clone();
        next.values[role.idx()][index] = value;
        next
    }
}

impl fmt::Display for HyperParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, role) in Role::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str("__")?;
            }
            f.write_str(role.letter())?;
            for (key, value) in role.keys().iter().zip(self.values(*role)) {
                write!(f, "_{key}{value}")?;
            }
        }
        Ok(())
    }
}

/// One parsed `ROLE_KEYv_KEYv` group.
pub type RoleGroup = (Role, Vec<(usize, usize)>);

/// Parses `__`-separated role groups of `KEY<value>` tokens.
///
/// Keys are resolved to parameter indices. A role may appear at most once
/// and a key at most once within its group.
pub fn parse_role_groups(s: &str) -> Result<Vec<RoleGroup>> {
    let mut groups: Vec<RoleGroup> = Vec::new();
    for group in s.split("__").filter(|g| !g.is_empty()) {
        let mut tokens = group.split('_');
        let role = Role::from_letter(tokens.next().unwrap_or_default())?;
        if groups.iter().any(|(r, _)| *r == role) {
            return Err(TuneError::config(format!(
                "role {} appears more than once in `{s}`",
                role.letter()
            )));
        }
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        for token in tokens.filter(|t| !t.is_empty()) {
            let (key, value) = split_token(token)?;
            let index = role.key_index(key)?;
            if pairs.iter().any(|(i, _)| *i == index) {
                return Err(TuneError::config(format!(
                    "`{key}` is given twice for role {} in `{s}`",
                    role.letter()
                )));
            }
            pairs.push((index, value));
        }
        groups.push((role, pairs));
    }
    Ok(groups)
}

impl FromStr for HyperParams {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        let mut values: [Vec<Option<usize>>; 3] = [
            vec![None; Role::A.n_params()],
            vec![None; Role::B.n_params()],
            vec![None; Role::C.n_params()],
        ];
        for (role, pairs) in parse_role_groups(s)? {
            for (index, value) in pairs {
                values[role.idx()][index] = Some(value);
            }
        }

        let mut complete: Vec<Vec<usize>> = Vec::with_capacity(3);
        for role in Role::ALL {
            let row = values[role.idx()]
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.ok_or_else(|| {
                        TuneError::config(format!(
                            "hyper-parameter string `{s}` is missing {}_{}",
                            role.letter(),
                            role.keys()[i]
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            complete.push(row);
        }
        let c = complete.pop().unwrap_or_default();
        let b = complete.pop().unwrap_or_default();
        let a = complete.pop().unwrap_or_default();
        HyperParams::new(a, b, c)
    }
}
