//! User-imposed restrictions on the search space.
//!
//! A constraint string has an optional start-range part after a triple
//! underscore:
//!
//! ```text
//! A_WOS0__B_WOS0__C_ICE1___C_UNR16
//! └────── range ───────┘   └start┘
//! ```
//!
//! A range constraint pins a parameter to one value for the whole search.
//! A start-range constraint only pins the value that random starts use.

use gemmtune_kernels::{parse_role_groups, Result, Role, TuneError};
use std::fmt;
use std::str::FromStr;

/// Constraints on one role's parameters; `None` means unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub role: Role,
    pub range: Vec<Option<usize>>,
    pub start_range: Vec<Option<usize>>,
}

impl Constraint {
    pub fn none(role: Role) -> Self {
        Self {
            role,
            range: vec![None; role.n_params()],
            start_range: vec![None; role.n_params()],
        }
    }

    fn write_part(&self, f: &mut fmt::Formatter<'_>, part: &[Option<usize>]) -> fmt::Result {
        f.write_str(self.role.letter())?;
        for (key, value) in self.role.keys().iter().zip(part) {
            if let Some(value) = value {
                write!(f, "_{key}{value}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    sub: [Constraint; 3],
}

impl Default for Constraints {
    fn default() -> Self {
        Self::none()
    }
}

impl Constraints {
    pub fn none() -> Self {
        Self {
            sub: [
                Constraint::none(Role::A),
                Constraint::none(Role::B),
                Constraint::none(Role::C),
            ],
        }
    }

    pub fn get(&self, role: Role) -> &Constraint {
        &self.sub[role.idx()]
    }

    pub fn is_empty(&self) -> bool {
        self.sub
            .iter()
            .all(|c| c.range.iter().chain(&c.start_range).all(Option::is_none))
    }

    fn fmt_part(
        &self,
        f: &mut fmt::Formatter<'_>,
        select: impl Fn(&Constraint) -> &[Option<usize>],
    ) -> fmt::Result {
        let mut first = true;
        for constraint in &self.sub {
            let part = select(constraint);
            if part.iter().all(Option::is_none) {
                continue;
            }
            if !first {
                f.write_str("__")?;
            }
            first = false;
            constraint.write_part(f, part)?;
        }
        Ok(())
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_part(f, |c| &c.range)?;
        if self.sub.iter().any(|c| c.start_range.iter().any(Option::is_some)) {
            f.write_str("___")?;
            self.fmt_part(f, |c| &c.start_range)?;
        }
        Ok(())
    }
}

impl FromStr for Constraints {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        let mut constraints = Self::none();
        let mut parts = s.splitn(2, "___");
        let range_part = parts.next().unwrap_or_default();
        let start_part = parts.next().unwrap_or_default();
        if start_part.contains("___") {
            return Err(TuneError::config(format!(
                "constraint string `{s}` has more than one start-range section"
            )));
        }

        for (role, pairs) in parse_role_groups(range_part)? {
            for (index, value) in pairs {
                constraints.sub[role.idx()].range[index] = Some(value);
            }
        }
        for (role, pairs) in parse_role_groups(start_part)? {
            for (index, value) in pairs {
                constraints.sub[role.idx()].start_range[index] = Some(value);
            }
        }
        Ok(constraints)
    }
}
