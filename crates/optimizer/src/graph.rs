//! The hyper-parameter search graph.
//!
//! Each role owns a [`SubGraph`]: for every parameter index, a table of
//! value -> directly reachable values (`edges`), the values a search may
//! visit (`range`) and the values a random start may pick (`start_range`).
//! The tables are built through a per-role [`RoleStrategy`], refined by the
//! geometry and device, then overridden by user [`Constraints`].

use crate::constraints::{Constraint, Constraints};
use crate::oracle::Oracle;
use fastrand::Rng;
use gemmtune_kernels::{
    binary, group_allocation, scratch, Chi, DeviceInfo, Geometry, HyperParams, MacGrid, NonChi,
    Result, Role, TuneError, SKEW0,
};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Value -> neighbor values, for one parameter index.
pub type Edges = BTreeMap<usize, Vec<usize>>;

/// A parameter slot: role and index into that role's vector.
pub type Location = (Role, usize);

/// Parameter pairs moved jointly, one up and one down.
pub const COUPLED_PAIRS: [(Location, Location); 3] = [
    ((Role::A, Chi::Mic as usize), (Role::B, Chi::Mic as usize)),
    ((Role::C, NonChi::Ufo as usize), (Role::C, NonChi::Pun as usize)),
    ((Role::C, NonChi::Unr as usize), (Role::C, NonChi::Ice as usize)),
];

pub const DEFAULT_MAX_START_ATTEMPTS: usize = 10_000;

/// What the strategy functions may inspect.
#[derive(Debug, Clone, Copy)]
pub struct GraphContext<'a> {
    pub role: Role,
    pub geometry: &'a Geometry,
    pub devinfo: &'a DeviceInfo,
}

impl GraphContext<'_> {
    /// The operand dimension a role's micro-tile runs along.
    fn non_k_dim(&self) -> usize {
        match self.role {
            Role::A => self.geometry.m,
            Role::B => self.geometry.n,
            Role::C => self.geometry.m.max(self.geometry.n),
        }
    }
}

/// Per-role construction functions.
#[derive(Clone, Copy)]
pub struct RoleStrategy {
    pub init_edges: fn(&GraphContext<'_>) -> Result<Vec<Edges>>,
    pub refine_start_range: fn(&GraphContext<'_>, &mut [Vec<usize>]),
}

impl RoleStrategy {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::A | Role::B => Self {
                init_edges: chi_edges,
                refine_start_range: chi_start_range,
            },
            Role::C => Self {
                init_edges: non_chi_edges,
                refine_start_range: non_chi_start_range,
            },
        }
    }
}

fn table(entries: &[(usize, &[usize])]) -> Edges {
    entries.iter().map(|(k, v)| (*k, v.to_vec())).collect()
}

fn binary_edges() -> Edges {
    table(&[(binary::NO, &[binary::YES]), (binary::YES, &[binary::NO])])
}

fn chi_edges(_ctx: &GraphContext<'_>) -> Result<Vec<Edges>> {
    let mut edges = vec![Edges::new(); Role::A.n_params()];
    edges[Chi::Mic.idx()] = table(&[
        (1, &[2, 3]),
        (2, &[1, 3, 4]),
        (3, &[1, 2, 4]),
        (4, &[2, 3, 5, 6]),
        (5, &[2, 4, 6]),
        (6, &[4, 5, 8]),
        (8, &[4, 6]),
    ]);
    edges[Chi::Pad.idx()] = table(&[(0, &[1]), (1, &[0, 2]), (2, &[1])]);
    edges[Chi::Plu.idx()] = binary_edges();
    edges[Chi::Liw.idx()] = binary_edges();
    edges[Chi::Miw.idx()] = binary_edges();
    edges[Chi::Wos.idx()] = table(&[
        (scratch::UNUSED, &[scratch::COPY, scratch::NFORM]),
        (scratch::COPY, &[scratch::UNUSED, scratch::NFORM]),
        (scratch::NFORM, &[scratch::UNUSED, scratch::COPY]),
    ]);
    Ok(edges)
}

fn non_chi_edges(ctx: &GraphContext<'_>) -> Result<Vec<Edges>> {
    let gg = ctx.geometry;
    let atom = ctx.devinfo.wg_atom_size;
    if atom != 32 && atom != 64 {
        return Err(TuneError::config(format!(
            "device {} has work-group atom size {}, expected 32 or 64",
            ctx.devinfo.device_name, atom
        )));
    }

    let mut edges = vec![Edges::new(); Role::C.n_params()];
    edges[NonChi::Unr.idx()] = table(&[(8, &[16]), (16, &[8, 32]), (32, &[16, 64]), (64, &[16, 32])]);
    edges[NonChi::Naw.idx()] = table(&[(64, &[16]), (16, &[64])]);
    edges[NonChi::Gal.idx()] = table(&[
        (
            group_allocation::BY_ROW,
            &[group_allocation::BY_COL, group_allocation::SU_COL],
        ),
        (
            group_allocation::BY_COL,
            &[group_allocation::BY_ROW, group_allocation::SU_COL],
        ),
        (
            group_allocation::SU_COL,
            &[group_allocation::BY_ROW, group_allocation::BY_COL],
        ),
    ]);

    let (mac, skw) = if gg.m * gg.n < 32 * 32 || gg.m < 16 || gg.n < 16 {
        (
            table(&[
                (1, &[4, 16]),
                (4, &[1, 16, 64]),
                (16, &[4, 64]),
                (64, &[16, 256]),
                (256, &[64]),
            ]),
            table(&[
                (7, &[8]),
                (8, &[7, 9]),
                (9, &[8, 10]),
                (10, &[9, 11]),
                (11, &[10, 12]),
                (12, &[11, 13]),
                (13, &[12]),
            ]),
        )
    } else if atom == 64 {
        (
            table(&[(64, &[256]), (256, &[64])]),
            table(&[(9, &[10]), (10, &[9, 11]), (11, &[10])]),
        )
    } else {
        (
            table(&[
                (32, &[64, 256]),
                (64, &[32, 128, 256]),
                (128, &[64, 256]),
                (256, &[64]),
            ]),
            table(&[(9, &[10]), (10, &[9, 11]), (11, &[10, 12]), (12, &[10, 11])]),
        )
    };
    edges[NonChi::Mac.idx()] = mac;
    edges[NonChi::Skw.idx()] = skw;

    edges[NonChi::Ice.idx()] = table(&[
        (1, &[2]),
        (2, &[1, 3, 4]),
        (3, &[1, 2, 4, 6]),
        (4, &[1, 3, 5, 7]),
        (5, &[1, 2, 4, 6, 8]),
        (6, &[1, 3, 5, 7, 9]),
        (7, &[4, 6, 8, 10]),
        (8, &[1, 5, 7, 9, 11]),
        (9, &[6, 8, 10, 12]),
        (10, &[1, 7, 9, 11, 13]),
        (11, &[8, 10, 12, 14]),
        (12, &[1, 9, 11, 13, 14]),
        (13, &[10, 12, 14]),
        (14, &[1, 11, 13]),
    ]);
    edges[NonChi::Pun.idx()] = binary_edges();
    edges[NonChi::Ufo.idx()] = binary_edges();
    Ok(edges)
}

fn chi_start_range(ctx: &GraphContext<'_>, start_range: &mut [Vec<usize>]) {
    start_range[Chi::Pad.idx()] = vec![1, 2];
    start_range[Chi::Liw.idx()] = vec![binary::NO];
    start_range[Chi::Miw.idx()] = vec![binary::YES];
    start_range[Chi::Wos.idx()] = vec![scratch::UNUSED, scratch::COPY, scratch::NFORM];

    let dim = ctx.non_k_dim();
    let mut mic = vec![8, 6];
    if dim < 256 {
        mic.extend([5, 4]);
    }
    if dim < 128 {
        mic.extend([3, 2]);
    }
    if dim < 64 {
        mic.push(1);
    }
    mic.retain(|&x| x <= dim);
    start_range[Chi::Mic.idx()] = mic;
}

fn non_chi_start_range(ctx: &GraphContext<'_>, start_range: &mut [Vec<usize>]) {
    start_range[NonChi::Unr.idx()] = vec![8, 16];
    start_range[NonChi::Ice.idx()] = vec![1];
    start_range[NonChi::Ufo.idx()] = vec![binary::NO];

    if ctx.geometry.m > 200 && ctx.geometry.n > 200 {
        start_range[NonChi::Skw.idx()] = if ctx.devinfo.wg_atom_size == 32 {
            vec![SKEW0, SKEW0 + 1]
        } else {
            vec![SKEW0]
        };
    }
}

/// Legal values and transitions for one role.
#[derive(Debug, Clone)]
pub struct SubGraph {
    pub role: Role,
    pub edges: Vec<Edges>,
    pub range: Vec<Vec<usize>>,
    pub start_range: Vec<Vec<usize>>,
}

impl SubGraph {
    pub fn new(ctx: &GraphContext<'_>, constraint: &Constraint) -> Result<Self> {
        let strategy = RoleStrategy::for_role(ctx.role);
        let edges = (strategy.init_edges)(ctx)?;
        let range: Vec<Vec<usize>> = edges.iter().map(|e| e.keys().copied().collect()).collect();
        let mut start_range = range.clone();
        (strategy.refine_start_range)(ctx, &mut start_range);

        let mut subgraph = Self {
            role: ctx.role,
            edges,
            range,
            start_range,
        };
        subgraph.checks().map_err(TuneError::logic)?;
        subgraph.apply_constraint(constraint)?;
        subgraph
            .checks()
            .map_err(|e| TuneError::config(format!("after applying constraints: {e}")))?;
        Ok(subgraph)
    }

    fn location(&self, index: usize) -> String {
        format!("role {} {}", self.role.letter(), self.role.keys()[index])
    }

    /// Verifies the containment invariants of every parameter index.
    pub fn checks(&self) -> std::result::Result<(), String> {
        for (i, edges) in self.edges.iter().enumerate() {
            let (range, start_range) = (&self.range[i], &self.start_range[i]);
            if range.is_empty() || start_range.is_empty() {
                return Err(format!("{}: empty range or start range", self.location(i)));
            }
            for key in edges.keys() {
                if !range.contains(key) && !start_range.contains(key) {
                    return Err(format!(
                        "{}: edge key {} is in neither range nor start range",
                        self.location(i),
                        key
                    ));
                }
            }
            if let Some(v) = range.iter().find(|v| !edges.contains_key(v)) {
                return Err(format!("{}: range value {} is not an edge key", self.location(i), v));
            }
            if let Some(v) = start_range.iter().find(|v| !edges.contains_key(v)) {
                return Err(format!(
                    "{}: start range value {} is not an edge key",
                    self.location(i),
                    v
                ));
            }
            for (key, targets) in edges {
                if let Some(t) = targets.iter().find(|t| !range.contains(t)) {
                    return Err(format!(
                        "{}: dangling edge {} -> {}",
                        self.location(i),
                        key,
                        t
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply_constraint(&mut self, constraint: &Constraint) -> Result<()> {
        for i in 0..self.edges.len() {
            let (range_value, start_value) = (constraint.range[i], constraint.start_range[i]);
            match (range_value, start_value) {
                (Some(_), Some(_)) => {
                    return Err(TuneError::config(format!(
                        "{}: a parameter cannot have both a range and a start range constraint",
                        self.location(i)
                    )));
                }
                (None, Some(v)) => {
                    self.start_range[i] = vec![v];
                    // Reachable only as a start; leaves for anywhere in range.
                    if !self.range[i].contains(&v) {
                        self.edges[i].insert(v, self.range[i].clone());
                    }
                }
                (Some(v), None) => {
                    self.range[i] = vec![v];
                    self.start_range[i] = vec![v];
                    self.edges[i] = Edges::from([(v, Vec::new())]);
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    pub fn contains(&self, index: usize, value: usize) -> bool {
        self.range[index].contains(&value)
    }

    fn neighbors_of(&self, index: usize, value: usize) -> Result<&[usize]> {
        self.edges[index].get(&value).map(Vec::as_slice).ok_or_else(|| {
            TuneError::logic(format!(
                "{}: value {} is not a vertex of the graph",
                self.location(index),
                value
            ))
        })
    }

    fn random_start(&self, rng: &mut Rng) -> Vec<usize> {
        self.start_range
            .iter()
            .map(|values| values[rng.usize(..values.len())])
            .collect()
    }
}

/// Search graph over complete hyper-parameter points.
#[derive(Debug, Clone)]
pub struct Graph {
    geometry: Geometry,
    devinfo: DeviceInfo,
    subgraphs: [SubGraph; 3],
    max_start_attempts: usize,
}

impl Graph {
    pub fn new(geometry: &Geometry, devinfo: &DeviceInfo, constraints: &Constraints) -> Result<Self> {
        let build = |role: Role| {
            let ctx = GraphContext {
                role,
                geometry,
                devinfo,
            };
            SubGraph::new(&ctx, constraints.get(role))
        };
        Ok(Self {
            geometry: geometry.clone(),
            devinfo: devinfo.clone(),
            subgraphs: [build(Role::A)?, build(Role::B)?, build(Role::C)?],
            max_start_attempts: DEFAULT_MAX_START_ATTEMPTS,
        })
    }

    pub fn with_max_start_attempts(mut self, attempts: usize) -> Self {
        self.max_start_attempts = attempts;
        self
    }

    pub fn at(&self, role: Role) -> &SubGraph {
        &self.subgraphs[role.idx()]
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn devinfo(&self) -> &DeviceInfo {
        &self.devinfo
    }

    /// Uniform sample from every start range. No validity checks.
    pub fn get_random_start(&self, rng: &mut Rng) -> Result<HyperParams> {
        let [a, b, c] = Role::ALL.map(|role| self.at(role).random_start(rng));
        HyperParams::new(a, b, c)
    }

    /// Samples random starts until one passes the oracle's derivability and
    /// capability tests. Giving up after the attempt bound is fatal.
    pub fn get_random_valid_start(&self, oracle: &dyn Oracle, rng: &mut Rng) -> Result<HyperParams> {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_start_attempts {
            let hp = self.get_random_start(rng)?;
            let derivability = oracle.derivability(&hp, &self.geometry);
            if !derivability.passed {
                last_reason = format!("{hp} is not derivable: {}", derivability.msg);
                continue;
            }
            let capability = oracle.capability(&hp, &self.geometry, &self.devinfo);
            if !capability.passed {
                last_reason = format!("{hp} failed capability: {}", capability.msg);
                continue;
            }
            debug!(attempts = attempt, hp = %hp, "found valid start");
            return Ok(hp);
        }
        warn!(attempts = self.max_start_attempts, "no valid start found");
        Err(TuneError::logic(format!(
            "no point satisfying geometry {}, constraints and device {} found in {} attempts; last rejection: {}",
            self.geometry, self.devinfo.device_name, self.max_start_attempts, last_reason
        )))
    }

    pub fn contains_value(&self, role: Role, index: usize, value: usize) -> bool {
        self.at(role).contains(index, value)
    }

    pub fn contains(&self, hp: &HyperParams) -> bool {
        Role::ALL.iter().all(|&role| {
            hp.values(role)
                .iter()
                .enumerate()
                .all(|(i, &v)| self.contains_value(role, i, v))
        })
    }

    /// One-away, coupled and mic-mac moves from `hp`, each group shuffled,
    /// without duplicates and restricted to points the graph contains.
    pub fn get_neighbors(&self, hp: &HyperParams, rng: &mut Rng) -> Result<Vec<HyperParams>> {
        let mut one_aways = self.one_aways(hp)?;
        rng.shuffle(&mut one_aways);
        let mut coupled = self.coupled_aways(hp)?;
        rng.shuffle(&mut coupled);
        let mut mic_mac = self.mic_mac_transformed(hp)?;
        rng.shuffle(&mut mic_mac);

        let mut seen = HashSet::new();
        Ok(one_aways
            .into_iter()
            .chain(coupled)
            .chain(mic_mac)
            .filter(|q| self.contains(q) && seen.insert(q.clone()))
            .collect())
    }

    fn one_aways(&self, hp: &HyperParams) -> Result<Vec<HyperParams>> {
        let mut out = Vec::new();
        for role in Role::ALL {
            for (i, &v) in hp.values(role).iter().enumerate() {
                for &x in self.at(role).neighbors_of(i, v)? {
                    out.push(hp.with(role, i, x));
                }
            }
        }
        Ok(out)
    }

    fn coupled_aways(&self, hp: &HyperParams) -> Result<Vec<HyperParams>> {
        let mut out = Vec::new();
        for ((r1, i1), (r2, i2)) in COUPLED_PAIRS {
            let (v1, v2) = (hp.get(r1, i1), hp.get(r2, i2));
            for &x1 in self.at(r1).neighbors_of(i1, v1)? {
                for &x2 in self.at(r2).neighbors_of(i2, v2)? {
                    if (x1 > v1) != (x2 > v2) {
                        out.push(hp.with(r1, i1, x1).with(r2, i2, x2));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Moves to a neighboring MAC with micro-tiles rescaled so each macro
    /// tile stays roughly the same size.
    fn mic_mac_transformed(&self, hp: &HyperParams) -> Result<Vec<HyperParams>> {
        let (mac_i, mic_i) = (NonChi::Mac.idx(), Chi::Mic.idx());
        let skew = hp.non_chi(NonChi::Skw);
        let curr_mac = hp.non_chi(NonChi::Mac);
        let curr_grid = MacGrid::new(curr_mac, skew);
        let new_macs = self.at(Role::C).neighbors_of(mac_i, curr_mac)?;
        if !curr_grid.is_good {
            return Ok(Vec::new());
        }

        let curr_mica = hp.chi(Role::A, Chi::Mic);
        let curr_micb = hp.chi(Role::B, Chi::Mic);
        let mut out = Vec::new();
        for &new_mac in new_macs {
            let new_grid = MacGrid::new(new_mac, skew);
            if !new_grid.is_good {
                continue;
            }
            let scaled = |role: Role, curr_mic: usize| {
                let delta = new_grid.at(role) as f64 / curr_grid.at(role) as f64;
                (curr_mic as f64 / delta) as usize
            };
            let new_mica = scaled(Role::A, curr_mica);
            let new_micb = scaled(Role::B, curr_micb);
            let a_ok = new_mica != curr_mica && self.contains_value(Role::A, mic_i, new_mica);
            let b_ok = new_micb != curr_micb && self.contains_value(Role::B, mic_i, new_micb);

            let base = hp.with(Role::C, mac_i, new_mac);
            if a_ok {
                out.push(base.with(Role::A, mic_i, new_mica));
            }
            if b_ok {
                let with_b = base.with(Role::B, mic_i, new_micb);
                if a_ok {
                    out.push(with_b.with(Role::A, mic_i, new_mica));
                }
                out.push(with_b);
            }
        }
        Ok(out)
    }
}
