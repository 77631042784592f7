//! Regular grid decomposition of a rectangular domain into blocks.
//!
//! The domain is cut into `divisions[0] * ... * divisions[d-1]` blocks. Block
//! coordinates map to gids with axis 0 varying fastest. Each block receives
//! its core bounds, ghosted bounds, the global domain and a [`RegularLink`]
//! to all face, edge and corner neighbors (up to `3^d - 1`), optionally
//! wrapping around periodic axes.

use crate::block_error::BlockError;
use crate::partitioning::assigner::Assigner;
use crate::topology::bounds::{Bounds, Coordinate};
use crate::topology::gid::{BlockId, Gid};
use crate::topology::link::{Direction, RegularLink};
use itertools::Itertools;

/// Optional per-axis knobs. Empty vectors mean "default on every axis".
#[derive(Clone, Debug)]
pub struct DecomposerConfig<T> {
    /// Periodic axes.
    pub wrap: Vec<bool>,
    /// Ghost-layer width per axis.
    pub ghosts: Vec<T>,
    /// Fixed division counts; `0` leaves the axis to the factorization.
    pub divisions: Vec<usize>,
    /// Discrete axes only: adjacent blocks share the face point.
    pub share_face: Vec<bool>,
}

impl<T> Default for DecomposerConfig<T> {
    fn default() -> Self {
        DecomposerConfig {
            wrap: Vec::new(),
            ghosts: Vec::new(),
            divisions: Vec::new(),
            share_face: Vec::new(),
        }
    }
}

fn per_axis<V: Clone>(name: &str, v: Vec<V>, dim: usize, fill: V) -> Result<Vec<V>, BlockError> {
    match v.len() {
        0 => Ok(vec![fill; dim]),
        n if n == dim => Ok(v),
        n => Err(BlockError::Configuration(format!(
            "{name} has {n} entries for a {dim}-dimensional domain"
        ))),
    }
}

/// Prime factors of `n`, ascending.
fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out
}

/// Complete a partial division vector so the axes multiply to `nblocks`.
///
/// Prime factors of the unconstrained part are handed out largest first, each
/// to the free axis with the fewest divisions so far (lowest axis on ties).
pub fn fill_divisions(nblocks: usize, fixed: &[usize]) -> Result<Vec<usize>, BlockError> {
    if nblocks == 0 {
        return Err(BlockError::Configuration(
            "cannot decompose into zero blocks".into(),
        ));
    }
    let fixed_prod: usize = fixed.iter().filter(|&&d| d > 0).product();
    if nblocks % fixed_prod != 0 {
        return Err(BlockError::Configuration(format!(
            "{nblocks} blocks cannot be split with fixed divisions {fixed:?}"
        )));
    }
    let mut divs = fixed.to_vec();
    let free: Vec<usize> = (0..divs.len()).filter(|&a| divs[a] == 0).collect();
    let rest = nblocks / fixed_prod;
    if free.is_empty() {
        if rest != 1 {
            return Err(BlockError::Configuration(format!(
                "fixed divisions {fixed:?} give {fixed_prod} blocks, requested {nblocks}"
            )));
        }
        return Ok(divs);
    }
    for &a in &free {
        divs[a] = 1;
    }
    for f in prime_factors(rest).into_iter().rev() {
        if let Some(axis) = free.iter().copied().min_by_key(|&a| divs[a]) {
            divs[axis] *= f;
        }
    }
    Ok(divs)
}

/// Regular decomposition of `domain` into `nblocks` blocks.
#[derive(Clone, Debug)]
pub struct RegularDecomposer<T> {
    dim: usize,
    domain: Bounds<T>,
    nblocks: usize,
    divisions: Vec<usize>,
    wrap: Vec<bool>,
    ghosts: Vec<T>,
    share_face: Vec<bool>,
}

impl<T: Coordinate> RegularDecomposer<T> {
    pub fn new(domain: Bounds<T>, nblocks: usize) -> Result<Self, BlockError> {
        Self::with_config(domain, nblocks, DecomposerConfig::default())
    }

    pub fn with_config(
        domain: Bounds<T>,
        nblocks: usize,
        config: DecomposerConfig<T>,
    ) -> Result<Self, BlockError> {
        let dim = domain.dim();
        if dim == 0 {
            return Err(BlockError::Configuration(
                "domain must have at least one axis".into(),
            ));
        }
        let wrap = per_axis("wrap", config.wrap, dim, false)?;
        let ghosts = per_axis("ghosts", config.ghosts, dim, T::zero())?;
        let share_face = per_axis("share_face", config.share_face, dim, false)?;
        let fixed = per_axis("divisions", config.divisions, dim, 0)?;
        let divisions = fill_divisions(nblocks, &fixed)?;

        if T::DISCRETE {
            if let Some(axis) =
                (0..dim).find(|&a| T::from_count(divisions[a]) > domain.period(a))
            {
                return Err(BlockError::Configuration(format!(
                    "axis {axis} has {:?} points but {} divisions",
                    domain.period(axis),
                    divisions[axis]
                )));
            }
        }
        log::debug!("regular decomposition of {nblocks} blocks: divisions {divisions:?}");
        Ok(RegularDecomposer {
            dim,
            domain,
            nblocks,
            divisions,
            wrap,
            ghosts,
            share_face,
        })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn domain(&self) -> &Bounds<T> {
        &self.domain
    }

    pub fn divisions(&self) -> &[usize] {
        &self.divisions
    }

    pub fn wrap(&self) -> &[bool] {
        &self.wrap
    }

    /// Grid coordinates of `gid`, axis 0 fastest.
    pub fn gid_to_coords(&self, gid: Gid) -> Vec<usize> {
        gid_to_coords(gid, &self.divisions)
    }

    pub fn coords_to_gid(&self, coords: &[usize]) -> Gid {
        coords_to_gid(coords, &self.divisions)
    }

    fn axis_from(&self, axis: usize, i: usize) -> T {
        let n = T::from_count(self.divisions[axis]);
        self.domain.min[axis] + self.domain.period(axis) / n * T::from_count(i)
    }

    fn axis_to(&self, axis: usize, i: usize) -> T {
        if i + 1 == self.divisions[axis] {
            return self.domain.max[axis];
        }
        let next = self.axis_from(axis, i + 1);
        if T::DISCRETE && !self.share_face[axis] {
            next - T::one()
        } else {
            next
        }
    }

    fn core_at(&self, coords: &[usize]) -> Bounds<T> {
        let mut b = Bounds::zeros(self.dim);
        for a in 0..self.dim {
            b.min[a] = self.axis_from(a, coords[a]);
            b.max[a] = self.axis_to(a, coords[a]);
        }
        b
    }

    fn ghosted(&self, core: &Bounds<T>) -> Bounds<T> {
        let mut b = core.clone();
        for a in 0..self.dim {
            b.min[a] = b.min[a] - self.ghosts[a];
            b.max[a] = b.max[a] + self.ghosts[a];
            if !self.wrap[a] {
                if b.min[a] < self.domain.min[a] {
                    b.min[a] = self.domain.min[a];
                }
                if b.max[a] > self.domain.max[a] {
                    b.max[a] = self.domain.max[a];
                }
            }
        }
        b
    }

    /// Core bounds of `gid`.
    pub fn core_bounds(&self, gid: Gid) -> Bounds<T> {
        self.core_at(&self.gid_to_coords(gid))
    }

    /// Gid of the block whose core contains `p`.
    pub fn point_to_gid(&self, p: &[T]) -> Option<Gid> {
        if !self.domain.contains(p) {
            return None;
        }
        let coords = (0..self.dim)
            .map(|a| {
                (0..self.divisions[a])
                    .find(|&i| self.axis_from(a, i) <= p[a] && p[a] <= self.axis_to(a, i))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(self.coords_to_gid(&coords))
    }

    /// Core bounds, ghosted bounds and link of one block.
    pub fn block(
        &self,
        gid: Gid,
        assigner: &dyn Assigner,
    ) -> Result<(Bounds<T>, Bounds<T>, RegularLink<T>), BlockError> {
        let coords = self.gid_to_coords(gid);
        let core = self.core_at(&coords);
        let bounds = self.ghosted(&core);
        let mut link = RegularLink::new(self.dim, core.clone(), bounds.clone());

        let offsets = (0..self.dim).map(|_| -1i32..=1).multi_cartesian_product();
        for off in offsets.filter(|o| o.iter().any(|&c| c != 0)) {
            let mut nc = coords.clone();
            let mut wrap = vec![0i32; self.dim];
            let mut inside = true;
            for a in 0..self.dim {
                let n = self.divisions[a] as i64;
                let c = coords[a] as i64 + i64::from(off[a]);
                if (0..n).contains(&c) {
                    nc[a] = c as usize;
                } else if self.wrap[a] {
                    nc[a] = c.rem_euclid(n) as usize;
                    wrap[a] = off[a];
                } else {
                    inside = false;
                    break;
                }
            }
            if !inside {
                continue;
            }
            let nbr = self.coords_to_gid(&nc);
            let mut nbr_bounds = self.core_at(&nc);
            for a in (0..self.dim).filter(|&a| wrap[a] != 0) {
                let period = self.domain.period(a);
                let delta = if wrap[a] < 0 { T::zero() - period } else { period };
                nbr_bounds.shift(a, delta);
            }
            link.add_neighbor(
                BlockId::new(nbr, assigner.rank(nbr)?),
                Direction::new(off),
                nbr_bounds,
                Direction::new(wrap),
            );
        }
        crate::debug_invariants!(
            crate::debug_invariants::DebugInvariants::validate_invariants(&link),
            "RegularDecomposer::block"
        );
        Ok((core, bounds, link))
    }

    /// Call `create(gid, core, bounds, domain, link)` once for every gid
    /// `assigner` gives to `rank`, in ascending gid order.
    pub fn decompose<F>(
        &self,
        rank: usize,
        assigner: &dyn Assigner,
        mut create: F,
    ) -> Result<(), BlockError>
    where
        F: FnMut(Gid, Bounds<T>, Bounds<T>, &Bounds<T>, RegularLink<T>) -> Result<(), BlockError>,
    {
        if assigner.nblocks() != self.nblocks {
            return Err(BlockError::Configuration(format!(
                "assigner covers {} blocks, decomposition has {}",
                assigner.nblocks(),
                self.nblocks
            )));
        }
        let mut gids = assigner.local_gids(rank);
        gids.sort_unstable();
        for gid in gids {
            let (core, bounds, link) = self.block(gid, assigner)?;
            create(gid, core, bounds, &self.domain, link)?;
        }
        Ok(())
    }
}

/// Grid coordinates of `gid` in a grid with the given divisions.
pub fn gid_to_coords(gid: Gid, divisions: &[usize]) -> Vec<usize> {
    let mut g = gid.get();
    divisions
        .iter()
        .map(|&d| {
            let c = g % d;
            g /= d;
            c
        })
        .collect()
}

pub fn coords_to_gid(coords: &[usize], divisions: &[usize]) -> Gid {
    let mut gid = 0;
    let mut stride = 1;
    for (c, d) in coords.iter().zip(divisions) {
        gid += c * stride;
        stride *= d;
    }
    Gid::new(gid)
}
