//! Factor registry: normalized fixed-effect dimensions.
//!
//! Raw categorical codes are remapped to contiguous group ids `[0, G_k)` per
//! dimension, with an inverted index (observations grouped by id) that the
//! demeaning engine sweeps over. A dimension may carry a continuous slope
//! variable, in which case the projection removes a per-group multiple of the
//! slope instead of a per-group mean.
//!
//! The registry is built once per estimation call, validated up front, and
//! shared read-only across all demeaning calls and IRLS iterations.

use ahash::AHashMap;
use thiserror::Error;

/// Errors raised while building a [`FactorRegistry`]. All are fatal and are
/// reported before any iteration starts.
#[derive(Error, Debug)]
pub enum FactorError {
    #[error("factor specification is empty or has zero observations")]
    EmptyInput,

    #[error("factor '{name}' has {found} observations, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("slope variable of factor '{name}' has {found} values, expected {expected}")]
    SlopeLengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("factor '{name}' has {n_groups} group(s); a fixed effect needs at least 2")]
    TooFewGroups { name: String, n_groups: usize },

    #[error(
        "fixed effects are not identified: {parameters} parameters for {n_obs} observations"
    )]
    Unidentified { parameters: usize, n_obs: usize },
}

/// Raw input for one fixed-effect dimension.
#[derive(Debug, Clone)]
pub struct FactorSpec {
    pub name: String,
    /// Raw group codes, one per observation. Arbitrary integers; remapped to
    /// contiguous ids in first-appearance order.
    pub codes: Vec<i64>,
    /// Optional continuous slope variable interacting with the factor.
    pub slope: Option<Vec<f64>>,
}

impl FactorSpec {
    pub fn new(name: impl Into<String>, codes: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            codes,
            slope: None,
        }
    }

    pub fn with_slope(name: impl Into<String>, codes: Vec<i64>, slope: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            codes,
            slope: Some(slope),
        }
    }
}

/// One normalized fixed-effect dimension.
#[derive(Debug, Clone)]
pub struct FactorDimension {
    name: String,
    /// group_of[i] = contiguous group id of observation i.
    group_of: Vec<u32>,
    n_groups: usize,
    /// Raw code for each contiguous id (first-appearance order).
    levels: Vec<i64>,
    /// Observation indices sorted by group id (CSR values).
    group_obs: Vec<u32>,
    /// CSR offsets, length `n_groups + 1`.
    group_offsets: Vec<u32>,
    slope: Option<Vec<f64>>,
}

impl FactorDimension {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_groups(&self) -> usize {
        self.n_groups
    }

    pub fn group_of(&self, obs: usize) -> usize {
        self.group_of[obs] as usize
    }

    pub fn group_ids(&self) -> &[u32] {
        &self.group_of
    }

    /// Raw code corresponding to contiguous group id `g`.
    pub fn level(&self, g: usize) -> i64 {
        self.levels[g]
    }

    pub fn levels(&self) -> &[i64] {
        &self.levels
    }

    /// Observation indices belonging to group `g`.
    pub fn group_rows(&self, g: usize) -> &[u32] {
        let lo = self.group_offsets[g] as usize;
        let hi = self.group_offsets[g + 1] as usize;
        &self.group_obs[lo..hi]
    }

    pub fn slope(&self) -> Option<&[f64]> {
        self.slope.as_deref()
    }

    pub fn has_slope(&self) -> bool {
        self.slope.is_some()
    }
}

/// Normalized set of fixed-effect dimensions for one estimation call.
#[derive(Debug, Clone)]
pub struct FactorRegistry {
    n_obs: usize,
    dims: Vec<FactorDimension>,
}

impl FactorRegistry {
    /// Build and validate a registry from raw factor specifications.
    ///
    /// Fails if any dimension has fewer than two groups, if lengths disagree,
    /// or if the total fixed-effect parameter count is not strictly smaller
    /// than the number of observations.
    pub fn build(specs: &[FactorSpec]) -> Result<Self, FactorError> {
        let n_obs = specs.first().map(|s| s.codes.len()).ok_or(FactorError::EmptyInput)?;
        if n_obs == 0 {
            return Err(FactorError::EmptyInput);
        }

        let mut dims = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.codes.len() != n_obs {
                return Err(FactorError::LengthMismatch {
                    name: spec.name.clone(),
                    expected: n_obs,
                    found: spec.codes.len(),
                });
            }
            if let Some(slope) = &spec.slope {
                if slope.len() != n_obs {
                    return Err(FactorError::SlopeLengthMismatch {
                        name: spec.name.clone(),
                        expected: n_obs,
                        found: slope.len(),
                    });
                }
            }

            // Remap raw codes to contiguous ids in first-appearance order.
            let mut id_of: AHashMap<i64, u32> = AHashMap::with_capacity(64);
            let mut levels = Vec::new();
            let mut group_of = Vec::with_capacity(n_obs);
            for &code in &spec.codes {
                let next = id_of.len() as u32;
                let id = *id_of.entry(code).or_insert_with(|| {
                    levels.push(code);
                    next
                });
                group_of.push(id);
            }
            let n_groups = levels.len();
            if n_groups < 2 {
                return Err(FactorError::TooFewGroups {
                    name: spec.name.clone(),
                    n_groups,
                });
            }

            // Inverted index: counting sort of observations by group id.
            let mut counts = vec![0u32; n_groups];
            for &g in &group_of {
                counts[g as usize] += 1;
            }
            let mut group_offsets = vec![0u32; n_groups + 1];
            for g in 0..n_groups {
                group_offsets[g + 1] = group_offsets[g] + counts[g];
            }
            let mut cursor = group_offsets[..n_groups].to_vec();
            let mut group_obs = vec![0u32; n_obs];
            for (i, &g) in group_of.iter().enumerate() {
                let slot = cursor[g as usize];
                group_obs[slot as usize] = i as u32;
                cursor[g as usize] += 1;
            }

            dims.push(FactorDimension {
                name: spec.name.clone(),
                group_of,
                n_groups,
                levels,
                group_obs,
                group_offsets,
                slope: spec.slope.clone(),
            });
        }

        let registry = Self { n_obs, dims };
        let parameters = registry.n_parameters();
        if parameters >= n_obs {
            return Err(FactorError::Unidentified { parameters, n_obs });
        }
        Ok(registry)
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, k: usize) -> &FactorDimension {
        &self.dims[k]
    }

    pub fn dims(&self) -> &[FactorDimension] {
        &self.dims
    }

    /// Total number of fixed-effect parameters across all dimensions.
    pub fn n_parameters(&self) -> usize {
        self.dims.iter().map(|d| d.n_groups).sum()
    }

    /// Degrees of freedom absorbed by the fixed effects.
    ///
    /// The demeaned system carries no intercept, so the first plain dimension
    /// absorbs all `G` of its levels. Each further plain dimension absorbs
    /// `G - 1` (one level is redundant with the first dimension's span); for
    /// exactly two plain dimensions the redundancy is computed exactly via the
    /// connected components of the bipartite group graph. Slope dimensions
    /// absorb `G` each: a per-group slope is not collinear with group
    /// constants.
    pub fn absorbed_degrees_of_freedom(&self) -> usize {
        let plain: Vec<&FactorDimension> = self.dims.iter().filter(|d| !d.has_slope()).collect();
        let slope_df: usize = self
            .dims
            .iter()
            .filter(|d| d.has_slope())
            .map(|d| d.n_groups)
            .sum();

        let plain_df = match plain.len() {
            0 => 0,
            1 => plain[0].n_groups,
            _ => {
                let components = self.connected_components(plain[0], plain[1]);
                let two_way = plain[0].n_groups + plain[1].n_groups - components;
                let rest: usize = plain[2..].iter().map(|d| d.n_groups - 1).sum();
                two_way + rest
            }
        };
        plain_df + slope_df
    }

    /// Connected components of the bipartite graph linking two dimensions'
    /// groups through shared observations (union-find with path halving).
    fn connected_components(&self, a: &FactorDimension, b: &FactorDimension) -> usize {
        let na = a.n_groups;
        let total = na + b.n_groups;
        let mut parent: Vec<usize> = (0..total).collect();
        let mut rank = vec![0u8; total];

        for i in 0..self.n_obs {
            let ga = a.group_of(i);
            let gb = na + b.group_of(i);
            uf_union(&mut parent, &mut rank, ga, gb);
        }

        let mut roots = ahash::AHashSet::new();
        for node in 0..total {
            roots.insert(uf_find(&mut parent, node));
        }
        roots.len()
    }
}

fn uf_find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]]; // path halving
        x = parent[x];
    }
    x
}

fn uf_union(parent: &mut [usize], rank: &mut [u8], a: usize, b: usize) {
    let ra = uf_find(parent, a);
    let rb = uf_find(parent, b);
    if ra == rb {
        return;
    }
    if rank[ra] < rank[rb] {
        parent[ra] = rb;
    } else if rank[ra] > rank[rb] {
        parent[rb] = ra;
    } else {
        parent[rb] = ra;
        rank[ra] += 1;
    }
}
