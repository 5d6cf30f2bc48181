use std::collections::HashSet;

use crate::{error::ConfigError, flag::VariantWeight, sharder::VARIANT_BUCKETS, Str};

/// Variants laid out on a cumulative-weight line.
///
/// Weights are relative: the line runs from `0` to the sum of weights, and a bucket in
/// `[0, VARIANT_BUCKETS)` is scaled onto it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantTable {
    /// `(name, cumulative upper bound)` in declared order.
    entries: Box<[(Str, u64)]>,
    total: u64,
}

impl VariantTable {
    /// Validate and lay out `variants`. Names must be unique and weights must not all be zero.
    pub fn build(variants: &[VariantWeight]) -> Result<VariantTable, ConfigError> {
        if variants.is_empty() {
            return Ok(VariantTable::default());
        }

        let mut seen = HashSet::with_capacity(variants.len());
        let mut total = 0u64;
        let mut entries = Vec::with_capacity(variants.len());
        for variant in variants {
            if !seen.insert(variant.name.as_str()) {
                return Err(ConfigError::DuplicateVariant(variant.name.clone()));
            }
            total += u64::from(variant.weight);
            entries.push((Str::from(variant.name.as_str()), total));
        }

        if total == 0 {
            return Err(ConfigError::ZeroTotalWeight);
        }

        Ok(VariantTable {
            entries: entries.into_boxed_slice(),
            total,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Select the variant for `bucket`.
///
/// Returns the first variant whose cumulative upper bound exceeds the bucket's position on the
/// weight line, or `default_variant` when there are no variants. Zero-weight variants are never
/// selected. The bucket is computed by the caller; this function never hashes.
pub fn allocate(
    bucket: u64,
    variants: &VariantTable,
    default_variant: Option<&Str>,
) -> Option<Str> {
    let position =
        (u128::from(bucket) * u128::from(variants.total) / u128::from(VARIANT_BUCKETS)) as u64;
    variants
        .entries
        .iter()
        .find(|(_, upper)| position < *upper)
        .map(|(name, _)| name.clone())
        .or_else(|| default_variant.cloned())
}
