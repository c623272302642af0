//! Bucketing implementation.
use sha1::{Digest, Sha1};

use crate::{eval::ErrorKind, Context, Kind, Reference};

/// Largest value of the first 15 hex digits of a SHA-1 hash.
const LONG_SCALE: f64 = 0xFFFFFFFFFFFFFFFu64 as f64;

/// Parameters identifying which attribute to bucket by and how to salt the hash.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketParams<'a> {
    pub context_kind: Option<&'a Kind>,
    pub bucket_by: Option<&'a str>,
    pub is_experiment: bool,
    pub key: &'a str,
    pub salt: &'a str,
    pub seed: Option<i64>,
}

/// Compute the bucket of a context in `[0, 1)`.
///
/// Returns the bucket and whether the context had the requested kind. Contexts without the kind
/// or without a bucketable attribute value land in bucket 0.
pub(crate) fn bucket_context(
    context: &Context,
    params: BucketParams<'_>,
) -> Result<(f64, bool), ErrorKind> {
    let kind = params.context_kind.cloned().unwrap_or_else(Kind::user);
    let reference = match params.bucket_by {
        Some(attribute) if !params.is_experiment => {
            if params.context_kind.is_some() {
                Reference::new(attribute)
            } else {
                Reference::literal(attribute)
            }
        }
        _ => Reference::new("key"),
    };
    if !reference.is_valid() {
        return Err(ErrorKind::MalformedFlag);
    }

    let Some(individual) = context.as_kind(&kind) else {
        return Ok((0.0, false));
    };
    let Some(value) = individual
        .get_value(&reference)
        .and_then(|v| v.as_bucketable())
    else {
        return Ok((0.0, true));
    };

    let mut input = match params.seed {
        Some(seed) => format!("{seed}.{value}"),
        None => format!("{}.{}.{value}", params.key, params.salt),
    };
    if let Some(secondary) = individual.secondary() {
        input.push('.');
        input.push_str(secondary);
    }
    Ok((bucket_value(&input), true))
}

/// Hash `input` into `[0, 1)`.
pub(crate) fn bucket_value(input: &str) -> f64 {
    let hash = Sha1::digest(input.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[0..8]);
    // first 15 hex digits
    let value = u64::from_be_bytes(prefix) >> 4;
    value as f64 / LONG_SCALE
}
