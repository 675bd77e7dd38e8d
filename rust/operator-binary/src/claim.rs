//! Accessors for the parts of a [`PersistentVolumeClaim`] that decide whether it is being expanded.
//!
//! Sizes are Kubernetes quantities, which are compared after parsing them into a
//! [`StorageQuantity`], so `1Gi` and `1024Mi` are equal and `1G` is smaller than `1Gi`.
use snafu::{OptionExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::PersistentVolumeClaim, apimachinery::pkg::api::resource::Quantity,
    },
    kube::ResourceExt,
};
use std::{fmt, str::FromStr};

pub const STORAGE_RESOURCE: &str = "storage";
pub const PHASE_BOUND: &str = "Bound";
pub const CONDITION_FILE_SYSTEM_RESIZE_PENDING: &str = "FileSystemResizePending";

/// The reconciliation key of a claim, displayed as `namespace/name`
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClaimKey {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Snafu)]
#[snafu(display("object has no namespace associated"))]
pub struct NoNamespaceError;

impl ClaimKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_claim(claim: &PersistentVolumeClaim) -> Result<Self, NoNamespaceError> {
        Ok(Self::new(
            claim.namespace().context(NoNamespaceSnafu)?,
            claim.name_any(),
        ))
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseQuantityError {
    #[snafu(display("quantity is empty"))]
    Empty,
    #[snafu(display("quantity {input:?} has no valid numeric part"))]
    MissingNumber { input: String },
    #[snafu(display("quantity {input:?} has an unknown suffix {suffix:?}"))]
    UnknownSuffix { input: String, suffix: String },
    #[snafu(display("quantity {input:?} is out of range"))]
    OutOfRange { input: String },
}

/// An exact storage size in thousandths of a byte.
///
/// Fractions below a milli-byte are rounded up, which never matters for storage requests.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct StorageQuantity(i128);

impl StorageQuantity {
    #[cfg(test)]
    pub fn from_bytes(bytes: i64) -> Self {
        Self(i128::from(bytes) * 1000)
    }
}

impl fmt::Display for StorageQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl FromStr for StorageQuantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return EmptySnafu.fail();
        }

        let (negative, unsigned) = match trimmed.as_bytes()[0] {
            b'-' => (true, &trimmed[1..]),
            b'+' => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return MissingNumberSnafu { input }.fail();
        }

        let out_of_range = || OutOfRangeSnafu { input }.build();
        let mut mantissa: i128 = 0;
        for digit in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit - b'0')))
                .ok_or_else(out_of_range)?;
        }

        let (numerator, denominator) =
            suffix_scale(suffix).ok_or_else(|| UnknownSuffixSnafu { input, suffix }.build())?;
        let fraction_scale = pow10(fraction.len()).ok_or_else(out_of_range)?;
        let denominator = denominator
            .checked_mul(fraction_scale)
            .ok_or_else(out_of_range)?;
        let scaled = mantissa
            .checked_mul(numerator)
            .and_then(|m| m.checked_mul(1000))
            .ok_or_else(out_of_range)?;

        // Round up towards the next milli-byte
        let millis = scaled / denominator + i128::from(scaled % denominator != 0);
        Ok(Self(if negative { -millis } else { millis }))
    }
}

impl TryFrom<&Quantity> for StorageQuantity {
    type Error = ParseQuantityError;

    fn try_from(quantity: &Quantity) -> Result<Self, Self::Error> {
        quantity.0.parse()
    }
}

fn pow10(exponent: usize) -> Option<i128> {
    10i128.checked_pow(u32::try_from(exponent).ok()?)
}

/// Returns the suffix multiplier as a `(numerator, denominator)` pair
fn suffix_scale(suffix: &str) -> Option<(i128, i128)> {
    let binary = |shift: u32| Some((1i128 << shift, 1));
    match suffix {
        "" => Some((1, 1)),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        "n" => Some((1, 1_000_000_000)),
        "u" => Some((1, 1_000_000)),
        "m" => Some((1, 1_000)),
        "k" => Some((1_000, 1)),
        "M" => Some((1_000_000, 1)),
        "G" => Some((1_000_000_000, 1)),
        "T" => Some((1_000_000_000_000, 1)),
        "P" => Some((1_000_000_000_000_000, 1)),
        "E" => Some((1_000_000_000_000_000_000, 1)),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?
                .parse::<i32>()
                .ok()?;
            // Larger exponents cannot describe a real volume
            if exponent.unsigned_abs() > 24 {
                return None;
            }
            let scale = pow10(exponent.unsigned_abs() as usize)?;
            if exponent >= 0 {
                Some((scale, 1))
            } else {
                Some((1, scale))
            }
        }
    }
}

fn parse_storage(
    claim: &PersistentVolumeClaim,
    quantity: Option<&Quantity>,
    field: &str,
) -> Option<StorageQuantity> {
    let quantity = quantity?;
    match StorageQuantity::try_from(quantity) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            tracing::debug!(
                claim = %claim.name_any(),
                field,
                error = &error as &dyn std::error::Error,
                "ignoring unparseable storage quantity"
            );
            None
        }
    }
}

/// The size requested in `spec.resources.requests.storage`
pub fn requested_size(claim: &PersistentVolumeClaim) -> Option<StorageQuantity> {
    let requested = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE_RESOURCE));
    parse_storage(claim, requested, "spec.resources.requests")
}

/// The capacity reported by the storage layer in `status.capacity.storage`
pub fn reported_capacity(claim: &PersistentVolumeClaim) -> Option<StorageQuantity> {
    let capacity = claim
        .status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get(STORAGE_RESOURCE));
    parse_storage(claim, capacity, "status.capacity")
}

/// A claim is expanding while its requested size exceeds the capacity last reported for it.
///
/// Claims without a reported capacity (not yet bound) are never expanding.
pub fn is_expanding(claim: &PersistentVolumeClaim) -> bool {
    match (requested_size(claim), reported_capacity(claim)) {
        (Some(requested), Some(capacity)) => requested > capacity,
        _ => false,
    }
}

pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some(PHASE_BOUND)
}

pub fn storage_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
        .filter(|name| !name.is_empty())
}

pub fn is_resize_pending(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .iter()
        .flat_map(|status| status.conditions.iter().flatten())
        .any(|condition| {
            condition.type_ == CONDITION_FILE_SYSTEM_RESIZE_PENDING && condition.status == "True"
        })
}
