//! Weighted choice of the next crash category

use super::CrashCategory;
use crate::config::CategoryChances;
use rand::Rng;
use strum::IntoEnumIterator;

/// Draws one category with probability proportional to its base chance.
///
/// Returns `None` when no chance is positive, in which case the server stays
/// healthy forever. Intervals are laid out in [`CrashCategory`] declaration
/// order.
pub fn select_category<R: Rng + ?Sized>(
    chances: &CategoryChances,
    rng: &mut R,
) -> Option<CrashCategory> {
    let total = chances.total();
    if !(total > 0.0) {
        return None;
    }

    let draw = rng.gen::<f64>() * total;
    let mut upper = 0.0;
    for category in CrashCategory::iter() {
        upper += chances.get(category);
        if draw < upper {
            return Some(category);
        }
    }

    // rounding can leave the draw on the closing bound
    CrashCategory::iter()
        .rev()
        .find(|category| chances.get(*category) > 0.0)
}
