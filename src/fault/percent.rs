use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Denominator of a [`FractionalPercent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenominatorType {
    #[default]
    Hundred,
    TenThousand,
    Million,
}

impl DenominatorType {
    pub fn value(self) -> u64 {
        match self {
            DenominatorType::Hundred => 100,
            DenominatorType::TenThousand => 10_000,
            DenominatorType::Million => 1_000_000,
        }
    }
}

/// A probability expressed as `numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FractionalPercent {
    #[serde(default)]
    pub numerator: u64,

    #[serde(default)]
    pub denominator: DenominatorType,
}

impl FractionalPercent {
    pub const fn new(numerator: u64, denominator: DenominatorType) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Percentage out of one hundred.
    pub const fn percent(numerator: u64) -> Self {
        Self::new(numerator, DenominatorType::Hundred)
    }

    pub const fn zero() -> Self {
        Self::percent(0)
    }

    /// Draw `r` uniformly from `[0, denominator)` and fire iff `r < numerator`.
    ///
    /// The extremes never consume randomness: a zero numerator never fires and
    /// a numerator at or above the denominator always fires.
    pub fn evaluate<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        let denominator = self.denominator.value();
        if self.numerator == 0 {
            return false;
        }
        if self.numerator >= denominator {
            return true;
        }
        rng.gen_range(0..denominator) < self.numerator
    }

    pub fn is_zero(&self) -> bool {
        self.numerator == 0
    }
}

impl fmt::Display for FractionalPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_never_fires() {
        let mut rng = StdRng::seed_from_u64(7);
        for denominator in [
            DenominatorType::Hundred,
            DenominatorType::TenThousand,
            DenominatorType::Million,
        ] {
            let p = FractionalPercent::new(0, denominator);
            assert!((0..1_000).all(|_| !p.evaluate(&mut rng)));
        }
    }

    #[test]
    fn test_full_or_above_always_fires() {
        let mut rng = StdRng::seed_from_u64(7);
        let full = FractionalPercent::new(10_000, DenominatorType::TenThousand);
        let above = FractionalPercent::new(250, DenominatorType::Hundred);
        assert!((0..1_000).all(|_| full.evaluate(&mut rng)));
        assert!((0..1_000).all(|_| above.evaluate(&mut rng)));
    }

    #[test]
    fn test_half_fires_roughly_half_the_time() {
        let mut rng = StdRng::seed_from_u64(42);
        let p = FractionalPercent::new(500_000, DenominatorType::Million);
        let hits = (0..10_000).filter(|_| p.evaluate(&mut rng)).count();
        assert!((4_500..5_500).contains(&hits), "hits = {}", hits);
    }

    #[test]
    fn test_deserialize_denominator_names() {
        let p: FractionalPercent =
            serde_json::from_str(r#"{"numerator": 5, "denominator": "TEN_THOUSAND"}"#).unwrap();
        assert_eq!(p, FractionalPercent::new(5, DenominatorType::TenThousand));

        let defaulted: FractionalPercent = serde_json::from_str(r#"{"numerator": 5}"#).unwrap();
        assert_eq!(defaulted.denominator, DenominatorType::Hundred);

        let bad = serde_json::from_str::<FractionalPercent>(
            r#"{"numerator": 5, "denominator": "THOUSAND"}"#,
        );
        assert!(bad.is_err());
    }
}
