//! Aggregation methods used when propagating points into a coarser archive.
//!
//! Mirrors `kenshin/agg.py`'s `Agg` class: a fixed, ordered list of method
//! names whose index is the `agg_id` stored in a bundle's header.

use crate::kenshin::error::KenshinError;

/// An aggregation method, as persisted in a bundle header's `agg_id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agg {
    Average,
    Sum,
    Last,
    Max,
    Min,
}

impl Agg {
    /// Order matches `Agg.agg_types` in the Python source; the index is
    /// what gets packed as `agg_id`.
    const ORDER: [Agg; 5] = [Agg::Average, Agg::Sum, Agg::Last, Agg::Max, Agg::Min];

    pub fn from_name(name: &str) -> Result<Agg, KenshinError> {
        match name {
            "avg" => Ok(Agg::Average),
            "sum" => Ok(Agg::Sum),
            "last" => Ok(Agg::Last),
            "max" => Ok(Agg::Max),
            "min" => Ok(Agg::Min),
            other => Err(KenshinError::UnknownAgg(other.to_string())),
        }
    }

    pub fn from_id(id: u32) -> Result<Agg, KenshinError> {
        Self::ORDER
            .get(id as usize)
            .copied()
            .ok_or_else(|| KenshinError::UnknownAgg(format!("agg_id {}", id)))
    }

    pub fn name(self) -> &'static str {
        match self {
            Agg::Average => "avg",
            Agg::Sum => "sum",
            Agg::Last => "last",
            Agg::Max => "max",
            Agg::Min => "min",
        }
    }

    pub fn id(self) -> u32 {
        Self::ORDER.iter().position(|a| *a == self).unwrap() as u32
    }

    /// Aggregate a list of present values (`NULL_VALUE` already filtered out
    /// by the caller) down to one value for the coarser archive's row.
    pub fn aggregate(self, values: &[f64]) -> f64 {
        match self {
            Agg::Average => values.iter().sum::<f64>() / values.len() as f64,
            Agg::Sum => values.iter().sum(),
            Agg::Last => *values.last().unwrap(),
            Agg::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Agg::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_id() {
        for agg in Agg::ORDER {
            assert_eq!(Agg::from_id(agg.id()).unwrap(), agg);
            assert_eq!(Agg::from_name(agg.name()).unwrap(), agg);
        }
    }

    #[test]
    fn unknown_name_errors() {
        assert!(Agg::from_name("median").is_err());
    }

    #[test]
    fn aggregates_match_expected_functions() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(Agg::Average.aggregate(&values), 2.5);
        assert_eq!(Agg::Sum.aggregate(&values), 10.0);
        assert_eq!(Agg::Last.aggregate(&values), 4.0);
        assert_eq!(Agg::Max.aggregate(&values), 4.0);
        assert_eq!(Agg::Min.aggregate(&values), 1.0);
    }
}
