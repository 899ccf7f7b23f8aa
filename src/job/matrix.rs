//! Pairwise distance matrix.

use serde::{Deserialize, Serialize};

use super::Location;

/// Square matrix of pairwise travel costs; `cost(i, j)` is the cost of the
/// arc from location `i` to location `j`. Symmetry is not assumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistanceMatrix(Vec<Vec<f64>>);

impl DistanceMatrix {
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self(rows)
    }

    /// Number of rows.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn is_square(&self) -> bool {
        let n = self.0.len();
        self.0.iter().all(|row| row.len() == n)
    }

    /// Returns the first entry that is negative or not finite, as `(i, j, value)`.
    pub fn first_invalid_entry(&self) -> Option<(usize, usize, f64)> {
        self.0.iter().enumerate().find_map(|(i, row)| {
            row.iter()
                .enumerate()
                .find(|(_, v)| !v.is_finite() || **v < 0.0)
                .map(|(j, v)| (i, j, *v))
        })
    }

    /// Arc cost. Callers must stay within `dimension()`.
    pub fn cost(&self, from: usize, to: usize) -> f64 {
        self.0[from][to]
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.0
    }
}

/// Euclidean distance between two points over (lat, lon).
pub fn euclidean(a: &Location, b: &Location) -> f64 {
    let dlat = a.lat - b.lat;
    let dlon = a.lon - b.lon;
    (dlat * dlat + dlon * dlon).sqrt()
}

/// Builds the full n x n matrix for `locations`, in submission order.
pub fn distance_matrix(locations: &[Location]) -> DistanceMatrix {
    let rows = locations
        .iter()
        .map(|from| locations.iter().map(|to| euclidean(from, to)).collect())
        .collect();
    DistanceMatrix(rows)
}
