//! Route solver collaborator.
//!
//! The pipeline only needs "matrix, vehicle count, depot in; closed tour
//! out". [`CheapestArcSolver`] builds the tour greedily from the depot by
//! always taking the cheapest arc to an unvisited node, then improves it
//! with 2-opt moves until none helps.

use ordered_float::OrderedFloat;
use thiserror::Error;

use crate::job::{DistanceMatrix, Route};

/// Improvements smaller than this are treated as no improvement.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

/// Upper bound on full 2-opt sweeps.
const MAX_TWO_OPT_PASSES: usize = 64;

/// Reasons a solver can fail to produce a route.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("Distance matrix is empty")]
    EmptyMatrix,

    #[error("Distance matrix is not square ({rows} rows, row {row} has {len} columns)")]
    NotSquare { rows: usize, row: usize, len: usize },

    #[error("Depot index {depot} is out of range for {locations} locations")]
    DepotOutOfRange { depot: usize, locations: usize },

    #[error("At least one vehicle is required")]
    NoVehicles,
}

/// Computes a visiting order for one job.
pub trait RouteSolver: Send + Sync {
    fn solve(
        &self,
        matrix: &DistanceMatrix,
        vehicle_count: u32,
        depot: usize,
    ) -> Result<Route, SolveError>;
}

/// Path-cheapest-arc construction followed by 2-opt improvement.
///
/// Only the first vehicle's route is produced; with no capacity or
/// fixed-cost constraints a single tour covers every location. Ties are
/// broken toward the lower node index, so output is deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheapestArcSolver {
    improve: bool,
}

impl CheapestArcSolver {
    pub fn new() -> Self {
        Self { improve: true }
    }

    /// Construction only, no 2-opt pass.
    pub fn construction_only() -> Self {
        Self { improve: false }
    }
}

impl RouteSolver for CheapestArcSolver {
    fn solve(
        &self,
        matrix: &DistanceMatrix,
        vehicle_count: u32,
        depot: usize,
    ) -> Result<Route, SolveError> {
        check_problem(matrix, vehicle_count, depot)?;

        let mut tour = cheapest_arc_tour(matrix, depot);
        if self.improve {
            two_opt(matrix, &mut tour);
        }
        Ok(Route::new(tour))
    }
}

fn check_problem(
    matrix: &DistanceMatrix,
    vehicle_count: u32,
    depot: usize,
) -> Result<(), SolveError> {
    let rows = matrix.dimension();
    if rows == 0 {
        return Err(SolveError::EmptyMatrix);
    }
    if let Some((row, cols)) = matrix
        .rows()
        .iter()
        .enumerate()
        .find(|(_, cols)| cols.len() != rows)
    {
        return Err(SolveError::NotSquare {
            rows,
            row,
            len: cols.len(),
        });
    }
    if depot >= rows {
        return Err(SolveError::DepotOutOfRange {
            depot,
            locations: rows,
        });
    }
    if vehicle_count == 0 {
        return Err(SolveError::NoVehicles);
    }
    Ok(())
}

fn cheapest_arc_tour(matrix: &DistanceMatrix, depot: usize) -> Vec<usize> {
    let n = matrix.dimension();
    let mut visited = vec![false; n];
    visited[depot] = true;

    let mut tour = Vec::with_capacity(n + 1);
    tour.push(depot);
    let mut current = depot;

    while let Some(next) = (0..n)
        .filter(|&node| !visited[node])
        .min_by_key(|&node| OrderedFloat(matrix.cost(current, node)))
    {
        visited[next] = true;
        tour.push(next);
        current = next;
    }

    tour.push(depot);
    tour
}

pub(crate) fn tour_cost(matrix: &DistanceMatrix, tour: &[usize]) -> f64 {
    tour.windows(2).map(|arc| matrix.cost(arc[0], arc[1])).sum()
}

/// Reverses inner segments while that shortens the closed tour. The depot
/// at both ends never moves.
///
/// Each candidate is priced from the two replaced arcs plus the change from
/// walking the segment backwards, which is zero for symmetric matrices and
/// is accumulated as the segment grows.
fn two_opt(matrix: &DistanceMatrix, tour: &mut [usize]) {
    let last = tour.len().saturating_sub(1);
    if last < 3 {
        return;
    }

    let d = |from: usize, to: usize| matrix.cost(from, to);
    for _ in 0..MAX_TWO_OPT_PASSES {
        let mut improved = false;
        for i in 1..last - 1 {
            let mut backwards = 0.0;
            for j in (i + 1)..last {
                backwards += d(tour[j], tour[j - 1]) - d(tour[j - 1], tour[j]);

                let (a, b, c, e) = (tour[i - 1], tour[i], tour[j], tour[j + 1]);
                let delta = d(a, c) + d(b, e) - d(a, b) - d(c, e) + backwards;
                if delta < -IMPROVEMENT_EPSILON {
                    tour[i..=j].reverse();
                    // The reversed segment now runs the other way.
                    backwards = -backwards;
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{distance_matrix, Location};

    fn line_matrix(points: &[f64]) -> DistanceMatrix {
        DistanceMatrix::new(
            points
                .iter()
                .map(|a| points.iter().map(|b| (a - b).abs()).collect())
                .collect(),
        )
    }

    #[test]
    fn test_route_is_closed_permutation() {
        let locations: Vec<Location> = (0..10)
            .map(|i| Location::new(i, (i as f64 * 1.7).sin(), (i as f64 * 0.9).cos()))
            .collect();
        let matrix = distance_matrix(&locations);

        let route = CheapestArcSolver::new().solve(&matrix, 1, 7).expect("solve");
        assert_eq!(route.len(), 11);
        assert!(route.is_closed_at(7));

        let mut inner: Vec<usize> = route.stops()[..10].to_vec();
        inner.sort_unstable();
        assert_eq!(inner, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_nearest_neighbour_construction() {
        let matrix = line_matrix(&[0.0, 10.0, 1.0, 5.0]);
        let route = CheapestArcSolver::construction_only()
            .solve(&matrix, 1, 0)
            .expect("solve");
        assert_eq!(route.stops(), &[0, 2, 3, 1, 0]);
    }

    #[test]
    fn test_ties_go_to_lower_index() {
        let matrix = line_matrix(&[0.0, 1.0, -1.0]);
        let route = CheapestArcSolver::construction_only()
            .solve(&matrix, 1, 0)
            .expect("solve");
        assert_eq!(route.stops()[1], 1);
    }

    #[test]
    fn test_two_opt_never_worse_than_construction() {
        let locations = vec![
            Location::new(0, 0.0, 0.0),
            Location::new(1, 0.0, 3.0),
            Location::new(2, 1.0, 0.5),
            Location::new(3, 4.0, 3.0),
            Location::new(4, 4.0, 0.0),
            Location::new(5, 2.0, 2.9),
        ];
        let matrix = distance_matrix(&locations);

        let greedy = CheapestArcSolver::construction_only()
            .solve(&matrix, 1, 0)
            .expect("solve");
        let improved = CheapestArcSolver::new().solve(&matrix, 1, 0).expect("solve");

        assert!(
            tour_cost(&matrix, improved.stops()) <= tour_cost(&matrix, greedy.stops()) + 1e-9
        );
        assert!(improved.is_closed_at(0));
    }

    fn scattered(n: usize) -> DistanceMatrix {
        let locations: Vec<Location> = (0..n)
            .map(|i| {
                let t = i as f64;
                Location::new(i as i64, (t * 12.9898).sin() * 50.0, (t * 78.233).cos() * 50.0)
            })
            .collect();
        distance_matrix(&locations)
    }

    fn assert_permutation(route: &Route, n: usize, depot: usize) {
        assert_eq!(route.len(), n + 1);
        assert!(route.is_closed_at(depot));
        let mut inner: Vec<usize> = route.stops()[..n].to_vec();
        inner.sort_unstable();
        assert_eq!(inner, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_two_opt_uncrosses_square() {
        // Corners of a unit square; construction from 0 crosses the diagonal.
        let matrix = DistanceMatrix::new(vec![
            vec![0.0, 1.0, 1.5, 1.0],
            vec![1.0, 0.0, 1.0, 1.5],
            vec![1.5, 1.0, 0.0, 1.0],
            vec![1.0, 1.5, 1.0, 0.0],
        ]);
        let crossed = vec![0, 2, 1, 3, 0];
        assert!((tour_cost(&matrix, &crossed) - 5.0).abs() < 1e-9);

        let mut tour = crossed;
        two_opt(&matrix, &mut tour);
        assert!((tour_cost(&matrix, &tour) - 4.0).abs() < 1e-9);
        assert_eq!((tour[0], tour[4]), (0, 0));
    }

    #[test]
    fn test_two_opt_handles_asymmetric_costs() {
        let n = 12;
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 0.0 } else { ((i * 7 + j * 13) % 11) as f64 + 1.0 })
                    .collect()
            })
            .collect();
        let matrix = DistanceMatrix::new(rows);

        let greedy = CheapestArcSolver::construction_only()
            .solve(&matrix, 1, 0)
            .expect("solve");
        let improved = CheapestArcSolver::new().solve(&matrix, 1, 0).expect("solve");

        assert_permutation(&improved, n, 0);
        assert!(
            tour_cost(&matrix, improved.stops()) <= tour_cost(&matrix, greedy.stops()) + 1e-9
        );
    }

    #[test]
    fn test_large_instance_solves_quickly() {
        let n = 300;
        let matrix = scattered(n);

        let started = std::time::Instant::now();
        let improved = CheapestArcSolver::new().solve(&matrix, 1, 0).expect("solve");
        let elapsed = started.elapsed();

        let greedy = CheapestArcSolver::construction_only()
            .solve(&matrix, 1, 0)
            .expect("solve");
        assert_permutation(&improved, n, 0);
        assert!(
            tour_cost(&matrix, improved.stops()) <= tour_cost(&matrix, greedy.stops()) + 1e-9
        );
        assert!(
            elapsed < std::time::Duration::from_secs(2),
            "solving {} locations took {:?}",
            n,
            elapsed
        );
    }

    #[test]
    fn test_solver_is_deterministic() {
        let matrix = line_matrix(&[3.0, 1.0, 4.0, 1.5, 9.0, 2.6]);
        let solver = CheapestArcSolver::new();
        assert_eq!(
            solver.solve(&matrix, 2, 2).expect("solve"),
            solver.solve(&matrix, 2, 2).expect("solve")
        );
    }

    #[test]
    fn test_single_location_tour() {
        let matrix = DistanceMatrix::new(vec![vec![0.0]]);
        let route = CheapestArcSolver::new().solve(&matrix, 1, 0).expect("solve");
        assert_eq!(route.stops(), &[0, 0]);
    }

    #[test]
    fn test_invalid_problems() {
        let solver = CheapestArcSolver::new();

        assert_eq!(
            solver.solve(&DistanceMatrix::new(vec![]), 1, 0),
            Err(SolveError::EmptyMatrix)
        );
        assert!(matches!(
            solver.solve(&DistanceMatrix::new(vec![vec![0.0, 1.0], vec![1.0]]), 1, 0),
            Err(SolveError::NotSquare { row: 1, len: 1, .. })
        ));
        assert_eq!(
            solver.solve(&line_matrix(&[0.0, 1.0]), 1, 2),
            Err(SolveError::DepotOutOfRange {
                depot: 2,
                locations: 2
            })
        );
        assert_eq!(
            solver.solve(&line_matrix(&[0.0, 1.0]), 0, 0),
            Err(SolveError::NoVehicles)
        );
    }
}
