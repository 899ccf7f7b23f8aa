//! Job definitions for the dispatch pipeline.
//!
//! This module defines the data that flows through the pipeline:
//!
//! - `CorrelationId`: the identity minted at admission that ties the inbound
//!   message, the outbound message and the cached result together
//! - `JobSubmission`: the client-submitted job description
//! - `Job`: a submission bound to its correlation id, plus its distance
//!   matrix once computed
//! - `Route`: the solved visiting order

pub mod matrix;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use matrix::{distance_matrix, DistanceMatrix};

/// Reasons a raw string is not a usable correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationIdError {
    #[error("correlation id is empty")]
    Empty,

    #[error("correlation id '{0}' is not a hyphenated token")]
    Malformed(String),
}

/// Opaque identifier minted once per submission.
///
/// Ids are generated as hyphenated UUID v4 strings. Parsing only checks the
/// format (non-empty, hyphen-containing), never existence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mints a fresh, never-before-used id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Checks that `raw` has the shape of a correlation id.
    pub fn parse(raw: &str) -> Result<Self, CorrelationIdError> {
        if raw.is_empty() {
            return Err(CorrelationIdError::Empty);
        }
        if !raw.contains('-') {
            return Err(CorrelationIdError::Malformed(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = CorrelationIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Client-chosen location identifier; need not equal the location's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocationId {
    Number(i64),
    Text(String),
}

/// A geographic point to visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(id: i64, lat: f64, lon: f64) -> Self {
        Self {
            id: LocationId::Number(id),
            lat,
            lon,
        }
    }
}

/// Job description as submitted by a client.
///
/// Field names follow the public API; the aliases accept the payloads of
/// older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(alias = "geographical_coordinations")]
    pub locations: Vec<Location>,
    #[serde(alias = "num_vehicles")]
    pub vehicle_count: u32,
    /// Position in `locations` where every route starts and ends. Range is
    /// the caller's responsibility; the solver rejects out-of-range depots.
    #[serde(alias = "depot_index")]
    pub depot: usize,
}

impl JobSubmission {
    pub fn new(locations: Vec<Location>, vehicle_count: u32, depot: usize) -> Self {
        Self {
            locations,
            vehicle_count,
            depot,
        }
    }

    /// Returns a description of the first shape problem, if any.
    pub fn shape_problem(&self) -> Option<String> {
        if self.locations.is_empty() {
            return Some("locations must not be empty".to_string());
        }
        if self.vehicle_count == 0 {
            return Some("vehicle_count must be positive".to_string());
        }
        if let Some(loc) = self
            .locations
            .iter()
            .find(|l| !l.lat.is_finite() || !l.lon.is_finite())
        {
            return Some(format!("location {:?} has non-finite coordinates", loc.id));
        }
        None
    }
}

/// A submission bound to its correlation id.
///
/// A job has no result while it is on the pipeline; once solved it only
/// exists as a result store entry keyed by `correlation_id`.
#[derive(Debug, Clone)]
pub struct Job {
    pub correlation_id: CorrelationId,
    pub submission: JobSubmission,
    pub distance_matrix: Option<DistanceMatrix>,
}

impl Job {
    /// Binds a submission to a freshly minted correlation id.
    pub fn admit(submission: JobSubmission) -> Self {
        Self {
            correlation_id: CorrelationId::generate(),
            submission,
            distance_matrix: None,
        }
    }

    /// Computes and attaches the pairwise distance matrix.
    pub fn with_distance_matrix(mut self) -> Self {
        self.distance_matrix = Some(distance_matrix(&self.submission.locations));
        self
    }
}

/// Ordered location indices, starting and ending at the depot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Route(Vec<usize>);

impl Route {
    pub fn new(stops: Vec<usize>) -> Self {
        Self(stops)
    }

    pub fn stops(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the route is a closed tour around `depot`.
    pub fn is_closed_at(&self, depot: usize) -> bool {
        self.0.first() == Some(&depot) && self.0.last() == Some(&depot)
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }
}

impl From<Vec<usize>> for Route {
    fn from(stops: Vec<usize>) -> Self {
        Self(stops)
    }
}
