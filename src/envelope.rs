//! Versioned wire envelopes for the two pipeline stages.
//!
//! Every message body is a JSON document tagged with a `kind` and a
//! `version`. Correlation travels inside the body, so a consumer always
//! decodes before it can act on a message.
//!
//! ```text
//! inbound : {"kind":"route_request","version":1,"correlationId":"..","distanceMatrix":[[..]],"vehicleCount":1,"depot":0}
//! outbound: {"kind":"route_result","version":1,"correlationId":"..","result":[0,3,1,2,0]}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::job::{CorrelationId, DistanceMatrix, Job, Route};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// A message body that can travel inside an envelope.
pub trait EnvelopeBody: Serialize + DeserializeOwned {
    /// Value of the `kind` tag.
    const KIND: &'static str;

    fn correlation_id(&self) -> &CorrelationId;

    /// Semantic checks run after a successful decode.
    fn validate(&self) -> Result<(), EnvelopeError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T> {
    kind: &'static str,
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    kind: String,
    version: u32,
}

/// Serializes `body` into its canonical envelope bytes.
pub fn encode<T: EnvelopeBody>(body: &T) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = EnvelopeOut {
        kind: T::KIND,
        version: ENVELOPE_VERSION,
        body,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parses and validates an envelope of the expected kind.
pub fn decode<T: EnvelopeBody>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)?;
    if header.kind != T::KIND {
        return Err(EnvelopeError::WrongKind {
            expected: T::KIND.to_string(),
            found: header.kind,
        });
    }
    if header.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(header.version));
    }

    let body: T = serde_json::from_slice(bytes)?;
    body.validate()?;
    Ok(body)
}

/// Inbound message: a job ready for the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub correlation_id: CorrelationId,
    pub distance_matrix: DistanceMatrix,
    pub vehicle_count: u32,
    pub depot: usize,
}

impl RouteRequest {
    /// Builds the inbound message for a job whose matrix has been computed.
    ///
    /// Returns `None` when the matrix is still missing.
    pub fn from_job(job: &Job) -> Option<Self> {
        let distance_matrix = job.distance_matrix.clone()?;
        Some(Self {
            correlation_id: job.correlation_id.clone(),
            distance_matrix,
            vehicle_count: job.submission.vehicle_count,
            depot: job.submission.depot,
        })
    }
}

impl EnvelopeBody for RouteRequest {
    const KIND: &'static str = "route_request";

    fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if !self.distance_matrix.is_square() {
            return Err(EnvelopeError::InvalidField {
                field: "distanceMatrix".to_string(),
                reason: "matrix is not square".to_string(),
            });
        }
        if let Some((i, j, value)) = self.distance_matrix.first_invalid_entry() {
            return Err(EnvelopeError::InvalidField {
                field: "distanceMatrix".to_string(),
                reason: format!("entry [{}][{}] = {} is not a non-negative number", i, j, value),
            });
        }
        if self.vehicle_count == 0 {
            return Err(EnvelopeError::InvalidField {
                field: "vehicleCount".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Outbound message: a solved route for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub correlation_id: CorrelationId,
    pub result: Route,
}

impl RouteResult {
    pub fn new(correlation_id: CorrelationId, result: Route) -> Self {
        Self {
            correlation_id,
            result,
        }
    }
}

impl EnvelopeBody for RouteResult {
    const KIND: &'static str = "route_result";

    fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}
