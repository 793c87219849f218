#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and observer-channel types for the policy-proof server.
//!
//! The analyze endpoints accept a boundary as a bare `GeoJSON` geometry,
//! a feature, or the first feature of a feature collection. The observer
//! channel exchanges small JSON frames; see [`ClientFrame`] and
//! [`ServerFrame`].

use geo::{Area as _, Centroid as _, Geometry, Polygon};
use policy_proof_srd_models::Period;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest array kept in a stored analysis context.
pub const MAX_CONTEXT_POINTS: usize = 200;

/// Body of `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    /// Always `true` while the server is answering.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Why a request carried no usable boundary.
#[derive(Debug, Error)]
pub enum BoundaryError {
    /// None of `geometry`, `feature`, or `featureCollection` held a
    /// geometry.
    #[error(
        "No valid GeoJSON geometry provided. Send {{ geometry }} or {{ feature }} or {{ featureCollection }}."
    )]
    Missing,

    /// The geometry could not be parsed.
    #[error("Invalid GeoJSON geometry: {message}")]
    Invalid {
        /// Parser message.
        message: String,
    },

    /// The geometry has no polygon in it.
    #[error("Boundary must be a polygon, got {kind}")]
    NotPolygon {
        /// Geometry type that was sent.
        kind: String,
    },

    /// The polygon encloses no area.
    #[error("Boundary polygon is empty or degenerate")]
    Empty,
}

/// Body of `POST /api/analyze` and `POST /api/analyze/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    /// A bare `GeoJSON` geometry.
    #[serde(default)]
    pub geometry: Option<serde_json::Value>,
    /// A `GeoJSON` feature.
    #[serde(default)]
    pub feature: Option<serde_json::Value>,
    /// A `GeoJSON` feature collection; only its first feature is used.
    #[serde(default)]
    pub feature_collection: Option<serde_json::Value>,
    /// Free-form policy label echoed in the result.
    #[serde(default)]
    pub policy: Option<String>,
    /// Period the statistics are aggregated over.
    #[serde(default)]
    pub period: Option<Period>,
}

/// Treats `null`, `{}`, and `[]` as absent.
fn present(value: Option<&serde_json::Value>) -> Option<&serde_json::Value> {
    value.filter(|v| match v {
        serde_json::Value::Null => false,
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        _ => true,
    })
}

impl AnalyzeRequest {
    /// The raw geometry object, looked up in `geometry`, then
    /// `feature.geometry`, then `featureCollection.features[0].geometry`.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError::Missing`] if none is present.
    pub fn geojson_geometry(&self) -> Result<&serde_json::Value, BoundaryError> {
        present(self.geometry.as_ref())
            .or_else(|| present(self.feature.as_ref().and_then(|f| f.get("geometry"))))
            .or_else(|| {
                present(
                    self.feature_collection
                        .as_ref()
                        .and_then(|fc| fc.get("features"))
                        .and_then(|features| features.get(0))
                        .and_then(|feature| feature.get("geometry")),
                )
            })
            .ok_or(BoundaryError::Missing)
    }

    /// Resolves the request to a single boundary polygon. A multi-polygon
    /// or geometry collection contributes its first polygon.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError`] if no geometry is present, it does not
    /// parse, it contains no polygon, or the polygon encloses no area.
    pub fn boundary(&self) -> Result<Polygon<f64>, BoundaryError> {
        let raw = self.geojson_geometry()?;
        let kind = raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let parsed: geojson::Geometry =
            serde_json::from_value(raw.clone()).map_err(|e| BoundaryError::Invalid {
                message: e.to_string(),
            })?;

        let geometry: Geometry<f64> =
            parsed
                .try_into()
                .map_err(|e: geojson::Error| BoundaryError::Invalid {
                    message: e.to_string(),
                })?;

        let polygon = first_polygon(geometry).ok_or(BoundaryError::NotPolygon { kind })?;

        // Fewer than four positions cannot close a ring.
        if polygon.exterior().0.len() < 4
            || polygon.centroid().is_none()
            || polygon.unsigned_area() <= 0.0
        {
            return Err(BoundaryError::Empty);
        }

        Ok(polygon)
    }

    /// The requested period, or `default` when none was sent.
    #[must_use]
    pub fn period_or(&self, default: &str) -> Period {
        self.period
            .clone()
            .filter(|p| !p.as_str().trim().is_empty())
            .unwrap_or_else(|| Period::from(default))
    }
}

fn first_polygon(geometry: Geometry<f64>) -> Option<Polygon<f64>> {
    match geometry {
        Geometry::Polygon(polygon) => Some(polygon),
        Geometry::MultiPolygon(multi) => multi.0.into_iter().next(),
        Geometry::Rect(rect) => Some(rect.to_polygon()),
        Geometry::GeometryCollection(collection) => {
            collection.0.into_iter().find_map(first_polygon)
        }
        _ => None,
    }
}

/// A frame pushed to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Status or progress notice.
    Info {
        /// Human-readable text.
        message: String,
    },
    /// Reply to a chat message.
    Message {
        /// Reply text.
        message: String,
    },
    /// Failure notice.
    Error {
        /// Human-readable text.
        message: String,
    },
}

impl ServerFrame {
    /// An `info` frame.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    /// A `message` frame.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// An `error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// A frame received from an observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Text for the assistant.
    Chat(String),
    /// Liveness ping; no reply.
    KeepAlive,
    /// Replacement analysis context.
    Context(AnalysisContext),
    /// Anything else.
    Invalid,
}

const TEXT_KEYS: [&str; 3] = ["message", "text", "content"];

impl ClientFrame {
    /// Parses a text frame. Text that is not JSON is taken as a chat
    /// message verbatim.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Self::Chat(raw.to_string());
        };

        match value {
            serde_json::Value::String(text) => Self::Chat(text),
            serde_json::Value::Object(object) => {
                match object.get("type").and_then(serde_json::Value::as_str) {
                    Some("ping" | "keepalive" | "heartbeat") => return Self::KeepAlive,
                    Some("context" | "analysis_context") => {
                        return ["analysis", "context"]
                            .iter()
                            .find_map(|key| object.get(*key).filter(|v| v.is_object()))
                            .map_or(Self::Invalid, |v| {
                                Self::Context(AnalysisContext::new(v.clone()))
                            });
                    }
                    _ => {}
                }

                TEXT_KEYS
                    .iter()
                    .find_map(|key| object.get(*key).and_then(serde_json::Value::as_str))
                    .map_or(Self::Invalid, |text| Self::Chat(text.to_string()))
            }
            _ => Self::Invalid,
        }
    }
}

/// Summary of an analysis a client is looking at, attached to its
/// observer connection.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisContext {
    summary: serde_json::Value,
}

impl AnalysisContext {
    /// Stores `summary`, thinning every array longer than
    /// [`MAX_CONTEXT_POINTS`].
    #[must_use]
    pub fn new(mut summary: serde_json::Value) -> Self {
        thin_arrays(&mut summary, MAX_CONTEXT_POINTS);
        Self { summary }
    }

    /// The stored summary.
    #[must_use]
    pub const fn summary(&self) -> &serde_json::Value {
        &self.summary
    }

    /// `impact_score` of the summary, if present.
    #[must_use]
    pub fn impact_score(&self) -> Option<f64> {
        self.summary
            .get("impact_score")
            .and_then(serde_json::Value::as_f64)
    }

    /// `policy` of the summary, if present.
    #[must_use]
    pub fn policy(&self) -> Option<&str> {
        self.summary.get("policy").and_then(serde_json::Value::as_str)
    }

    /// Number of entries in the summary's `points` array.
    #[must_use]
    pub fn point_count(&self) -> Option<usize> {
        self.summary
            .get("points")
            .and_then(serde_json::Value::as_array)
            .map(Vec::len)
    }
}

/// Picks `max` items at a uniform stride, always keeping the first and
/// last and preserving order.
#[must_use]
pub fn uniform_sample<T: Clone>(items: &[T], max: usize) -> Vec<T> {
    if items.len() <= max {
        return items.to_vec();
    }
    match max {
        0 => Vec::new(),
        1 => items[..1].to_vec(),
        _ => {
            let last = items.len() - 1;
            (0..max)
                .map(|i| items[i * last / (max - 1)].clone())
                .collect()
        }
    }
}

fn thin_arrays(value: &mut serde_json::Value, max: usize) {
    match value {
        serde_json::Value::Array(items) => {
            if items.len() > max {
                *items = uniform_sample(items, max);
            }
            for item in items.iter_mut() {
                thin_arrays(item, max);
            }
        }
        serde_json::Value::Object(object) => {
            for child in object.values_mut() {
                thin_arrays(child, max);
            }
        }
        _ => {}
    }
}
